//! 発音評価リクエストの組み立て
//!
//! 評価設定（`AssessmentConfig`）を JSON にし、設定に応じてヘッダーかクエリ文字列に載せる。
//! 実際の送信は `client` 側で行う。
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;

use crate::audio::NormalizedAudio;
use crate::config::{AssessmentOptions, AssessmentTransport, ProviderConfig, SubscriptionKey};
use crate::error::{RelayError, RelayResult};

// HeaderMap に静的文字列で渡すヘッダー名は小文字でなければならない
pub const SUBSCRIPTION_KEY_HEADER: &str = "ocp-apim-subscription-key";
pub const ASSESSMENT_HEADER: &str = "pronunciation-assessment";
pub const ASSESSMENT_QUERY_PARAM: &str = "pronunciationAssessment";
pub const WAV_CONTENT_TYPE: &str = "audio/wav; codecs=audio/pcm; samplerate=16000";

pub const GRADING_SYSTEM: &str = "HundredMark";
pub const GRANULARITY: &str = "Phoneme";
pub const DIMENSION: &str = "Comprehensive";

/// プロバイダへ渡す評価設定
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssessmentConfig {
    pub reference_text: String,
    pub grading_system: &'static str,
    pub granularity: &'static str,
    pub dimension: &'static str,
    pub enable_miscue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phoneme_alphabet: Option<String>,
}

impl AssessmentConfig {
    /// 参照テキストは空白だけの場合も拒否する。受け付けた値は加工せずそのまま使う
    pub fn new(reference_text: &str, options: &AssessmentOptions) -> RelayResult<Self> {
        if reference_text.trim().is_empty() {
            return Err(RelayError::MissingReferenceText);
        }

        Ok(Self {
            reference_text: reference_text.to_string(),
            grading_system: GRADING_SYSTEM,
            granularity: GRANULARITY,
            dimension: DIMENSION,
            enable_miscue: options.enable_miscue,
            phoneme_alphabet: options
                .phoneme_alphabet
                .as_ref()
                .map(|alphabet| alphabet.trim().to_string())
                .filter(|alphabet| !alphabet.is_empty()),
        })
    }

    /// 1行の JSON
    pub fn to_compact_json(&self) -> RelayResult<String> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::RequestBuild(format!("failed to serialize assessment config: {}", e)))
    }
}

/// クエリ文字列を組み立てる（値はパーセントエンコード）
pub fn build_query(
    provider: &ProviderConfig,
    assessment_json: &str,
) -> String {
    let mut pairs = vec![format!("language={}", urlencoding::encode(&provider.language))];

    if provider.detailed_response {
        pairs.push("format=detailed".to_string());
    }

    if provider.transport == AssessmentTransport::Query {
        pairs.push(format!(
            "{}={}",
            ASSESSMENT_QUERY_PARAM,
            urlencoding::encode(assessment_json)
        ));
    }

    pairs.join("&")
}

/// 送信先の完全な URL
pub fn build_url(provider: &ProviderConfig, assessment_json: &str) -> String {
    let endpoint = provider.endpoint_url();
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}{}", endpoint, separator, build_query(provider, assessment_json))
}

/// 送信ヘッダー
pub fn build_headers(
    provider: &ProviderConfig,
    key: &SubscriptionKey,
    assessment_json: &str,
) -> RelayResult<HeaderMap> {
    let mut headers = HeaderMap::new();

    let mut key_value = HeaderValue::from_str(key.expose())
        .map_err(|_| RelayError::RequestBuild("subscription key is not a valid header value".to_string()))?;
    key_value.set_sensitive(true);
    headers.insert(SUBSCRIPTION_KEY_HEADER, key_value);

    headers.insert(CONTENT_TYPE, HeaderValue::from_static(WAV_CONTENT_TYPE));

    if provider.transport == AssessmentTransport::Header {
        // 参照テキストに非 ASCII 文字が含まれることがあるので from_bytes を使う
        let value = HeaderValue::from_bytes(assessment_json.as_bytes()).map_err(|e| {
            RelayError::RequestBuild(format!("assessment config is not a valid header value: {}", e))
        })?;
        headers.insert(ASSESSMENT_HEADER, value);
    }

    Ok(headers)
}

/// 送信可能な `reqwest::Request` を組み立てる
///
/// ネットワークには触れないので、送信前の形（URL・ヘッダー・本文）を検証できる。
pub fn build_request(
    http: &reqwest::Client,
    provider: &ProviderConfig,
    key: &SubscriptionKey,
    config: &AssessmentConfig,
    audio: NormalizedAudio,
) -> RelayResult<reqwest::Request> {
    let assessment_json = config.to_compact_json()?;
    let url = build_url(provider, &assessment_json);
    let headers = build_headers(provider, key, &assessment_json)?;

    http.post(url)
        .headers(headers)
        .body(audio.into_bytes())
        .build()
        .map_err(|e| RelayError::RequestBuild(e.to_string()))
}
