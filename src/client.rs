use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::value::RawValue;
use tracing::{debug, info, warn};

use crate::assessment::{build_request, AssessmentConfig};
use crate::audio::NormalizedAudio;
use crate::config::{AssessmentOptions, Config, ProviderConfig, SubscriptionKey};
use crate::error::{RelayError, RelayResult};

/// プロバイダの JSON をそのまま保持した結果
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct UpstreamResult(Box<RawValue>);

impl UpstreamResult {
    /// 本文が JSON であることだけ確認し、中身には手を加えない
    pub fn from_body(body: &str) -> RelayResult<Self> {
        let raw = serde_json::from_str::<Box<RawValue>>(body).map_err(RelayError::MalformedResponse)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

/// 発音評価プロバイダへのクライアント
#[derive(Debug, Clone)]
pub struct AssessmentClient {
    http: reqwest::Client,
    provider: ProviderConfig,
    key: SubscriptionKey,
    options: AssessmentOptions,
}

impl AssessmentClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let key = config
            .provider
            .subscription_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("provider subscription key is not set"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.provider.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.provider.connect_timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {}", e))?;

        Ok(Self {
            http,
            provider: config.provider.clone(),
            key,
            options: config.assessment.clone(),
        })
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// 送信前のリクエストを組み立てる
    pub fn prepare(
        &self,
        audio: NormalizedAudio,
        reference_text: &str,
    ) -> RelayResult<reqwest::Request> {
        let config = AssessmentConfig::new(reference_text, &self.options)?;
        build_request(&self.http, &self.provider, &self.key, &config, audio)
    }

    /// 正規化済み音声を評価に出す。再試行はしない
    pub async fn assess(
        &self,
        audio: NormalizedAudio,
        reference_text: &str,
    ) -> RelayResult<UpstreamResult> {
        let audio_bytes = audio.len();
        let duration_ms = audio.duration_ms();
        let request = self.prepare(audio, reference_text)?;

        // URL にキーは含まれない（キーはヘッダーのみ）
        info!(
            url = %request.url(),
            audio_bytes,
            duration_ms,
            transport = ?self.provider.transport,
            "sending assessment request"
        );

        let started = Instant::now();
        let response = self.http.execute(request).await?;
        let status = response.status();
        let body = response.text().await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            warn!(status = status.as_u16(), elapsed_ms, "assessment provider returned an error");
            debug!(body = %body, "provider error body");
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        info!(status = status.as_u16(), elapsed_ms, "assessment completed");
        debug!(body = %body, "provider response body");

        UpstreamResult::from_body(&body)
    }
}
