use crate::audio::{panic_message, AudioNormalizer};
use crate::client::{AssessmentClient, UpstreamResult};
use crate::config::Config;
use crate::error::{RelayError, RelayResult, TranscodeError};
use crate::models::*;
use axum::{
    extract::{Multipart, Query, State},
    response::{Html, Json},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

// =============================================================================
// Application State
// - 設定・正規化器・プロバイダクライアントを共有（いずれも読み取り専用）
// - リクエスト間で書き換える状態は持たない
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub normalizer: Arc<AudioNormalizer>,
    pub client: AssessmentClient,
    pub start_time: Arc<Instant>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = AssessmentClient::new(&config)?;
        let normalizer = AudioNormalizer::new(&config.audio);

        Ok(Self {
            config: Arc::new(config),
            normalizer: Arc::new(normalizer),
            client,
            start_time: Arc::new(Instant::now()),
        })
    }
}

// =============================================================================
// Request Handlers
// =============================================================================

/// 発音評価エンドポイント
/// - `audio`: 録音データ（ファイルパート）
/// - `text`: 参照テキスト
pub async fn assess(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> RelayResult<Json<UpstreamResult>> {
    let mut audio: Option<RawAudio> = None;
    let mut reference_text: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::InvalidRequest(format!("failed to parse multipart body: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "audio" => {
                let hint = format_hint_from(field.file_name(), field.content_type());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| RelayError::InvalidRequest(format!("failed to read audio field: {}", e)))?;
                audio = Some(RawAudio::new(bytes.to_vec()).with_hint(hint));
            }
            "text" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| RelayError::InvalidRequest(format!("failed to read text field: {}", e)))?;
                reference_text = Some(text);
            }
            _ => {} // 未知のフィールドは無視
        }
    }

    // ネットワークや正規化に進む前に入力を検証する
    let audio = audio.filter(|a| !a.is_empty()).ok_or(RelayError::EmptyAudio)?;
    let reference_text = reference_text
        .filter(|t| !t.trim().is_empty())
        .ok_or(RelayError::MissingReferenceText)?;

    run_assessment(&state, audio, &reference_text).await
}

/// `GET /assess?debug=true`
pub async fn assess_debug(
    State(state): State<AppState>,
    Query(query): Query<DebugQuery>,
) -> RelayResult<Json<UpstreamResult>> {
    if !query.is_debug() || !state.config.debug.enabled {
        return Err(RelayError::DebugDisabled);
    }

    assess_debug_sample(&state).await
}

/// `GET /debug`
pub async fn debug_sample(State(state): State<AppState>) -> RelayResult<Json<UpstreamResult>> {
    if !state.config.debug.enabled {
        return Err(RelayError::DebugDisabled);
    }

    assess_debug_sample(&state).await
}

/// サーバー上のサンプル音声を固定の参照テキストで評価
async fn assess_debug_sample(state: &AppState) -> RelayResult<Json<UpstreamResult>> {
    let path = state.config.debug.sample_path.clone();
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| RelayError::DebugSampleUnavailable {
            path: path.clone(),
            source,
        })?;

    let hint = format_hint_from(Some(path.as_str()), None);
    let audio = RawAudio::new(bytes).with_hint(hint);
    let reference_text = state.config.debug.reference_text.clone();

    run_assessment(state, audio, &reference_text).await
}

/// 正規化 → プロバイダ呼び出しの共通処理
async fn run_assessment(
    state: &AppState,
    audio: RawAudio,
    reference_text: &str,
) -> RelayResult<Json<UpstreamResult>> {
    let start_time = Instant::now();
    let upload_bytes = audio.bytes.len();

    // デコード/リサンプリングは重いので `spawn_blocking`
    let normalizer = Arc::clone(&state.normalizer);
    let normalized = tokio::task::spawn_blocking(move || {
        normalizer.normalize(&audio.bytes, audio.format_hint.as_deref())
    })
    .await
    .map_err(|e| {
        if e.is_panic() {
            RelayError::Transcode(TranscodeError::Panicked(panic_message(e.into_panic().as_ref())))
        } else {
            RelayError::Internal(format!("transcode task failed: {}", e))
        }
    })?;

    let normalized = match normalized {
        Ok(normalized) => normalized,
        Err(e) => {
            warn!(error = %e, upload_bytes, "audio normalization failed");
            return Err(e);
        }
    };

    info!(
        upload_bytes,
        normalized_bytes = normalized.len(),
        duration_ms = normalized.duration_ms(),
        "audio normalized"
    );

    let result = state.client.assess(normalized, reference_text).await;

    match &result {
        Ok(_) => info!(
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "assessment relayed"
        ),
        Err(e) => warn!(error = %e, "assessment failed"),
    }

    result.map(Json)
}

/// ヘルスチェックエンドポイント
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        region: state.config.provider.region.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// 録音して `/assess` に送るだけの確認用ページ
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Pronunciation Assessment</title>
</head>
<body>
    <h1>Pronunciation Assessment</h1>
    <p><input id="text" size="48" value="Hello, how are you?"></p>
    <p>
        <button id="start">Record</button>
        <button id="stop" disabled>Stop &amp; assess</button>
    </p>
    <pre id="result"></pre>
    <script>
        let recorder;
        let chunks = [];
        const result = document.getElementById('result');
        const start = document.getElementById('start');
        const stop = document.getElementById('stop');

        start.onclick = async () => {
            const stream = await navigator.mediaDevices.getUserMedia({ audio: true });
            recorder = new MediaRecorder(stream);
            chunks = [];
            recorder.ondataavailable = (e) => chunks.push(e.data);
            recorder.onstop = async () => {
                stream.getTracks().forEach((t) => t.stop());
                const blob = new Blob(chunks, { type: recorder.mimeType });
                const form = new FormData();
                form.append('audio', blob, 'recording.webm');
                form.append('text', document.getElementById('text').value);
                result.textContent = 'Assessing...';
                const response = await fetch('/assess', { method: 'POST', body: form });
                result.textContent = JSON.stringify(await response.json(), null, 2);
            };
            recorder.start();
            start.disabled = true;
            stop.disabled = false;
        };

        stop.onclick = () => {
            recorder.stop();
            start.disabled = false;
            stop.disabled = true;
        };
    </script>
</body>
</html>
"#;
