//! リレー処理のエラー定義と HTTP レスポンスへの変換
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

use crate::models::ErrorResponse;

pub type RelayResult<T> = Result<T, RelayError>;

/// 音声の正規化（デコード・リサンプル・再エンコード）の失敗
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("unrecognized audio container")]
    Probe(#[source] symphonia::core::errors::Error),
    #[error("no decodable audio track found")]
    NoAudioTrack,
    #[error("audio track does not declare a sample rate")]
    MissingSampleRate,
    #[error("unsupported codec")]
    UnsupportedCodec(#[source] symphonia::core::errors::Error),
    #[error("failed to decode audio packet")]
    Decode(#[source] symphonia::core::errors::Error),
    #[error("failed to decode opus packet")]
    Opus(#[source] audiopus::Error),
    #[error("decoder panicked on malformed input: {0}")]
    Panicked(String),
    #[error("decoded stream contained no samples")]
    NoSamples,
    #[error("failed to resample audio: {0}")]
    Resample(String),
    #[error("failed to encode wav")]
    Encode(#[source] hound::Error),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("audio file is missing or empty")]
    EmptyAudio,
    #[error("reference text is missing or empty")]
    MissingReferenceText,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("audio could not be transcoded: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("assessment provider returned HTTP {status}")]
    Upstream { status: u16, body: String },
    #[error("failed to reach assessment provider")]
    Transport(#[from] reqwest::Error),
    #[error("assessment provider returned a malformed response")]
    MalformedResponse(#[source] serde_json::Error),
    #[error("failed to build provider request: {0}")]
    RequestBuild(String),
    #[error("GET not supported without debug=true")]
    DebugDisabled,
    #[error("debug sample not available: {path}")]
    DebugSampleUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::EmptyAudio
            | RelayError::MissingReferenceText
            | RelayError::InvalidRequest(_)
            | RelayError::Transcode(_) => StatusCode::BAD_REQUEST,
            // プロバイダのステータスをそのまま返す。エラーでないコードは 502 に寄せる
            RelayError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|code| code.is_client_error() || code.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            RelayError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
            RelayError::RequestBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::DebugDisabled => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::DebugSampleUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::EmptyAudio => "EMPTY_AUDIO",
            RelayError::MissingReferenceText => "MISSING_REFERENCE_TEXT",
            RelayError::InvalidRequest(_) => "INVALID_INPUT",
            RelayError::Transcode(_) => "TRANSCODE_FAILED",
            RelayError::Upstream { .. } => "UPSTREAM_ERROR",
            RelayError::Transport(_) => "TRANSPORT_ERROR",
            RelayError::MalformedResponse(_) => "MALFORMED_UPSTREAM_RESPONSE",
            RelayError::RequestBuild(_) | RelayError::Internal(_) => "INTERNAL_ERROR",
            RelayError::DebugDisabled => "DEBUG_DISABLED",
            RelayError::DebugSampleUnavailable { .. } => "DEBUG_SAMPLE_UNAVAILABLE",
        }
    }

    /// クライアント向けの診断文字列
    pub fn details(&self) -> Option<String> {
        match self {
            RelayError::Upstream { body, .. } => Some(body.clone()),
            RelayError::Transcode(err) => Some(error_chain(err)),
            RelayError::Transport(err) => Some(error_chain(err)),
            RelayError::MalformedResponse(err) => Some(err.to_string()),
            RelayError::DebugSampleUnavailable { source, .. } => Some(source.to_string()),
            _ => None,
        }
    }
}

/// `source()` をたどってエラーの連鎖を1行にまとめる
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        current = cause.source();
    }
    message
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
            details: self.details(),
        };

        (status, Json(body)).into_response()
    }
}
