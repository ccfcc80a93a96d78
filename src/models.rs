use serde::{Deserialize, Serialize};

// =============================================================================
// API Request/Response Models
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub region: String,
    pub uptime_seconds: u64,
}

/// `GET /assess?debug=true`
#[derive(Debug, Default, Deserialize)]
pub struct DebugQuery {
    #[serde(default)]
    pub debug: Option<String>,
}

impl DebugQuery {
    pub fn is_debug(&self) -> bool {
        matches!(self.debug.as_deref(), Some("true"))
    }
}

/// アップロードされた生の音声データ
#[derive(Debug, Clone)]
pub struct RawAudio {
    pub bytes: Vec<u8>,
    /// 拡張子やMIMEサブタイプから得たコンテナ形式のヒント
    pub format_hint: Option<String>,
}

impl RawAudio {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            format_hint: None,
        }
    }

    pub fn with_hint(mut self, hint: Option<String>) -> Self {
        self.format_hint = hint;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// ファイル名の拡張子、なければ Content-Type のサブタイプからヒントを作る
///
/// `audio/webm;codecs=opus` のようなパラメータ付きの値も受け付ける。
pub fn format_hint_from(file_name: Option<&str>, content_type: Option<&str>) -> Option<String> {
    let from_name = file_name
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty());

    from_name.or_else(|| {
        content_type
            .and_then(|ct| ct.split(';').next())
            .and_then(|mime| mime.trim().split('/').nth(1))
            .map(|sub| sub.trim().to_ascii_lowercase())
            .map(|sub| match sub.as_str() {
                "x-wav" | "wave" | "vnd.wave" => "wav".to_string(),
                "mpeg" => "mp3".to_string(),
                "mp4" | "x-m4a" => "m4a".to_string(),
                _ => sub,
            })
            .filter(|sub| !sub.is_empty() && sub != "octet-stream")
    })
}
