use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// 設定ファイルのパスを指す環境変数名
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";
/// サブスクリプションキーを指す環境変数名
pub const SUBSCRIPTION_KEY_ENV: &str = "AZURE_SPEECH_KEY";
/// リージョンを指す環境変数名
pub const REGION_ENV: &str = "AZURE_REGION";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub assessment: AssessmentOptions,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default = "ServerConfig::default_max_request_size_mb")]
    pub max_request_size_mb: u64,
}

/// アセスメントプロバイダ（Azure Speech）への接続設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// 秘密情報のため設定ファイルには書き出さない（環境変数から注入）
    #[serde(default, skip_serializing)]
    pub subscription_key: Option<SubscriptionKey>,
    #[serde(default = "ProviderConfig::default_region")]
    pub region: String,
    #[serde(default = "ProviderConfig::default_host")]
    pub host: String,
    /// 完全なエンドポイントURLの上書き（テスト・ソブリンクラウド用）
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "ProviderConfig::default_language")]
    pub language: String,
    #[serde(default)]
    pub transport: AssessmentTransport,
    #[serde(default)]
    pub detailed_response: bool,
    #[serde(default = "ProviderConfig::default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "ProviderConfig::default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

/// アセスメント設定の送り先
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentTransport {
    /// `Pronunciation-Assessment` ヘッダーにJSONをそのまま載せる
    #[default]
    Header,
    /// URLエンコードしてクエリ文字列に載せる
    Query,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssessmentOptions {
    #[serde(default)]
    pub enable_miscue: bool,
    #[serde(default)]
    pub phoneme_alphabet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// アップロードに拡張子が無い場合に仮定するコンテナ形式
    #[serde(default = "AudioConfig::default_source_format")]
    pub source_format: String,
    #[serde(default)]
    pub silence: SilenceConfig,
}

/// 無音区間除去のパラメータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceConfig {
    #[serde(default = "SilenceConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "SilenceConfig::default_threshold_dbfs")]
    pub threshold_dbfs: f32,
    #[serde(default = "SilenceConfig::default_min_silence_ms")]
    pub min_silence_ms: u32,
    #[serde(default = "SilenceConfig::default_keep_silence_ms")]
    pub keep_silence_ms: u32,
}

/// サーバー上のサンプル音声で動作確認するためのデバッグ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "DebugConfig::default_sample_path")]
    pub sample_path: String,
    #[serde(default = "DebugConfig::default_reference_text")]
    pub reference_text: String,
}

/// サブスクリプションキー。`Debug` 出力には値を出さない
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubscriptionKey(***)")
    }
}

impl ServerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    const fn default_port() -> u16 {
        5000
    }

    const fn default_max_request_size_mb() -> u64 {
        25
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            max_request_size_mb: Self::default_max_request_size_mb(),
        }
    }
}

impl ProviderConfig {
    fn default_region() -> String {
        "eastus".to_string()
    }

    fn default_host() -> String {
        "stt.speech.microsoft.com".to_string()
    }

    fn default_language() -> String {
        "en-US".to_string()
    }

    const fn default_timeout_seconds() -> u64 {
        30
    }

    const fn default_connect_timeout_seconds() -> u64 {
        10
    }

    /// 送信先URL（クエリ文字列を除く）
    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) if !endpoint.trim().is_empty() => endpoint.trim().to_string(),
            _ => format!(
                "https://{}.{}/speech/recognition/conversation/cognitiveservices/v1",
                self.region, self.host
            ),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            subscription_key: None,
            region: Self::default_region(),
            host: Self::default_host(),
            endpoint: None,
            language: Self::default_language(),
            transport: AssessmentTransport::default(),
            detailed_response: false,
            timeout_seconds: Self::default_timeout_seconds(),
            connect_timeout_seconds: Self::default_connect_timeout_seconds(),
        }
    }
}

impl AudioConfig {
    fn default_source_format() -> String {
        "webm".to_string()
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            source_format: Self::default_source_format(),
            silence: SilenceConfig::default(),
        }
    }
}

impl SilenceConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_threshold_dbfs() -> f32 {
        -50.0
    }

    const fn default_min_silence_ms() -> u32 {
        500
    }

    const fn default_keep_silence_ms() -> u32 {
        100
    }
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            threshold_dbfs: Self::default_threshold_dbfs(),
            min_silence_ms: Self::default_min_silence_ms(),
            keep_silence_ms: Self::default_keep_silence_ms(),
        }
    }
}

impl DebugConfig {
    fn default_sample_path() -> String {
        "test.wav".to_string()
    }

    fn default_reference_text() -> String {
        "Hello, how are you?".to_string()
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_path: Self::default_sample_path(),
            reference_text: Self::default_reference_text(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定ファイルを読み込む。存在しなければデフォルト設定を書き出して使う
    pub fn load_or_create_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::load_from_file(path)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {}", path.display(), e))
        } else {
            let config = Self::default();
            config.save_to_file(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration file");
            Ok(config)
        }
    }

    /// プロセス環境変数で上書き
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// `lookup` から秘密情報とリージョンを取り込む（テストでは環境変数を汚さないために使う）
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(SUBSCRIPTION_KEY_ENV).filter(|v| !v.trim().is_empty()) {
            self.provider.subscription_key = Some(SubscriptionKey::new(key.trim()));
        }

        if let Some(region) = lookup(REGION_ENV).filter(|v| !v.trim().is_empty()) {
            self.provider.region = region.trim().to_string();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("invalid server port: {}", self.server.port));
        }

        if self.server.max_request_size_mb == 0 {
            return Err(anyhow::anyhow!("max_request_size_mb must be at least 1"));
        }

        match &self.provider.subscription_key {
            Some(key) if !key.expose().trim().is_empty() => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "provider subscription key is not set (export {})",
                    SUBSCRIPTION_KEY_ENV
                ))
            }
        }

        if self.provider.region.trim().is_empty() && self.provider.endpoint.is_none() {
            return Err(anyhow::anyhow!("provider region is empty"));
        }

        if self.provider.language.trim().is_empty() {
            return Err(anyhow::anyhow!("provider language is empty"));
        }

        if self.provider.timeout_seconds == 0 || self.provider.connect_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("provider timeouts must be at least 1 second"));
        }

        let silence = &self.audio.silence;
        if !silence.threshold_dbfs.is_finite() || silence.threshold_dbfs > 0.0 {
            return Err(anyhow::anyhow!(
                "silence threshold must be a non-positive dBFS value: {}",
                silence.threshold_dbfs
            ));
        }

        if silence.min_silence_ms == 0 {
            return Err(anyhow::anyhow!("min_silence_ms must be at least 1"));
        }

        if self.audio.source_format.trim().is_empty() {
            return Err(anyhow::anyhow!("audio source_format is empty"));
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn max_request_size_bytes(&self) -> usize {
        (self.server.max_request_size_mb * 1024 * 1024) as usize
    }
}
