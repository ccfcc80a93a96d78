use std::net::SocketAddr;

use pronunciation_relay::{
    config::{Config, CONFIG_PATH_ENV},
    handlers::AppState,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `.env` があれば読み込む（AZURE_SPEECH_KEY など）
    dotenv::dotenv().ok();
    init_tracing();

    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let mut config = Config::load_or_create_default(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    info!(
        path = %config_path,
        region = %config.provider.region,
        endpoint = %config.provider.endpoint_url(),
        transport = ?config.provider.transport,
        silence_stripping = config.audio.silence.enabled,
        debug = config.debug.enabled,
        "configuration loaded"
    );

    let app_state = AppState::new(config.clone())?;
    let app = pronunciation_relay::create_app(app_state);

    let addr: SocketAddr = config
        .server_address()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server address: {}", e))?;

    info!(%addr, "listening");
    info!("  POST /assess  - multipart fields `audio` and `text`");
    info!("  GET  /health  - health check");
    info!("  GET  /        - capture page");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("server error: {}", e))?;

    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}
