use backend::config::Config;
use backend::{app, telemetry, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config = Config::from_env();
    if config.relay_upstream.is_none() {
        tracing::warn!("RELAY_UPSTREAM_URL not set; /api/ingresso will fail");
    }
    let state = AppState::from_config(&config).await?;
    let app = app(state);

    tracing::info!(addr = %config.addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
