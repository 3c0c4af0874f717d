use anyhow::Context;

use forgeledger_infra::LedgerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgeledger_observability::init();

    let config = LedgerConfig::from_env().context("invalid configuration")?;
    if std::env::var(forgeledger_infra::config::ENV_JWT_SECRET).is_err() {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
    }

    let app = forgeledger_api::app::build_app(&config).await?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        lock_timeout_ms = config.lock_timeout.as_millis() as u64,
        "listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
