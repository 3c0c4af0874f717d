//! HTTP API application wiring (Axum router + engine wiring).
//!
//! - `routes/`: HTTP routes + handlers (one file per domain area)
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use forgeledger_infra::{EngineSettings, LedgerConfig, LedgerEngine};

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router from configuration (public entrypoint used by `main.rs`).
pub async fn build_app(config: &LedgerConfig) -> anyhow::Result<Router> {
    let engine = build_engine(config).await?;
    Ok(build_router(engine, config.jwt_secret.clone()))
}

/// Router over an already-wired engine.
pub fn build_router(engine: LedgerEngine, jwt_secret: String) -> Router {
    let jwt = Arc::new(forgeledger_auth::Hs256JwtValidator::new(jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require auth + tenant context.
    let protected = routes::router()
        .layer(Extension(engine))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}

/// In-memory engine unless a database URL is configured.
pub async fn build_engine(config: &LedgerConfig) -> anyhow::Result<LedgerEngine> {
    let settings = EngineSettings::from(config);
    match &config.database_url {
        None => {
            tracing::info!("using in-memory ledger store");
            Ok(LedgerEngine::in_memory(settings))
        }
        #[cfg(feature = "postgres")]
        Some(url) => build_postgres_engine(url, settings).await,
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("DATABASE_URL is set but the postgres feature is disabled"),
    }
}

#[cfg(feature = "postgres")]
async fn build_postgres_engine(url: &str, settings: EngineSettings) -> anyhow::Result<LedgerEngine> {
    use anyhow::Context;
    use forgeledger_infra::PostgresLedgerStore;

    let store = PostgresLedgerStore::connect(url)
        .await
        .context("failed to connect to Postgres")?;
    store.migrate().await.context("failed to apply migrations")?;
    tracing::info!("using Postgres ledger store");

    let store = Arc::new(store);
    let engine = LedgerEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(forgeledger_auth::ClaimedRoles),
        settings,
    );
    // The store's sync adapters block on the runtime, so load off the async workers.
    let engine = tokio::task::spawn_blocking(move || engine.with_account_store(store))
        .await
        .context("account directory restore panicked")??;
    Ok(engine)
}
