use axum::{Router, routing::get};

pub mod accounts;
pub mod common;
pub mod periods;
pub mod reports;
pub mod system;
pub mod vouchers;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/accounts", accounts::router())
        .nest("/vouchers", vouchers::router())
        .nest("/reports", reports::router())
        .nest("/periods", periods::router())
}
