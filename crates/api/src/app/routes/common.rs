use forgeledger_core::CancelToken;

use crate::app::errors::ApiError;

/// Run a synchronous engine call on the blocking pool.
///
/// Engine operations may wait on store locks (and, with Postgres, block on
/// the runtime), so they never run on an async worker.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("engine task failed: {e}")))?
}

/// Cancels a query when the handler future is dropped (client went away).
pub struct CancelOnDrop(pub CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
