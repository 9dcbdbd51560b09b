//! Panic recovery for handlers and background work.
//!
//! Module code runs on its own task; a panic there ends that task only and
//! is turned into a `GeneralError` for whoever awaited it.

use crate::types::{Error, Result};
use std::future::Future;

/// Run `operation` on a fresh task, converting a panic into an error.
pub async fn with_recovery<Fut, T>(operation: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(operation).await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            let panic_msg = extract_panic_message(join_error.into_panic());
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );
            Err(Error::general(format!(
                "panic in {}: {}",
                operation_name, panic_msg
            )))
        }
        Err(_) => Err(Error::general(format!("{} was cancelled", operation_name))),
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
