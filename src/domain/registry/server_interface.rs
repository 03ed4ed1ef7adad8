//! Downstream server interface trait

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::shared::errors::InvokeError;

/// The only contract the core holds with a server.
///
/// Implementations must tolerate concurrent overlapping calls of the same
/// operation on the same server. Failure is either an explicit error or a
/// timeout applied by the caller.
#[async_trait]
pub trait ServerInvoker: Send + Sync {
    async fn invoke(
        &self,
        server_id: &str,
        operation: &str,
        arguments: Value,
    ) -> Result<Value, InvokeError>;
}

/// Invoke with an explicit deadline; expiry is reported as `InvokeError::Timeout`
pub async fn invoke_with_timeout(
    invoker: &dyn ServerInvoker,
    server_id: &str,
    operation: &str,
    arguments: Value,
    timeout_ms: u64,
) -> Result<Value, InvokeError> {
    match tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        invoker.invoke(server_id, operation, arguments),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(InvokeError::Timeout(timeout_ms)),
    }
}
