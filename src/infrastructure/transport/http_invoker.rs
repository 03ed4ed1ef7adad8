//! JSON-over-HTTP server invoker

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::TransportConfig;
use crate::domain::registry::ServerInvoker;
use crate::shared::errors::{AppError, InvokeError};

#[derive(Serialize)]
struct InvokeRequest<'a> {
    operation: &'a str,
    arguments: Value,
}

/// Posts `{"operation", "arguments"}` to each server's endpoint.
///
/// A reply of `{"error": "..."}` is a server-reported failure, a reply of
/// `{"result": ...}` is unwrapped, anything else is returned as is.
pub struct HttpInvoker {
    client: Client,
    endpoints: HashMap<String, String>,
    timeout_ms: u64,
}

impl HttpInvoker {
    /// Create new HTTP invoker for `server id -> endpoint URL`
    pub fn new(config: &TransportConfig, endpoints: HashMap<String, String>) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AppError::TransportError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints,
            timeout_ms: config.request_timeout_ms,
        })
    }

    pub fn endpoint(&self, server_id: &str) -> Option<&str> {
        self.endpoints.get(server_id).map(String::as_str)
    }
}

/// Split a decoded reply into result or server-reported failure
fn interpret_reply(reply: Value) -> Result<Value, InvokeError> {
    match reply {
        Value::Object(mut map) => {
            if let Some(error) = map.remove("error") {
                if !error.is_null() {
                    let reason = match error {
                        Value::String(reason) => reason,
                        other => other.to_string(),
                    };
                    return Err(InvokeError::Failed(reason));
                }
            }
            match map.remove("result") {
                Some(result) => Ok(result),
                None => Ok(Value::Object(map)),
            }
        }
        other => Ok(other),
    }
}

#[async_trait]
impl ServerInvoker for HttpInvoker {
    async fn invoke(
        &self,
        server_id: &str,
        operation: &str,
        arguments: Value,
    ) -> Result<Value, InvokeError> {
        let endpoint = self
            .endpoint(server_id)
            .ok_or_else(|| InvokeError::UnknownServer(server_id.to_string()))?;

        debug!("POST {} {} -> {}", endpoint, operation, server_id);
        let response = self
            .client
            .post(endpoint)
            .json(&InvokeRequest { operation, arguments })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InvokeError::Timeout(self.timeout_ms)
                } else {
                    InvokeError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(InvokeError::Failed(format!("{} {}: {}", operation, status, text)));
        }

        let reply = response
            .json::<Value>()
            .await
            .map_err(|e| InvokeError::Transport(format!("Invalid JSON reply: {}", e)))?;

        interpret_reply(reply)
    }
}
