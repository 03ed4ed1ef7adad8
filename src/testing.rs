//! Test doubles shared by the unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::registry::{ServerInvoker, ServerRecord, ServerRegistry, ServerStatus};
use crate::shared::errors::InvokeError;

#[derive(Clone)]
enum Script {
    Reply(Value),
    Fail(String),
    Delay(u64, Value),
}

/// Invoker that replays scripted answers and records every call in order.
/// Unscripted calls succeed with `{"ok": true}`.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<(String, String), Script>>,
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, server: &str, operation: &str, value: Value) {
        self.script(server, operation, Script::Reply(value));
    }

    pub fn fail(&self, server: &str, operation: &str, reason: &str) {
        self.script(server, operation, Script::Fail(reason.to_string()));
    }

    pub fn delay(&self, server: &str, operation: &str, millis: u64, value: Value) {
        self.script(server, operation, Script::Delay(millis, value));
    }

    fn script(&self, server: &str, operation: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert((server.to_string(), operation.to_string()), script);
    }

    /// Every `(server, operation)` pair in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(server, op, _)| (server.clone(), op.clone()))
            .collect()
    }

    /// Servers that received `operation`, in call order
    pub fn servers_called(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(_, op)| op == operation)
            .map(|(server, _)| server)
            .collect()
    }

    pub fn arguments_for(&self, server: &str, operation: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, op, _)| s == server && op == operation)
            .map(|(_, _, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl ServerInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        server_id: &str,
        operation: &str,
        arguments: Value,
    ) -> Result<Value, InvokeError> {
        self.calls
            .lock()
            .unwrap()
            .push((server_id.to_string(), operation.to_string(), arguments));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&(server_id.to_string(), operation.to_string()))
            .cloned();

        match script {
            Some(Script::Reply(value)) => Ok(value),
            Some(Script::Fail(reason)) => Err(InvokeError::Failed(reason)),
            Some(Script::Delay(millis, value)) => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(value)
            }
            None => Ok(json!({ "ok": true })),
        }
    }
}

/// Registry with every given record registered and marked Connected
pub async fn connected_registry(records: Vec<ServerRecord>) -> Arc<ServerRegistry> {
    let registry = Arc::new(ServerRegistry::new_default());
    for record in records {
        let id = record.id.clone();
        registry.register(record).await;
        registry
            .update_status(&id, ServerStatus::Connected, None)
            .await
            .unwrap();
    }
    registry
}
