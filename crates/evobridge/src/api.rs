//! Typed wrappers over the worker's method surface.
//!
//! Thin by design: the bridge does not own the worker's semantics, it only
//! names the methods any conforming worker supports and gives their
//! payloads a shape. Longer-running engine operations return raw JSON
//! because their results are method-specific and worker-defined.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::client::BridgeClient;
use crate::error::BridgeError;

/// Worker identity returned by the readiness handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeInfo {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Payload of the `health` method.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub details: Option<Value>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// One entry from the worker's tool catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ToolCatalog {
    tools: Vec<ToolSpec>,
}

/// Result of `tools.execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
}

impl BridgeClient {
    pub async fn health(&self) -> Result<HealthReport, BridgeError> {
        let value = self.request("health", None).await?;
        typed("health", value)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSpec>, BridgeError> {
        let value = self.request("tools.list", None).await?;
        let catalog: ToolCatalog = typed("tools.list", value)?;
        Ok(catalog.tools)
    }

    pub async fn execute_tool(
        &self,
        tool_id: &str,
        params: Value,
    ) -> Result<ToolOutcome, BridgeError> {
        let value = self
            .request(
                "tools.execute",
                Some(json!({ "toolId": tool_id, "params": params })),
            )
            .await?;
        typed("tools.execute", value)
    }

    /// Prepare the engine for a run with the given configuration.
    pub async fn engine_initialize(&self, config: Value) -> Result<Value, BridgeError> {
        self.request("engine.initialize", Some(json!({ "config": config })))
            .await
    }

    /// Advance the engine by one step.
    pub async fn engine_step(&self) -> Result<Value, BridgeError> {
        self.request("engine.step", None).await
    }

    /// Inspect the engine's current state.
    pub async fn engine_state(&self) -> Result<Value, BridgeError> {
        self.request("engine.state", None).await
    }

    /// Discard engine state. The worker acknowledges with a null result.
    pub async fn engine_reset(&self) -> Result<(), BridgeError> {
        self.request("engine.reset", None).await?;
        Ok(())
    }
}

fn typed<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T, BridgeError> {
    serde_json::from_value(value)
        .map_err(|e| BridgeError::Payload(format!("{}: {}", method, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_capabilities_default_to_empty() {
        let info: HandshakeInfo =
            serde_json::from_value(json!({"protocolVersion": "2.0"})).unwrap();
        assert_eq!(info.protocol_version, "2.0");
        assert!(info.capabilities.is_empty());
    }

    #[test]
    fn health_report_status() {
        let report: HealthReport =
            serde_json::from_value(json!({"status": "healthy"})).unwrap();
        assert!(report.is_healthy());

        let report: HealthReport =
            serde_json::from_value(json!({"status": "degraded", "details": {"load": 0.9}}))
                .unwrap();
        assert!(!report.is_healthy());
        assert!(report.details.is_some());
    }

    #[test]
    fn tool_outcome_output_defaults_to_null() {
        let outcome: ToolOutcome = serde_json::from_value(json!({"success": false})).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.output, Value::Null);
    }
}
