//! Reference worker for exercising the bridge.
//!
//! Implements the standard method surface plus fault-injection methods
//! the integration suite leans on: delayed replies, a method that never
//! replies, a hard exit, and raw-garbage emission.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use evobridge::worker::{EventSink, MethodError, MethodHandler, serve};

#[derive(Default)]
struct StubWorker {
    generation: Mutex<u64>,
}

impl StubWorker {
    fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_generation(&self, value: u64) {
        *self.generation.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

#[async_trait::async_trait]
impl MethodHandler for StubWorker {
    async fn handle(
        &self,
        method: &str,
        params: Value,
        events: &EventSink,
    ) -> Result<Value, MethodError> {
        match method {
            "handshake" => Ok(json!({
                "protocolVersion": evobridge::PROTOCOL_VERSION,
                "capabilities": ["tools", "engine"],
            })),

            "health" => Ok(json!({ "status": "healthy" })),

            "tools.list" => Ok(json!({
                "tools": [
                    { "id": "echo", "description": "return the given params verbatim" },
                    { "id": "reverse", "description": "reverse a string argument" },
                ],
            })),

            "tools.execute" => {
                let tool_id = params
                    .get("toolId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MethodError::invalid_params("missing toolId"))?;
                let tool_params = params.get("params").cloned().unwrap_or(Value::Null);
                match tool_id {
                    "echo" => Ok(json!({ "success": true, "output": tool_params })),
                    "reverse" => {
                        let input = tool_params.get("text").and_then(Value::as_str).ok_or_else(
                            || MethodError::invalid_params("reverse needs a text param"),
                        )?;
                        let reversed: String = input.chars().rev().collect();
                        Ok(json!({ "success": true, "output": reversed }))
                    }
                    other => Ok(json!({
                        "success": false,
                        "output": format!("unknown tool: {}", other),
                    })),
                }
            }

            "engine.initialize" => {
                self.set_generation(0);
                let config = params.get("config").cloned().unwrap_or(Value::Null);
                Ok(json!({ "initialized": true, "config": config }))
            }

            "engine.step" => {
                let generation = self.generation() + 1;
                self.set_generation(generation);
                let _ = events.emit("engine.progress", json!({ "generation": generation }));
                Ok(json!({
                    "generation": generation,
                    "improved": generation % 2 == 0,
                }))
            }

            "engine.state" => Ok(json!({
                "generation": self.generation(),
                "running": true,
            })),

            "engine.reset" => {
                self.set_generation(0);
                Ok(Value::Null)
            }

            "cwd" => {
                let cwd = std::env::current_dir()
                    .map_err(|e| MethodError::internal(e.to_string()))?;
                Ok(json!({ "cwd": cwd.display().to_string() }))
            }

            // Fault-injection surface.
            "sleep" => {
                let ms = params
                    .get("ms")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| MethodError::invalid_params("missing ms"))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept": ms }))
            }

            "emit" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MethodError::invalid_params("missing name"))?;
                let data = params.get("data").cloned().unwrap_or(Value::Null);
                events
                    .emit(name, data)
                    .map_err(|e| MethodError::internal(e.to_string()))?;
                Ok(json!({ "emitted": true }))
            }

            "garbage" => {
                // One undecodable line between two well-formed records.
                events
                    .emit_raw("!!this is not a protocol record!!")
                    .map_err(|e| MethodError::internal(e.to_string()))?;
                Ok(json!({ "emitted": "garbage" }))
            }

            "block" => {
                std::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }

            "crash" => {
                eprintln!("stub worker crashing on request");
                std::process::exit(3);
            }

            other => Err(MethodError::method_not_found(other)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    serve(Arc::new(StubWorker::default())).await?;
    Ok(())
}
