//! Worker-side serve loop.
//!
//! The child half of the protocol: read requests from stdin, dispatch
//! them to a [`MethodHandler`], write responses and events to stdout.
//! Handlers run in their own tasks, so a slow method never blocks the
//! loop and responses may leave out of submission order — the client's
//! correlation layer is built for exactly that.
//!
//! Stdout carries protocol records only; anything a worker wants a human
//! to read belongs on stderr.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::LineFramer;
use crate::bridge::protocol::{PROTOCOL_VERSION, Request, RequestId, error_codes};

/// Error a method handler returns; becomes the response's error object.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({code})")]
pub struct MethodError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl MethodError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    fn into_record(self, id: &RequestId) -> Value {
        let mut error = json!({ "code": self.code, "message": self.message });
        if let Some(data) = self.data {
            error["data"] = data;
        }
        json!({ "protocolVersion": PROTOCOL_VERSION, "id": id, "error": error })
    }
}

/// Trait for the worker's method surface.
#[async_trait::async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    /// Handle one request. `params` is `Null` when the request carried
    /// none. Events emitted through `events` interleave with responses on
    /// the same channel.
    async fn handle(
        &self,
        method: &str,
        params: Value,
        events: &EventSink,
    ) -> Result<Value, MethodError>;
}

enum Outbound {
    Record(Value),
    /// Unvalidated bytes, written as-is. Exists for fault injection in
    /// tests; production workers have no reason to send these.
    Raw(String),
}

/// Handle for emitting event records from inside a method handler.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl EventSink {
    pub fn emit(&self, name: &str, data: Value) -> io::Result<()> {
        let record = json!({ "kind": "event", "name": name, "data": data });
        self.tx
            .send(Outbound::Record(record))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "output channel closed"))
    }

    /// Write one raw line to the protocol channel, bypassing encoding.
    pub fn emit_raw(&self, line: impl Into<String>) -> io::Result<()> {
        self.tx
            .send(Outbound::Raw(line.into()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "output channel closed"))
    }
}

fn result_record(id: &RequestId, result: Value) -> Value {
    json!({ "protocolVersion": PROTOCOL_VERSION, "id": id, "result": result })
}

fn protocol_error_record(id: Value, code: i64, message: String) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Run the worker event loop until stdin closes or a `shutdown` request
/// arrives.
///
/// Emits `server.started` once the output channel is up, answers
/// `shutdown` itself, and routes every other method to the handler. Parse
/// failures get `-32700`, shape failures `-32600`; both leave the loop
/// running.
pub async fn serve<H: MethodHandler>(handler: Arc<H>) -> io::Result<()> {
    let mut frames = FramedRead::new(tokio::io::stdin(), LineFramer::new());

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let writer_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(outbound) = out_rx.recv().await {
            let line = match outbound {
                Outbound::Record(value) => match serde_json::to_string(&value) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize outbound record");
                        continue;
                    }
                },
                Outbound::Raw(line) => line,
            };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let events = EventSink {
        tx: out_tx.clone(),
    };
    let _ = events.emit("server.started", json!({ "pid": std::process::id() }));
    tracing::info!("worker serving");

    while let Some(item) = frames.next().await {
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "stdin read error");
                break;
            }
        };

        let value: Value = match serde_json::from_slice(&record) {
            Ok(value) => value,
            Err(e) => {
                let _ = out_tx.send(Outbound::Record(protocol_error_record(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {}", e),
                )));
                continue;
            }
        };

        let raw_id = value.get("id").cloned().unwrap_or(Value::Null);
        let request = match Request::from_record_value(value) {
            Ok(request) => request,
            Err(e) => {
                let _ = out_tx.send(Outbound::Record(protocol_error_record(
                    raw_id,
                    error_codes::INVALID_REQUEST,
                    format!("Invalid request: {}", e),
                )));
                continue;
            }
        };

        if request.method == "shutdown" {
            tracing::info!("shutdown requested");
            let _ = out_tx.send(Outbound::Record(result_record(&request.id, json!("ok"))));
            break;
        }

        let handler = Arc::clone(&handler);
        let out = out_tx.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let params = request.params.unwrap_or(Value::Null);
            tracing::debug!(method = %request.method, id = %request.id, "dispatching");
            let record = match handler.handle(&request.method, params, &events).await {
                Ok(result) => result_record(&request.id, result),
                Err(error) => error.into_record(&request.id),
            };
            let _ = out.send(Outbound::Record(record));
        });
    }

    // Flush what is queued; handlers that never return (deliberately
    // blocked test methods) must not hold the exit hostage.
    drop(out_tx);
    drop(events);
    let _ = tokio::time::timeout(Duration::from_millis(500), writer_task).await;

    tracing::info!("worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_error_record_shape() {
        let record = MethodError::method_not_found("nope").into_record(&RequestId::from("7"));
        assert_eq!(record["error"]["code"], json!(error_codes::METHOD_NOT_FOUND));
        assert_eq!(record["id"], json!("7"));
        assert!(
            record["error"]["message"]
                .as_str()
                .unwrap()
                .contains("nope")
        );
        assert!(record["error"].get("data").is_none());
    }

    #[test]
    fn method_error_data_is_carried() {
        let record = MethodError::invalid_params("missing ms")
            .with_data(json!({"field": "ms"}))
            .into_record(&RequestId::from(1));
        assert_eq!(record["error"]["data"], json!({"field": "ms"}));
    }

    #[test]
    fn result_record_echoes_the_id() {
        let record = result_record(&RequestId::from(42), json!({"ok": true}));
        assert_eq!(record["id"], json!(42));
        assert_eq!(record["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(record["result"], json!({"ok": true}));
    }
}
