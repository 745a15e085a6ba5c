//! Demo peer served by `peerlink serve`.

use async_trait::async_trait;
use peerlink::ipc::IpcDispatch;
use peerlink::{PeerError, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Upper bound for the `sleep` method.
const MAX_SLEEP_MS: u64 = 60_000;

/// Answers `ping`, `echo` and `sleep`.
pub struct EchoPeer;

#[async_trait]
impl IpcDispatch for EchoPeer {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        debug!("Handling {}", method);
        match method {
            "ping" => Ok(Value::String("pong".into())),
            "echo" => Ok(params),
            "sleep" => {
                let ms = params
                    .get("ms")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| PeerError::InvalidParams {
                        message: "Missing required parameter: ms".into(),
                    })?;
                if ms > MAX_SLEEP_MS {
                    return Err(PeerError::InvalidParams {
                        message: format!("ms must be at most {}", MAX_SLEEP_MS),
                    });
                }
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(serde_json::json!({ "slept_ms": ms }))
            }
            _ => Err(PeerError::InvalidParams {
                message: format!("Unknown method: {}", method),
            }),
        }
    }
}
