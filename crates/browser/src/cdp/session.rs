//! CDP Session - Represents a connection to a specific browser target
//!
//! Design: Lightweight wrapper around a [`CdpBackend`] with target-specific context.
//! All sessions share the same connection - no per-session overhead.
//! Sessions are created by flat auto-attach, never by explicit attach calls.

use super::client::{CDPError, CdpBackend, Result};
use super::protocol::{SessionId, TargetId};
use serde_json::{json, Value};
use std::sync::Arc;

/// Outcome of a `Runtime.evaluate` call
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Value(Value),
    Thrown(String),
}

/// CDP Session bound to a specific target
#[derive(Clone)]
pub struct CDPSession {
    /// Shared backend
    backend: Arc<dyn CdpBackend>,

    /// Target this session is attached to
    pub target_id: TargetId,

    /// Session ID assigned by Chrome
    pub session_id: SessionId,
}

impl CDPSession {
    pub fn new(backend: Arc<dyn CdpBackend>, target_id: TargetId, session_id: SessionId) -> Self {
        Self {
            backend,
            target_id,
            session_id,
        }
    }

    /// Send command within this session's context
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.backend
            .send_request(method, params, Some(self.session_id.clone()))
            .await
    }

    /// Enable a set of domains in parallel.
    ///
    /// Individual failures are logged and counted, not fatal: workers reject
    /// some domains that pages accept.
    pub async fn enable_domains(&self, domains: &[&str]) -> usize {
        let enable_futures: Vec<_> = domains
            .iter()
            .map(|domain| {
                let method = format!("{}.enable", domain);
                async move { self.send(&method, None).await }
            })
            .collect();

        let results = futures_util::future::join_all(enable_futures).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            tracing::warn!(
                target_id = %self.target_id,
                "Some domain enables failed: {}/{}",
                failures,
                results.len()
            );
        }
        failures
    }

    /// Release a target paused by `waitForDebuggerOnStart`
    pub async fn run_if_waiting_for_debugger(&self) -> Result<()> {
        self.send("Runtime.runIfWaitingForDebugger", None).await?;
        Ok(())
    }

    /// Evaluate JavaScript, awaiting promises and returning by value
    pub async fn evaluate(&self, expression: &str) -> Result<Evaluation> {
        let result = self
            .send(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("Evaluation failed")
                .to_string();
            return Ok(Evaluation::Thrown(text));
        }

        Ok(Evaluation::Value(result["result"]["value"].clone()))
    }

    /// Fetch a response body, decoding base64 payloads
    pub async fn response_body(&self, request_id: &str) -> Result<Vec<u8>> {
        use base64::Engine;

        let result = self
            .send(
                "Network.getResponseBody",
                Some(json!({ "requestId": request_id })),
            )
            .await?;

        let body = result["body"].as_str().unwrap_or_default();
        if result["base64Encoded"].as_bool().unwrap_or(false) {
            base64::engine::general_purpose::STANDARD
                .decode(body)
                .map_err(|e| CDPError::Protocol {
                    code: -1,
                    message: format!("invalid base64 body: {}", e),
                })
        } else {
            Ok(body.as_bytes().to_vec())
        }
    }
}

impl std::fmt::Debug for CDPSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CDPSession")
            .field("target_id", &self.target_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}
