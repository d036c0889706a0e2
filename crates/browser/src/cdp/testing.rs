//! In-memory backend standing in for a browser in unit tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use super::client::{CDPError, CdpBackend, EventCallback, Result, Subscribers, SubscriptionId};
use super::protocol::{CDPEvent, SessionId};

#[derive(Debug, Clone)]
pub struct SentCommand {
    pub method: String,
    pub params: Value,
    pub session_id: Option<SessionId>,
}

enum Canned {
    Ok(Value),
    Err(String),
}

/// Records every command and replays canned responses.
/// Unknown methods answer with an empty object.
#[derive(Default)]
pub struct FakeBackend {
    sent: Mutex<Vec<SentCommand>>,
    canned: DashMap<String, Canned>,
    subscribers: Subscribers,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: &str, result: Value) {
        self.canned.insert(method.to_string(), Canned::Ok(result));
    }

    pub fn fail(&self, method: &str, message: &str) {
        self.canned
            .insert(method.to_string(), Canned::Err(message.to_string()));
    }

    /// Deliver an event synchronously, as the transport's receive task would
    pub fn emit(&self, method: &str, params: Value, session_id: Option<&str>) {
        self.subscribers.dispatch(CDPEvent {
            method: method.to_string(),
            params: Some(params),
            session_id: session_id.map(str::to_string),
        });
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, method: &str) -> Vec<SentCommand> {
        self.sent
            .lock()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl CdpBackend for FakeBackend {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        self.sent.lock().push(SentCommand {
            method: method.to_string(),
            params: params.unwrap_or(Value::Null),
            session_id,
        });

        match self.canned.get(method).as_deref() {
            Some(Canned::Ok(value)) => Ok(value.clone()),
            Some(Canned::Err(message)) => Err(CDPError::Protocol {
                code: -32601,
                message: message.clone(),
            }),
            None => Ok(Value::Object(Default::default())),
        }
    }

    fn subscribe(&self, method: &str, callback: EventCallback) -> SubscriptionId {
        self.subscribers.add(method, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }
}
