//! CDP Client - The Core Communication Layer
//!
//! Design decisions:
//! 1. Single WebSocket per browser connection (no per-session WS overhead)
//! 2. Async message passing - no locks on send/receive path
//! 3. Request/response matching via ID, events broadcast to subscribers
//! 4. Fail fast - no retries, no queuing. Let the caller decide.
//!
//! Everything above this layer talks to the browser through [`CdpBackend`],
//! so the surface tracker can run against an in-memory backend in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::*;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Error, Debug)]
pub enum CDPError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CDP protocol error: {code} - {message}")]
    Protocol { code: i32, message: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Invalid response for request {0}")]
    InvalidResponse(RequestId),
}

/// Result type for CDP operations
pub type Result<T> = std::result::Result<T, CDPError>;

/// Event subscriber callback
pub type EventCallback = Arc<dyn Fn(CDPEvent) + Send + Sync>;

/// Handle returned by [`CdpBackend::subscribe`], used to unsubscribe again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The seam between surface tracking and the browser.
///
/// Commands go out with an optional session id (None = browser-level).
/// Events come back through method-keyed callbacks. Callbacks run on the
/// transport's receive task and must not block.
#[async_trait]
pub trait CdpBackend: Send + Sync {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value>;

    fn subscribe(&self, method: &str, callback: EventCallback) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Method-keyed subscriber table shared by every backend implementation
#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    by_method: DashMap<String, Vec<(SubscriptionId, EventCallback)>>,
}

impl Subscribers {
    pub(crate) fn add(&self, method: &str, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.by_method
            .entry(method.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) {
        for mut entry in self.by_method.iter_mut() {
            entry.value_mut().retain(|(sub_id, _)| *sub_id != id);
        }
        self.by_method.retain(|_, callbacks| !callbacks.is_empty());
    }

    pub(crate) fn dispatch(&self, event: CDPEvent) {
        // Clone out so callbacks never run under the map guard
        let callbacks: Vec<EventCallback> = match self.by_method.get(&event.method) {
            Some(entry) => entry.value().iter().map(|(_, cb)| cb.clone()).collect(),
            None => return,
        };
        for callback in callbacks {
            callback(event.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_method.iter().map(|entry| entry.value().len()).sum()
    }
}

/// CDP Client - manages single WebSocket connection to browser
pub struct CDPClient {
    /// Monotonic request ID counter
    next_id: AtomicU64,

    /// Pending requests waiting for responses
    /// Key: request_id, Value: oneshot sender for response
    pending: Arc<DashMap<RequestId, oneshot::Sender<CDPResponse>>>,

    /// Event subscribers, keyed by method name (e.g. "Target.attachedToTarget")
    subscribers: Subscribers,

    /// WebSocket write half (wrapped for concurrent sending)
    ws_sink: Arc<RwLock<WsSink>>,

    /// Stops the receive task
    shutdown: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl CDPClient {
    /// Connect to Chrome DevTools Protocol endpoint
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (sink, mut stream) = ws_stream.split();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            subscribers: Subscribers::default(),
            ws_sink: Arc::new(RwLock::new(sink)),
            shutdown: parking_lot::Mutex::new(Some(shutdown_tx)),
        });

        // Spawn message receiver task
        let client_clone = client.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Err(e) = client_clone.handle_message(&text) {
                                    tracing::error!("Failed to handle message: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("WebSocket closed");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::error!("WebSocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }

            // Dropping the senders fails every waiting request with Closed
            client_clone.pending.clear();
        });

        Ok(client)
    }

    /// Handle incoming WebSocket message
    fn handle_message(&self, text: &str) -> Result<()> {
        let msg: CDPMessage = serde_json::from_str(text)?;

        match msg {
            CDPMessage::Response(response) => {
                if let Some((_, tx)) = self.pending.remove(&response.id) {
                    let _ = tx.send(response); // Ignore send errors (receiver dropped)
                } else {
                    tracing::warn!("Received response for unknown request: {}", response.id);
                }
            }
            CDPMessage::Event(event) => self.subscribers.dispatch(event),
        }

        Ok(())
    }

    /// Close connection gracefully
    pub async fn close(self: Arc<Self>) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let mut sink = self.ws_sink.write().await;
        sink.close().await?;
        Ok(())
    }
}

#[async_trait]
impl CdpBackend for CDPClient {
    /// Send CDP request and wait for response
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CDPRequest {
            id,
            method: method.to_string(),
            params,
            session_id,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // Serialize and send
        let json = serde_json::to_string(&request)?;
        let mut sink = self.ws_sink.write().await;
        if let Err(e) = sink.send(Message::Text(json)).await {
            self.pending.remove(&id);
            return Err(CDPError::WebSocket(e));
        }
        drop(sink); // Release lock immediately

        // Wait for response
        let response = rx.await.map_err(|_| CDPError::Closed)?;

        if let Some(error) = response.error {
            return Err(CDPError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    fn subscribe(&self, method: &str, callback: EventCallback) -> SubscriptionId {
        self.subscribers.add(method, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }
}
