//! Execution surfaces: pages, extension background pages and service workers.
//!
//! A [`Surface`] is a cheap, cloneable handle. Clones share one allocation and
//! compare equal only to each other, so "the same surface" means identity,
//! never structural equality.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::cdp::{CDPSession, Evaluation};
use crate::config;
use crate::error::{ContextError, Result};
use crate::events::{EventBus, EventStream, SurfaceEvent, SurfaceEventKind, WaitError};
use crate::network::{ConsoleMessage, Request, Response};

pub const EXTENSION_SCHEME: &str = "chrome-extension";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SurfaceKind {
    Page,
    BackgroundPage,
    ServiceWorker,
}

impl SurfaceKind {
    pub const ALL: [SurfaceKind; 3] = [
        SurfaceKind::Page,
        SurfaceKind::BackgroundPage,
        SurfaceKind::ServiceWorker,
    ];

    /// Pages get emulation and a viewport; the others run headless of any tab
    pub fn is_page(&self) -> bool {
        matches!(self, SurfaceKind::Page)
    }
}

struct SurfaceInner {
    session: CDPSession,
    kind: SurfaceKind,
    url: RwLock<String>,
    created_at: SystemTime,
    closed: AtomicBool,
    events: EventBus<SurfaceEvent>,
    default_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct Surface {
    inner: Arc<SurfaceInner>,
}

impl Surface {
    pub(crate) fn new(
        session: CDPSession,
        kind: SurfaceKind,
        url: String,
        event_capacity: usize,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                session,
                kind,
                url: RwLock::new(url),
                created_at: SystemTime::now(),
                closed: AtomicBool::new(false),
                events: EventBus::new(event_capacity),
                default_timeout,
            }),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.inner.session.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session.session_id
    }

    pub fn kind(&self) -> SurfaceKind {
        self.inner.kind
    }

    pub fn url(&self) -> String {
        self.inner.url.read().clone()
    }

    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Extension id for `chrome-extension://<id>/...` surfaces
    pub fn extension_id(&self) -> Option<String> {
        let url = url::Url::parse(&self.url()).ok()?;
        if url.scheme() != EXTENSION_SCHEME {
            return None;
        }
        url.host_str().map(str::to_string)
    }

    pub(crate) fn session(&self) -> &CDPSession {
        &self.inner.session
    }

    /// Evaluate an expression in the surface's main realm
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        if self.is_closed() {
            return Err(ContextError::SurfaceClosed(self.target_id().to_string()));
        }
        match self.inner.session.evaluate(expression).await? {
            Evaluation::Value(value) => Ok(value),
            Evaluation::Thrown(text) => Err(ContextError::Evaluation(text)),
        }
    }

    pub fn subscribe(&self) -> EventStream<SurfaceEvent> {
        self.inner.events.subscribe()
    }

    /// Wait for the next event of `kind` accepted by `predicate`.
    ///
    /// Fails with `SurfaceClosed` if the surface goes away first, unless the
    /// wait is for `close` itself.
    pub async fn wait_for_event<F>(
        &self,
        kind: SurfaceEventKind,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<SurfaceEvent>
    where
        F: Fn(&SurfaceEvent) -> bool + Send + Sync + 'static,
    {
        let waiting_for_close = kind == SurfaceEventKind::Close;
        if self.is_closed() {
            return if waiting_for_close {
                Ok(SurfaceEvent::Close)
            } else {
                Err(self.closed_error())
            };
        }

        let timeout = self.resolve_timeout(timeout);
        let waiter = self.inner.events.register_waiter(move |event| {
            (event.kind() == kind && predicate(event))
                || (!waiting_for_close && matches!(event, SurfaceEvent::Close))
        });

        match waiter.wait(timeout).await {
            Ok(SurfaceEvent::Close) if !waiting_for_close => Err(self.closed_error()),
            Ok(event) => Ok(event),
            Err(WaitError::Timeout) => Err(ContextError::AttachmentTimeout {
                event: kind.as_str().to_string(),
                timeout,
            }),
            Err(WaitError::Closed) if waiting_for_close => Ok(SurfaceEvent::Close),
            Err(WaitError::Closed) => Err(self.closed_error()),
        }
    }

    pub async fn wait_for_request<F>(
        &self,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<Arc<Request>>
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        let event = self
            .wait_for_event(
                SurfaceEventKind::Request,
                move |e| e.request().is_some_and(|r| predicate(r)),
                timeout,
            )
            .await?;
        match event {
            SurfaceEvent::Request(request) => Ok(request),
            _ => Err(self.closed_error()),
        }
    }

    pub async fn wait_for_response<F>(
        &self,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<Arc<Response>>
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        let event = self
            .wait_for_event(
                SurfaceEventKind::Response,
                move |e| e.response().is_some_and(|r| predicate(r)),
                timeout,
            )
            .await?;
        match event {
            SurfaceEvent::Response(response) => Ok(response),
            _ => Err(self.closed_error()),
        }
    }

    pub async fn wait_for_console<F>(
        &self,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<Arc<ConsoleMessage>>
    where
        F: Fn(&ConsoleMessage) -> bool + Send + Sync + 'static,
    {
        let event = self
            .wait_for_event(
                SurfaceEventKind::Console,
                move |e| e.console().is_some_and(|m| predicate(m)),
                timeout,
            )
            .await?;
        match event {
            SurfaceEvent::Console(message) => Ok(message),
            _ => Err(self.closed_error()),
        }
    }

    /// Resolve once the surface URL satisfies `predicate`, checking the current URL first.
    pub async fn wait_for_url<F>(&self, predicate: F, timeout: Option<Duration>) -> Result<String>
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let timeout = self.resolve_timeout(timeout);
        let predicate = Arc::new(predicate);
        let matcher = predicate.clone();
        // Listener goes in before the check so a change in between is not lost
        let waiter = self.inner.events.register_waiter(move |event| match event {
            SurfaceEvent::UrlChanged(url) => (*matcher)(url.as_str()),
            SurfaceEvent::Close => true,
            _ => false,
        });

        let current = self.url();
        if (*predicate)(current.as_str()) {
            return Ok(current);
        }

        match waiter.wait(timeout).await {
            Ok(SurfaceEvent::UrlChanged(url)) => Ok(url),
            Ok(_) | Err(WaitError::Closed) => Err(self.closed_error()),
            Err(WaitError::Timeout) => Err(ContextError::AttachmentTimeout {
                event: SurfaceEventKind::UrlChanged.as_str().to_string(),
                timeout,
            }),
        }
    }

    fn resolve_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout
            .or(self.inner.default_timeout)
            .unwrap_or_else(config::default_timeout)
    }

    fn closed_error(&self) -> ContextError {
        ContextError::SurfaceClosed(self.target_id().to_string())
    }

    pub(crate) fn publish(&self, event: SurfaceEvent) {
        if !self.is_closed() {
            self.inner.events.publish(event);
        }
    }

    pub(crate) fn set_url(&self, url: &str) {
        {
            let mut current = self.inner.url.write();
            if *current == url {
                return;
            }
            *current = url.to_string();
        }
        self.publish(SurfaceEvent::UrlChanged(url.to_string()));
    }

    /// Mark closed and emit `close`. Returns false if it was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.events.publish(SurfaceEvent::Close);
        self.inner.events.close();
        true
    }
}

impl PartialEq for Surface {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Surface {}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("kind", &self.kind())
            .field("target_id", &self.target_id())
            .field("url", &self.url())
            .field("closed", &self.is_closed())
            .finish()
    }
}
