//! Event Bus - broadcast streams plus one-shot predicate waiters
//!
//! Design: Type-safe events, enums not trait objects.
//! Two consumption patterns share one bus:
//!
//! 1. **Streams**: [`EventBus::subscribe`] hands out an [`EventStream`]
//! 2. **Waiters**: [`EventBus::register_waiter`] hands out a [`Waiter`] that
//!    resolves on the first matching event
//!
//! Waiters are served before the broadcast so a `wait_for_*` never loses an
//! event to a lagging stream. A waiter removes itself from the bus when
//! dropped, so timed-out or abandoned waits leave nothing behind.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

use crate::network::{ConsoleMessage, Request, Response};
use crate::surface::{Surface, SurfaceKind};

/// Events observable on a browser context
#[derive(Debug, Clone)]
pub enum ContextEvent {
    Page(Surface),
    BackgroundPage(Surface),
    ServiceWorker(Surface),
    Request(Arc<Request>),
    Response(Arc<Response>),
    RequestFinished(Arc<Request>),
    RequestFailed(Arc<Request>),
    Console(Arc<ConsoleMessage>),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextEventKind {
    Page,
    BackgroundPage,
    ServiceWorker,
    Request,
    Response,
    RequestFinished,
    RequestFailed,
    Console,
    Close,
}

impl ContextEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextEventKind::Page => "page",
            ContextEventKind::BackgroundPage => "backgroundpage",
            ContextEventKind::ServiceWorker => "serviceworker",
            ContextEventKind::Request => "request",
            ContextEventKind::Response => "response",
            ContextEventKind::RequestFinished => "requestfinished",
            ContextEventKind::RequestFailed => "requestfailed",
            ContextEventKind::Console => "console",
            ContextEventKind::Close => "close",
        }
    }
}

impl From<SurfaceKind> for ContextEventKind {
    fn from(kind: SurfaceKind) -> Self {
        match kind {
            SurfaceKind::Page => ContextEventKind::Page,
            SurfaceKind::BackgroundPage => ContextEventKind::BackgroundPage,
            SurfaceKind::ServiceWorker => ContextEventKind::ServiceWorker,
        }
    }
}

impl fmt::Display for ContextEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ContextEvent {
    pub(crate) fn attached(surface: Surface) -> Self {
        match surface.kind() {
            SurfaceKind::Page => ContextEvent::Page(surface),
            SurfaceKind::BackgroundPage => ContextEvent::BackgroundPage(surface),
            SurfaceKind::ServiceWorker => ContextEvent::ServiceWorker(surface),
        }
    }

    pub fn kind(&self) -> ContextEventKind {
        match self {
            ContextEvent::Page(_) => ContextEventKind::Page,
            ContextEvent::BackgroundPage(_) => ContextEventKind::BackgroundPage,
            ContextEvent::ServiceWorker(_) => ContextEventKind::ServiceWorker,
            ContextEvent::Request(_) => ContextEventKind::Request,
            ContextEvent::Response(_) => ContextEventKind::Response,
            ContextEvent::RequestFinished(_) => ContextEventKind::RequestFinished,
            ContextEvent::RequestFailed(_) => ContextEventKind::RequestFailed,
            ContextEvent::Console(_) => ContextEventKind::Console,
            ContextEvent::Close => ContextEventKind::Close,
        }
    }

    pub fn surface(&self) -> Option<&Surface> {
        match self {
            ContextEvent::Page(s) | ContextEvent::BackgroundPage(s) | ContextEvent::ServiceWorker(s) => {
                Some(s)
            }
            _ => None,
        }
    }

    pub fn request(&self) -> Option<&Arc<Request>> {
        match self {
            ContextEvent::Request(r) | ContextEvent::RequestFinished(r) | ContextEvent::RequestFailed(r) => {
                Some(r)
            }
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&Arc<Response>> {
        match self {
            ContextEvent::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn console(&self) -> Option<&Arc<ConsoleMessage>> {
        match self {
            ContextEvent::Console(m) => Some(m),
            _ => None,
        }
    }
}

/// Events observable on a single surface
#[derive(Debug, Clone)]
pub enum SurfaceEvent {
    Request(Arc<Request>),
    Response(Arc<Response>),
    RequestFinished(Arc<Request>),
    RequestFailed(Arc<Request>),
    Console(Arc<ConsoleMessage>),
    UrlChanged(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceEventKind {
    Request,
    Response,
    RequestFinished,
    RequestFailed,
    Console,
    UrlChanged,
    Close,
}

impl SurfaceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceEventKind::Request => "request",
            SurfaceEventKind::Response => "response",
            SurfaceEventKind::RequestFinished => "requestfinished",
            SurfaceEventKind::RequestFailed => "requestfailed",
            SurfaceEventKind::Console => "console",
            SurfaceEventKind::UrlChanged => "urlchanged",
            SurfaceEventKind::Close => "close",
        }
    }
}

impl fmt::Display for SurfaceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SurfaceEvent {
    pub fn kind(&self) -> SurfaceEventKind {
        match self {
            SurfaceEvent::Request(_) => SurfaceEventKind::Request,
            SurfaceEvent::Response(_) => SurfaceEventKind::Response,
            SurfaceEvent::RequestFinished(_) => SurfaceEventKind::RequestFinished,
            SurfaceEvent::RequestFailed(_) => SurfaceEventKind::RequestFailed,
            SurfaceEvent::Console(_) => SurfaceEventKind::Console,
            SurfaceEvent::UrlChanged(_) => SurfaceEventKind::UrlChanged,
            SurfaceEvent::Close => SurfaceEventKind::Close,
        }
    }

    pub fn request(&self) -> Option<&Arc<Request>> {
        match self {
            SurfaceEvent::Request(r) | SurfaceEvent::RequestFinished(r) | SurfaceEvent::RequestFailed(r) => {
                Some(r)
            }
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&Arc<Response>> {
        match self {
            SurfaceEvent::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn console(&self) -> Option<&Arc<ConsoleMessage>> {
        match self {
            SurfaceEvent::Console(m) => Some(m),
            _ => None,
        }
    }
}

type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

struct WaiterEntry<E> {
    id: u64,
    predicate: Predicate<E>,
    complete_tx: oneshot::Sender<E>,
}

struct WaiterTable<E> {
    next_id: u64,
    entries: Vec<WaiterEntry<E>>,
    closed: bool,
}

/// Why a [`Waiter`] gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    Timeout,
    Closed,
}

/// Broadcast stream plus predicate waiters
pub struct EventBus<E: Clone + Send + 'static> {
    tx: broadcast::Sender<E>,
    waiters: Arc<Mutex<WaiterTable<E>>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            waiters: Arc::new(Mutex::new(WaiterTable {
                next_id: 0,
                entries: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Publish an event: matching waiters first, then stream subscribers
    pub fn publish(&self, event: E) {
        {
            let mut table = self.waiters.lock();
            let mut i = 0;
            while i < table.entries.len() {
                if (table.entries[i].predicate)(&event) {
                    let entry = table.entries.swap_remove(i);
                    let _ = entry.complete_tx.send(event.clone());
                } else {
                    i += 1;
                }
            }
        }
        let _ = self.tx.send(event); // Ignore error if no subscribers
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> EventStream<E> {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Register a one-shot waiter for the first event matching `predicate`.
    ///
    /// On a closed bus the waiter is born resolved with [`WaitError::Closed`].
    pub(crate) fn register_waiter<F>(&self, predicate: F) -> Waiter<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let (complete_tx, rx) = oneshot::channel();
        let mut table = self.waiters.lock();
        let id = table.next_id;
        table.next_id += 1;
        if !table.closed {
            table.entries.push(WaiterEntry {
                id,
                predicate: Box::new(predicate),
                complete_tx,
            });
        }
        Waiter {
            id,
            rx,
            table: Arc::downgrade(&self.waiters),
        }
    }

    /// Fail every pending waiter with [`WaitError::Closed`] and refuse new ones
    pub(crate) fn close(&self) {
        let mut table = self.waiters.lock();
        table.closed = true;
        table.entries.clear();
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().entries.len()
    }
}

/// One-shot waiter. Dropping it unregisters it from the bus.
pub(crate) struct Waiter<E> {
    id: u64,
    rx: oneshot::Receiver<E>,
    table: Weak<Mutex<WaiterTable<E>>>,
}

impl<E> Waiter<E> {
    /// Wait for the matching event, bounded by `timeout`
    pub(crate) async fn wait(mut self, timeout: Duration) -> Result<E, WaitError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => Err(WaitError::Timeout),
        }
    }
}

impl<E> Drop for Waiter<E> {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().entries.retain(|entry| entry.id != self.id);
        }
    }
}

/// Wrapper around [`broadcast::Receiver`] that logs and skips lag
pub struct EventStream<E: Clone + Send + 'static> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone + Send + 'static> EventStream<E> {
    /// Next event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "Event stream lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event, without waiting
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "Event stream lagged, dropped events");
                }
                Err(_) => return None,
            }
        }
    }
}
