//! Browser Context - surfaces, streams and lifecycle for one browser context
//!
//! Every backend event the context cares about is funneled into a single
//! queue and handled by one task, so registry mutations and notifications are
//! serialized. Callers only ever see snapshots and events.
//!
//! Lifecycle: `Open -> Closing -> Closed`. Teardown is itself a message on the
//! queue, so everything received before `close()` is handled first.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::cdp::protocol::{AttachedToTarget, DetachedFromTarget, TargetGone, TargetInfoChanged};
use crate::cdp::{CDPEvent, CdpBackend, SubscriptionId};
use crate::config::ContextConfig;
use crate::correlator::EventCorrelator;
use crate::error::{ContextError, Result};
use crate::events::{ContextEvent, ContextEventKind, EventBus, EventStream, WaitError};
use crate::network::{Request, Response};
use crate::registry::ExecutionContextRegistry;
use crate::surface::{Surface, SurfaceKind};
use crate::watcher::{AttachmentWatcher, ContextScope};

/// Backend events routed into the context loop
const OBSERVED_EVENTS: &[&str] = &[
    "Target.attachedToTarget",
    "Target.detachedFromTarget",
    "Target.targetInfoChanged",
    "Target.targetDestroyed",
    "Target.targetCrashed",
    "Network.requestWillBeSent",
    "Network.responseReceived",
    "Network.loadingFinished",
    "Network.loadingFailed",
    "Runtime.consoleAPICalled",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Open,
    Closing,
    Closed,
}

enum LoopMessage {
    Event(CDPEvent),
    Barrier(oneshot::Sender<()>),
    Teardown(oneshot::Sender<()>),
}

type CloseCallback = Box<dyn FnOnce() + Send>;

struct ContextInner {
    id: Uuid,
    backend: Arc<dyn CdpBackend>,
    registry: Arc<ExecutionContextRegistry>,
    events: Arc<EventBus<ContextEvent>>,
    watcher: AttachmentWatcher,
    correlator: EventCorrelator,
    config: Arc<ContextConfig>,
    state: watch::Sender<ContextState>,
    loop_tx: mpsc::UnboundedSender<LoopMessage>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    /// `None` once teardown has run the callbacks
    on_close: Mutex<Option<Vec<CloseCallback>>>,
}

/// Handle to a browser context. Clones share the same context.
#[derive(Clone)]
pub struct BrowserContext {
    inner: Arc<ContextInner>,
}

fn parse<T: DeserializeOwned>(event: &CDPEvent) -> Option<T> {
    match event.params_as::<T>() {
        Ok(params) => Some(params),
        Err(e) => {
            tracing::warn!(method = %event.method, "[BrowserContext] Malformed event: {}", e);
            None
        }
    }
}

impl BrowserContext {
    /// Start tracking a browser context over `backend`.
    ///
    /// `browser_context_id` is the CDP context id. The default context may
    /// not know its id, in which case it takes every target without one.
    pub async fn attach(
        backend: Arc<dyn CdpBackend>,
        browser_context_id: Option<String>,
        is_default: bool,
        config: ContextConfig,
    ) -> Result<Self> {
        let scope = ContextScope {
            browser_context_id,
            is_default,
            ..Default::default()
        };
        Self::attach_scoped(backend, scope, config).await
    }

    /// Like [`attach`](Self::attach), with an explicit scope.
    ///
    /// Contexts on one connection should share `scope.isolated`: an isolated
    /// context lists its id there, and the default context leaves those
    /// targets alone even when it does not know its own id.
    pub async fn attach_scoped(
        backend: Arc<dyn CdpBackend>,
        scope: ContextScope,
        config: ContextConfig,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(ExecutionContextRegistry::new());
        let events = Arc::new(EventBus::new(config.event_capacity()));
        let is_default = scope.is_default;
        if !is_default {
            if let Some(id) = &scope.browser_context_id {
                scope.isolated.write().insert(id.clone());
            }
        }
        let watcher = AttachmentWatcher::new(
            backend.clone(),
            registry.clone(),
            events.clone(),
            scope,
            config.clone(),
        );
        let correlator = EventCorrelator::new(registry.clone(), events.clone());
        let (state, _) = watch::channel(ContextState::Open);
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ContextInner {
            id: Uuid::now_v7(),
            backend: backend.clone(),
            registry,
            events,
            watcher,
            correlator,
            config,
            state,
            loop_tx,
            subscriptions: Mutex::new(Vec::new()),
            on_close: Mutex::new(Some(Vec::new())),
        });

        // Subscriptions go in before auto-attach so existing targets are not missed
        let subscriptions = OBSERVED_EVENTS
            .iter()
            .map(|method| {
                let tx = inner.loop_tx.clone();
                backend.subscribe(
                    method,
                    Arc::new(move |event| {
                        let _ = tx.send(LoopMessage::Event(event));
                    }),
                )
            })
            .collect();
        *inner.subscriptions.lock() = subscriptions;

        tokio::spawn(run_event_loop(Arc::downgrade(&inner), loop_rx));

        let browser_context_id = inner.watcher.scope().browser_context_id.as_deref();
        if let Err(e) = inner
            .config
            .emulation
            .apply_to_context(backend.as_ref(), browser_context_id, is_default)
            .await
        {
            tracing::warn!("[BrowserContext] Context-level emulation failed: {}", e);
        }
        inner.watcher.start().await?;

        tracing::info!(
            context = %inner.id,
            browser_context_id = ?browser_context_id,
            is_default,
            "[BrowserContext] Attached"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn browser_context_id(&self) -> Option<&str> {
        self.inner.watcher.scope().browser_context_id.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.inner.watcher.scope().is_default
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ContextState {
        *self.inner.state.borrow()
    }

    fn snapshot(&self, kind: SurfaceKind) -> Vec<Surface> {
        if self.state() == ContextState::Closed {
            return Vec::new();
        }
        self.inner.registry.list(kind)
    }

    pub fn pages(&self) -> Vec<Surface> {
        self.snapshot(SurfaceKind::Page)
    }

    /// Manifest v2 extension background pages
    pub fn background_pages(&self) -> Vec<Surface> {
        self.snapshot(SurfaceKind::BackgroundPage)
    }

    pub fn service_workers(&self) -> Vec<Surface> {
        self.snapshot(SurfaceKind::ServiceWorker)
    }

    /// Subscribe to future context events
    pub fn subscribe(&self) -> EventStream<ContextEvent> {
        self.inner.events.subscribe()
    }

    /// Run `callback` once when the context closes. Runs immediately if it already has.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self.inner.on_close.lock();
        match callbacks.as_mut() {
            Some(pending) => pending.push(Box::new(callback)),
            None => {
                drop(callbacks);
                callback();
            }
        }
    }

    /// Wait for the next event of `kind` accepted by `predicate`.
    ///
    /// Only future events count. Fails with `ContextClosed` if the context
    /// closes first, unless the wait is for `close` itself.
    pub async fn wait_for_event<F>(
        &self,
        kind: ContextEventKind,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<ContextEvent>
    where
        F: Fn(&ContextEvent) -> bool + Send + Sync + 'static,
    {
        let waiting_for_close = kind == ContextEventKind::Close;
        if self.state() == ContextState::Closed {
            return if waiting_for_close {
                Ok(ContextEvent::Close)
            } else {
                Err(ContextError::ContextClosed)
            };
        }

        let timeout = self.inner.config.resolve_timeout(timeout);
        let waiter = self.inner.events.register_waiter(move |event| {
            (event.kind() == kind && predicate(event))
                || (!waiting_for_close && matches!(event, ContextEvent::Close))
        });

        match waiter.wait(timeout).await {
            Ok(ContextEvent::Close) if !waiting_for_close => Err(ContextError::ContextClosed),
            Ok(event) => Ok(event),
            Err(WaitError::Timeout) => Err(ContextError::AttachmentTimeout {
                event: kind.to_string(),
                timeout,
            }),
            Err(WaitError::Closed) if waiting_for_close => Ok(ContextEvent::Close),
            Err(WaitError::Closed) => Err(ContextError::ContextClosed),
        }
    }

    /// First surface of `kind` accepted by `predicate`, whether it is already
    /// attached or attaches within `timeout`
    pub async fn wait_for_surface<F>(
        &self,
        kind: SurfaceKind,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<Surface>
    where
        F: Fn(&Surface) -> bool + Send + Sync + 'static,
    {
        if self.state() == ContextState::Closed {
            return Err(ContextError::ContextClosed);
        }
        let timeout = self.inner.config.resolve_timeout(timeout);
        self.inner
            .watcher
            .wait_for_surface(kind, predicate, timeout)
            .await
    }

    pub async fn wait_for_background_page<F>(
        &self,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<Surface>
    where
        F: Fn(&Surface) -> bool + Send + Sync + 'static,
    {
        self.wait_for_surface(SurfaceKind::BackgroundPage, predicate, timeout)
            .await
    }

    pub async fn wait_for_service_worker<F>(
        &self,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<Surface>
    where
        F: Fn(&Surface) -> bool + Send + Sync + 'static,
    {
        self.wait_for_surface(SurfaceKind::ServiceWorker, predicate, timeout)
            .await
    }

    pub async fn wait_for_page<F>(&self, predicate: F, timeout: Option<Duration>) -> Result<Surface>
    where
        F: Fn(&Surface) -> bool + Send + Sync + 'static,
    {
        self.wait_for_surface(SurfaceKind::Page, predicate, timeout)
            .await
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
                ContextEventKind::Request,
                move |e| e.request().is_some_and(|r| predicate(r)),
                timeout,
            )
            .await?;
        match event {
            ContextEvent::Request(request) => Ok(request),
            _ => Err(ContextError::ContextClosed),
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
                ContextEventKind::Response,
                move |e| e.response().is_some_and(|r| predicate(r)),
                timeout,
            )
            .await?;
        match event {
            ContextEvent::Response(response) => Ok(response),
            _ => Err(ContextError::ContextClosed),
        }
    }

    /// Close the context.
    ///
    /// Idempotent. A call that finds the context already closing waits for
    /// the first one to finish.
    pub async fn close(&self) -> Result<()> {
        let mut state_rx = self.inner.state.subscribe();
        let first = self.inner.state.send_if_modified(|state| {
            if *state == ContextState::Open {
                *state = ContextState::Closing;
                true
            } else {
                false
            }
        });

        if !first {
            let _ = state_rx.wait_for(|s| *s == ContextState::Closed).await;
            return Ok(());
        }

        tracing::info!(context = %self.inner.id, "[BrowserContext] Closing");
        self.inner.send_close_primitive().await;

        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.loop_tx.send(LoopMessage::Teardown(done_tx)).is_ok() {
            let _ = done_rx.await;
        } else {
            self.inner.teardown();
        }
        Ok(())
    }

    /// Resolve once every event queued before this call has been handled
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.loop_tx.send(LoopMessage::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for BrowserContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserContext")
            .field("id", &self.inner.id)
            .field("scope", self.inner.watcher.scope())
            .field("state", &self.state())
            .finish()
    }
}

impl ContextInner {
    fn is_open(&self) -> bool {
        *self.state.borrow() == ContextState::Open
    }

    async fn handle_event(&self, event: CDPEvent) {
        if *self.state.borrow() == ContextState::Closed {
            return;
        }
        let session_id = event.session_id.as_deref();

        match event.method.as_str() {
            "Target.attachedToTarget" => {
                // Nothing new is adopted once closing has started
                if !self.is_open() {
                    return;
                }
                if let Some(params) = parse::<AttachedToTarget>(&event) {
                    self.watcher.on_attached(params).await;
                }
            }
            "Target.detachedFromTarget" => {
                if let Some(params) = parse::<DetachedFromTarget>(&event) {
                    if let Some(surface) = self.watcher.on_detached(&params.session_id) {
                        self.correlator.forget_session(surface.session_id());
                    }
                }
            }
            "Target.targetDestroyed" | "Target.targetCrashed" => {
                if let Some(params) = parse::<TargetGone>(&event) {
                    if event.method == "Target.targetCrashed" {
                        tracing::warn!(target_id = %params.target_id, "[BrowserContext] Target crashed");
                    }
                    if let Some(surface) = self.watcher.on_target_gone(&params.target_id) {
                        self.correlator.forget_session(surface.session_id());
                    }
                }
            }
            "Target.targetInfoChanged" => {
                if let Some(params) = parse::<TargetInfoChanged>(&event) {
                    self.watcher.on_info_changed(&params.target_info);
                }
            }
            method => {
                let Some(session_id) = session_id else {
                    return;
                };
                match method {
                    "Network.requestWillBeSent" => {
                        if let Some(params) = parse(&event) {
                            self.correlator.on_request_will_be_sent(session_id, &params);
                        }
                    }
                    "Network.responseReceived" => {
                        if let Some(params) = parse(&event) {
                            self.correlator.on_response_received(session_id, &params);
                        }
                    }
                    "Network.loadingFinished" => {
                        if let Some(params) = parse(&event) {
                            self.correlator.on_loading_finished(session_id, &params);
                        }
                    }
                    "Network.loadingFailed" => {
                        if let Some(params) = parse(&event) {
                            self.correlator.on_loading_failed(session_id, &params);
                        }
                    }
                    "Runtime.consoleAPICalled" => {
                        if let Some(params) = parse(&event) {
                            self.correlator.on_console(session_id, &params);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// `Browser.close` for the default context, disposal for the others.
    /// Failures are logged; teardown goes ahead regardless.
    async fn send_close_primitive(&self) {
        let scope = self.watcher.scope();
        let result = if scope.is_default {
            self.backend.send_request("Browser.close", None, None).await
        } else if let Some(id) = &scope.browser_context_id {
            self.backend
                .send_request(
                    "Target.disposeBrowserContext",
                    Some(json!({ "browserContextId": id })),
                    None,
                )
                .await
        } else {
            return;
        };

        if let Err(e) = result {
            tracing::warn!(context = %self.id, "[BrowserContext] Close command failed: {}", e);
        }
    }

    fn teardown(&self) {
        let surfaces = self.registry.drain();
        self.correlator.clear();
        for surface in &surfaces {
            surface.mark_closed();
        }

        self.events.publish(ContextEvent::Close);

        let callbacks = self.on_close.lock().take().unwrap_or_default();
        for callback in callbacks {
            callback();
        }

        self.events.close();
        self.unsubscribe_all();
        self.state.send_replace(ContextState::Closed);

        tracing::info!(
            context = %self.id,
            surfaces = surfaces.len(),
            "[BrowserContext] Closed"
        );
    }

    fn unsubscribe_all(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.backend.unsubscribe(id);
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

async fn run_event_loop(inner: Weak<ContextInner>, mut rx: mpsc::UnboundedReceiver<LoopMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match message {
            LoopMessage::Event(event) => inner.handle_event(event).await,
            LoopMessage::Barrier(done) => {
                let _ = done.send(());
            }
            LoopMessage::Teardown(done) => {
                inner.teardown();
                let _ = done.send(());
                break;
            }
        }
    }
    tracing::debug!("[BrowserContext] Event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::testing::FakeBackend;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    const EXT: &str = "chrome-extension://kfbdpdaobnofkbopebjglnaadopfikhh";

    async fn open(backend: &Arc<FakeBackend>) -> BrowserContext {
        BrowserContext::attach(
            backend.clone(),
            Some("DEFAULT".to_string()),
            true,
            ContextConfig::default(),
        )
        .await
        .unwrap()
    }

    fn target(target_id: &str, target_type: &str, url: &str) -> Value {
        json!({
            "targetId": target_id,
            "type": target_type,
            "title": "",
            "url": url,
            "attached": true,
            "browserContextId": "DEFAULT"
        })
    }

    fn attach(backend: &FakeBackend, target_id: &str, target_type: &str, url: &str) {
        backend.emit(
            "Target.attachedToTarget",
            json!({
                "sessionId": format!("S-{}", target_id),
                "targetInfo": target(target_id, target_type, url),
                "waitingForDebugger": true
            }),
            None,
        );
    }

    fn detach(backend: &FakeBackend, target_id: &str) {
        backend.emit(
            "Target.detachedFromTarget",
            json!({ "sessionId": format!("S-{}", target_id), "targetId": target_id }),
            None,
        );
    }

    fn drain(stream: &mut EventStream<ContextEvent>) -> Vec<ContextEvent> {
        std::iter::from_fn(|| stream.try_recv()).collect()
    }

    #[tokio::test]
    async fn test_attach_enables_auto_attach() {
        let backend = FakeBackend::new();
        let _ctx = open(&backend).await;

        let auto_attach = backend.sent_to("Target.setAutoAttach");
        assert_eq!(auto_attach.len(), 1);
        assert_eq!(auto_attach[0].params["waitForDebuggerOnStart"], true);
        assert_eq!(auto_attach[0].params["flatten"], true);
        assert_eq!(backend.sent_to("Target.setDiscoverTargets").len(), 1);
        assert_eq!(backend.subscription_count(), OBSERVED_EVENTS.len());
    }

    #[tokio::test]
    async fn test_manifest_v2_background_page() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        attach(&backend, "P1", "page", "about:blank");
        attach(
            &backend,
            "BG",
            "background_page",
            &format!("{}/_generated_background_page.html", EXT),
        );
        ctx.flush().await;

        let bg = ctx.background_pages();
        assert_eq!(bg.len(), 1);
        assert_eq!(bg[0].kind(), SurfaceKind::BackgroundPage);
        assert_eq!(
            bg[0].extension_id().as_deref(),
            Some("kfbdpdaobnofkbopebjglnaadopfikhh")
        );
        let pages = ctx.pages();
        assert_eq!(pages.len(), 1);
        assert!(!pages.contains(&bg[0]));

        assert_ok!(ctx.close().await);
        assert!(ctx.background_pages().is_empty());
        assert!(ctx.pages().is_empty());
        assert!(bg[0].is_closed());
    }

    #[tokio::test]
    async fn test_manifest_v3_service_worker() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        attach(&backend, "P1", "page", "about:blank");
        attach(&backend, "SW", "service_worker", &format!("{}/sw.js", EXT));
        ctx.flush().await;

        let sw = ctx
            .wait_for_service_worker(
                |s| s.url().starts_with("chrome-extension://"),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        assert_eq!(ctx.service_workers(), vec![sw.clone()]);
        assert!(!ctx.pages().contains(&sw));
        assert!(ctx.background_pages().is_empty());
    }

    #[tokio::test]
    async fn test_close_notifies_exactly_once() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;
        let mut stream = ctx.subscribe();

        attach(&backend, "P1", "page", "about:blank");
        attach(&backend, "BG", "background_page", &format!("{}/bg.html", EXT));
        attach(&backend, "SW", "service_worker", &format!("{}/sw.js", EXT));
        ctx.flush().await;
        let surfaces: Vec<Surface> = [ctx.pages(), ctx.background_pages(), ctx.service_workers()].concat();

        let callbacks = Arc::new(AtomicUsize::new(0));
        let counter = callbacks.clone();
        ctx.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (first, second) = tokio::join!(ctx.close(), ctx.close());
        assert_ok!(first);
        assert_ok!(second);
        assert_ok!(ctx.close().await);

        let closes = drain(&mut stream)
            .into_iter()
            .filter(|e| matches!(e, ContextEvent::Close))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
        assert_eq!(backend.sent_to("Browser.close").len(), 1);
        assert_eq!(ctx.state(), ContextState::Closed);
        assert_eq!(surfaces.len(), 3);
        assert!(surfaces.iter().all(Surface::is_closed));
        for kind in SurfaceKind::ALL {
            assert!(ctx.snapshot(kind).is_empty());
        }
        assert_eq!(backend.subscription_count(), 0);

        // Late registrations run straight away
        let late = callbacks.clone();
        ctx.on_close(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(callbacks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_leftovers() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        let start = tokio::time::Instant::now();
        let err = assert_err!(
            ctx.wait_for_background_page(|_| true, Some(Duration::from_millis(5000)))
                .await
        );

        assert!(err.is_timeout());
        assert!(err.to_string().contains("5000ms"), "{}", err);
        assert!(err.to_string().contains("backgroundpage"));
        assert!(start.elapsed() >= Duration::from_millis(5000));
        assert_eq!(ctx.inner.events.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_existing_and_future_surfaces_resolve_once() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        attach(&backend, "BG", "background_page", &format!("{}/bg.html", EXT));
        ctx.flush().await;
        let existing = ctx
            .wait_for_background_page(|_| true, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(existing, ctx.background_pages()[0]);

        let waiting = ctx.clone();
        let pending = tokio::spawn(async move {
            waiting
                .wait_for_service_worker(|_| true, Some(Duration::from_secs(5)))
                .await
        });
        tokio::task::yield_now().await;

        attach(&backend, "SW", "service_worker", &format!("{}/sw.js", EXT));
        ctx.flush().await;

        let sw = pending.await.unwrap().unwrap();
        assert_eq!(ctx.service_workers(), vec![sw]);
        assert_eq!(ctx.inner.events.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_later_waits() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        let waiting = ctx.clone();
        let pending = tokio::spawn(async move {
            waiting
                .wait_for_page(|_| true, Some(Duration::from_secs(30)))
                .await
        });
        let request_waiter = ctx.clone();
        let pending_request = tokio::spawn(async move {
            request_waiter
                .wait_for_request(|_| true, Some(Duration::from_secs(30)))
                .await
        });
        tokio::task::yield_now().await;

        ctx.close().await.unwrap();

        assert!(matches!(pending.await.unwrap(), Err(ContextError::ContextClosed)));
        assert!(matches!(
            pending_request.await.unwrap(),
            Err(ContextError::ContextClosed)
        ));
        assert!(matches!(
            ctx.wait_for_response(|_| true, None).await,
            Err(ContextError::ContextClosed)
        ));
        assert!(matches!(
            ctx.wait_for_event(ContextEventKind::Close, |_| true, None).await,
            Ok(ContextEvent::Close)
        ));
    }

    #[tokio::test]
    async fn test_detached_surface_never_reappears() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        attach(&backend, "P1", "page", "about:blank");
        ctx.flush().await;
        let page = ctx.pages()[0].clone();

        detach(&backend, "P1");
        backend.emit(
            "Target.targetInfoChanged",
            json!({ "targetInfo": target("P1", "page", "http://localhost/") }),
            None,
        );
        ctx.flush().await;

        assert!(ctx.pages().is_empty());
        assert!(page.is_closed());
        assert_eq!(page.url(), "about:blank");
    }

    #[tokio::test]
    async fn test_destroyed_target_is_closed() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        attach(&backend, "SW", "service_worker", &format!("{}/sw.js", EXT));
        ctx.flush().await;
        let sw = ctx.service_workers()[0].clone();

        backend.emit("Target.targetDestroyed", json!({ "targetId": "SW" }), None);
        ctx.flush().await;

        assert!(sw.is_closed());
        assert!(ctx.service_workers().is_empty());
    }

    #[tokio::test]
    async fn test_network_events_reach_both_streams() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        attach(&backend, "BG", "background_page", &format!("{}/bg.html", EXT));
        ctx.flush().await;
        let bg = ctx.background_pages()[0].clone();
        let mut surface_stream = bg.subscribe();

        let waiting = ctx.clone();
        let context_wait = tokio::spawn(async move {
            waiting
                .wait_for_response(|r| r.url().ends_with("/empty.html"), Some(Duration::from_secs(5)))
                .await
        });
        tokio::task::yield_now().await;

        backend.emit(
            "Network.requestWillBeSent",
            json!({
                "requestId": "R1",
                "request": {
                    "url": "http://localhost:8907/empty.html",
                    "method": "POST",
                    "headers": { "X-FOOBAR": "KEKBAR" },
                    "postData": "foobar"
                },
                "timestamp": 1.0,
                "wallTime": 1700000000.0
            }),
            Some("S-BG"),
        );
        backend.emit(
            "Network.responseReceived",
            json!({
                "requestId": "R1",
                "response": { "url": "http://localhost:8907/empty.html", "status": 200, "statusText": "OK" },
                "timestamp": 1.1
            }),
            Some("S-BG"),
        );
        ctx.flush().await;

        let request = surface_stream.try_recv().unwrap().request().cloned().unwrap();
        let surface_response = surface_stream.try_recv().unwrap().response().cloned().unwrap();
        let context_response = context_wait.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&surface_response, &context_response));
        assert!(Arc::ptr_eq(context_response.request(), &request));
        assert_eq!(request.headers().get("x-foobar"), Some("KEKBAR"));
        assert_eq!(request.post_data(), Some("foobar"));
    }

    #[tokio::test]
    async fn test_named_context_is_scoped_and_disposed() {
        let backend = FakeBackend::new();
        backend.fail("Target.disposeBrowserContext", "Failed to find context");
        let ctx = BrowserContext::attach(
            backend.clone(),
            Some("CTX".to_string()),
            false,
            ContextConfig::default(),
        )
        .await
        .unwrap();

        // Belongs to the default context
        attach(&backend, "P1", "page", "about:blank");
        ctx.flush().await;
        assert!(ctx.pages().is_empty());

        assert_ok!(ctx.close().await);
        let disposed = backend.sent_to("Target.disposeBrowserContext");
        assert_eq!(disposed[0].params["browserContextId"], "CTX");
        assert!(backend.sent_to("Browser.close").is_empty());
        assert_eq!(ctx.state(), ContextState::Closed);
    }

    #[tokio::test]
    async fn test_target_owned_by_one_context() {
        let backend = FakeBackend::new();
        let default_scope = ContextScope {
            browser_context_id: None,
            is_default: true,
            ..Default::default()
        };
        let named_scope = ContextScope {
            browser_context_id: Some("CTX".to_string()),
            is_default: false,
            isolated: default_scope.isolated.clone(),
        };
        let default = BrowserContext::attach_scoped(backend.clone(), default_scope, ContextConfig::default())
            .await
            .unwrap();
        let named = BrowserContext::attach_scoped(backend.clone(), named_scope, ContextConfig::default())
            .await
            .unwrap();

        backend.emit(
            "Target.attachedToTarget",
            json!({
                "sessionId": "S-P1",
                "targetInfo": {
                    "targetId": "P1",
                    "type": "page",
                    "title": "",
                    "url": "about:blank",
                    "attached": true,
                    "browserContextId": "CTX"
                },
                "waitingForDebugger": true
            }),
            None,
        );
        // Still the default context's: no context id at all
        backend.emit(
            "Target.attachedToTarget",
            json!({
                "sessionId": "S-P2",
                "targetInfo": {
                    "targetId": "P2",
                    "type": "page",
                    "title": "",
                    "url": "about:blank",
                    "attached": true
                },
                "waitingForDebugger": true
            }),
            None,
        );
        default.flush().await;
        named.flush().await;

        let named_pages = named.pages();
        let default_pages = default.pages();
        assert_eq!(named_pages.len(), 1);
        assert_eq!(named_pages[0].target_id(), "P1");
        assert_eq!(default_pages.len(), 1);
        assert_eq!(default_pages[0].target_id(), "P2");
    }

    #[tokio::test]
    async fn test_zero_event_capacity_is_usable() {
        let backend = FakeBackend::new();
        let config: ContextConfig = serde_json::from_str(r#"{ "eventCapacity": 0 }"#).unwrap();
        let ctx = assert_ok!(
            BrowserContext::attach(backend.clone(), Some("DEFAULT".to_string()), true, config).await
        );
        let mut events = ctx.subscribe();

        attach(&backend, "P1", "page", "about:blank");
        ctx.flush().await;

        assert_eq!(ctx.pages().len(), 1);
        assert!(matches!(drain(&mut events).as_slice(), [ContextEvent::Page(_)]));
    }

    #[tokio::test]
    async fn test_console_wait_on_background_page() {
        let backend = FakeBackend::new();
        let ctx = open(&backend).await;

        attach(&backend, "BG", "background_page", &format!("{}/bg.html", EXT));
        ctx.flush().await;
        let bg = ctx.background_pages()[0].clone();

        let waiting = bg.clone();
        let pending = tokio::spawn(async move {
            waiting
                .wait_for_console(|m| m.text().contains("hey"), Some(Duration::from_secs(5)))
                .await
        });
        tokio::task::yield_now().await;

        backend.emit(
            "Runtime.consoleAPICalled",
            json!({ "type": "log", "args": [{ "type": "string", "value": "hey from bg" }], "timestamp": 1.0 }),
            Some("S-BG"),
        );
        ctx.flush().await;

        let message = pending.await.unwrap().unwrap();
        assert_eq!(message.text(), "hey from bg");
        assert_eq!(message.target_id(), "BG");
    }
}
