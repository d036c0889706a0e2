//! Attachment Watcher - turns target lifecycle events into surfaces
//!
//! Responsibilities:
//! - Enable flat auto-attach so every top-level target reports in, including
//!   the ones already alive when we subscribe
//! - Classify each target into a surface kind, or ignore it
//! - Register/unregister surfaces and emit the matching context events
//! - Prepare attached surfaces (domains, emulation) and release them from
//!   `waitForDebuggerOnStart`

use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cdp::protocol::{AttachedToTarget, TargetInfo};
use crate::cdp::{CDPSession, CdpBackend};
use crate::config::ContextConfig;
use crate::error::{ContextError, Result};
use crate::events::{ContextEvent, ContextEventKind, EventBus, WaitError};
use crate::registry::ExecutionContextRegistry;
use crate::surface::{Surface, SurfaceKind, EXTENSION_SCHEME};

fn is_extension_url(url: &str) -> bool {
    url::Url::parse(url)
        .map(|u| u.scheme() == EXTENSION_SCHEME)
        .unwrap_or(false)
}

/// Map a target to the surface kind it should be tracked as.
///
/// `background_page` targets are manifest v2 background pages. A plain page
/// on an extension URL that no tab opened is one as well. Service workers are
/// tracked; every other target type (iframes, dedicated and shared workers,
/// the browser target) is not.
pub fn classify(info: &TargetInfo) -> Option<SurfaceKind> {
    match info.target_type.as_str() {
        "background_page" => Some(SurfaceKind::BackgroundPage),
        "page" if is_extension_url(&info.url) && info.opener_id.is_none() => {
            Some(SurfaceKind::BackgroundPage)
        }
        "page" => Some(SurfaceKind::Page),
        "service_worker" => Some(SurfaceKind::ServiceWorker),
        _ => None,
    }
}

/// Ids of the isolated contexts that share one connection
pub type IsolatedContextIds = Arc<RwLock<HashSet<String>>>;

/// Which targets belong to a context
#[derive(Debug, Clone, Default)]
pub struct ContextScope {
    pub browser_context_id: Option<String>,
    pub is_default: bool,
    /// Isolated contexts on the same connection. A default context that does
    /// not know its own id still never takes their targets.
    pub isolated: IsolatedContextIds,
}

impl ContextScope {
    pub fn owns(&self, info: &TargetInfo) -> bool {
        match (&info.browser_context_id, &self.browser_context_id) {
            (Some(theirs), Some(ours)) => theirs == ours,
            (Some(theirs), None) => self.is_default && !self.isolated.read().contains(theirs),
            (None, _) => self.is_default,
        }
    }
}

pub struct AttachmentWatcher {
    backend: Arc<dyn CdpBackend>,
    registry: Arc<ExecutionContextRegistry>,
    events: Arc<EventBus<ContextEvent>>,
    scope: ContextScope,
    config: Arc<ContextConfig>,
}

impl AttachmentWatcher {
    pub(crate) fn new(
        backend: Arc<dyn CdpBackend>,
        registry: Arc<ExecutionContextRegistry>,
        events: Arc<EventBus<ContextEvent>>,
        scope: ContextScope,
        config: Arc<ContextConfig>,
    ) -> Self {
        Self {
            backend,
            registry,
            events,
            scope,
            config,
        }
    }

    pub fn scope(&self) -> &ContextScope {
        &self.scope
    }

    /// Turn on discovery and flat auto-attach.
    ///
    /// Targets that already exist are reported through `attachedToTarget`
    /// right after this call, so subscriptions must be in place first.
    pub(crate) async fn start(&self) -> Result<()> {
        self.backend
            .send_request(
                "Target.setDiscoverTargets",
                Some(json!({ "discover": true })),
                None,
            )
            .await?;
        self.backend
            .send_request(
                "Target.setAutoAttach",
                Some(json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": true,
                    "flatten": true,
                })),
                None,
            )
            .await?;
        tracing::debug!(scope = ?self.scope, "[AttachmentWatcher] Auto-attach enabled");
        Ok(())
    }

    pub(crate) async fn on_attached(&self, event: AttachedToTarget) {
        let info = &event.target_info;
        if !self.scope.owns(info) {
            return;
        }

        let session = CDPSession::new(
            self.backend.clone(),
            info.target_id.clone(),
            event.session_id.clone(),
        );

        let Some(kind) = classify(info) else {
            tracing::debug!(
                target_id = %info.target_id,
                target_type = %info.target_type,
                "[AttachmentWatcher] Ignoring target"
            );
            if event.waiting_for_debugger {
                if let Err(e) = session.run_if_waiting_for_debugger().await {
                    tracing::warn!("[AttachmentWatcher] Failed to resume ignored target: {}", e);
                }
            }
            return;
        };

        let surface = Surface::new(
            session,
            kind,
            info.url.clone(),
            self.config.event_capacity(),
            self.config.default_timeout,
        );

        match self.registry.register(&surface) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(target_id = %info.target_id, "[AttachmentWatcher] Duplicate attach ignored");
                return;
            }
            Err(e) => {
                tracing::error!("[AttachmentWatcher] Registry rejected surface: {}", e);
                return;
            }
        }

        tracing::info!(
            target_id = %info.target_id,
            kind = ?kind,
            url = %info.url,
            "[AttachmentWatcher] Surface attached"
        );
        self.events.publish(ContextEvent::attached(surface.clone()));

        self.prepare(&surface, event.waiting_for_debugger).await;
    }

    async fn prepare(&self, surface: &Surface, waiting_for_debugger: bool) {
        let session = surface.session();
        let domains: &[&str] = if surface.kind().is_page() {
            &["Page", "Runtime", "Network"]
        } else {
            &["Runtime", "Network"]
        };
        session.enable_domains(domains).await;

        let emulation = &self.config.emulation;
        if surface.kind().is_page() {
            emulation.apply_to_page(session).await;
        }
        if let Err(e) = emulation.apply_to_surface(session).await {
            tracing::warn!(target_id = %surface.target_id(), "[AttachmentWatcher] Extra headers failed: {}", e);
        }

        if waiting_for_debugger {
            if let Err(e) = session.run_if_waiting_for_debugger().await {
                tracing::warn!(target_id = %surface.target_id(), "[AttachmentWatcher] Resume failed: {}", e);
            }
        }
    }

    pub(crate) fn on_detached(&self, session_id: &str) -> Option<Surface> {
        let surface = self.registry.find_by_session(session_id)?;
        self.remove(surface.target_id())
    }

    pub(crate) fn on_target_gone(&self, target_id: &str) -> Option<Surface> {
        self.remove(target_id)
    }

    /// Unregister and close. `None` if the target was not tracked here.
    fn remove(&self, target_id: &str) -> Option<Surface> {
        let surface = self.registry.unregister(target_id)?;
        tracing::info!(
            target_id = %target_id,
            kind = ?surface.kind(),
            "[AttachmentWatcher] Surface detached"
        );
        surface.mark_closed();
        Some(surface)
    }

    pub(crate) fn on_info_changed(&self, info: &TargetInfo) {
        if let Some(surface) = self.registry.find_by_target(&info.target_id) {
            surface.set_url(&info.url);
        }
    }

    /// First surface of `kind` accepted by `predicate`, already attached or the next to attach.
    ///
    /// The waiter is registered before the snapshot is taken; if the snapshot
    /// already satisfies the call the waiter is dropped unused, so a surface
    /// attaching in between can never produce a second resolution.
    pub async fn wait_for_surface<F>(
        &self,
        kind: SurfaceKind,
        predicate: F,
        timeout: Duration,
    ) -> Result<Surface>
    where
        F: Fn(&Surface) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let matcher = predicate.clone();
        let waiter = self.events.register_waiter(move |event| match event {
            ContextEvent::Close => true,
            _ => event
                .surface()
                .is_some_and(|s| s.kind() == kind && (*matcher)(s)),
        });

        if let Some(existing) = self.registry.list(kind).into_iter().find(|s| (*predicate)(s)) {
            return Ok(existing);
        }

        match waiter.wait(timeout).await {
            Ok(ContextEvent::Close) | Err(WaitError::Closed) => Err(ContextError::ContextClosed),
            Ok(event) => event.surface().cloned().ok_or(ContextError::ContextClosed),
            Err(WaitError::Timeout) => Err(ContextError::AttachmentTimeout {
                event: ContextEventKind::from(kind).to_string(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::testing::FakeBackend;

    fn info(target_id: &str, target_type: &str, url: &str) -> TargetInfo {
        TargetInfo {
            target_id: target_id.to_string(),
            target_type: target_type.to_string(),
            title: String::new(),
            url: url.to_string(),
            attached: true,
            opener_id: None,
            browser_context_id: None,
        }
    }

    fn attached(target: TargetInfo) -> AttachedToTarget {
        AttachedToTarget {
            session_id: format!("S-{}", target.target_id),
            target_info: target,
            waiting_for_debugger: true,
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        registry: Arc<ExecutionContextRegistry>,
        events: Arc<EventBus<ContextEvent>>,
        watcher: AttachmentWatcher,
    }

    fn harness(scope: ContextScope) -> Harness {
        let backend = FakeBackend::new();
        let registry = Arc::new(ExecutionContextRegistry::new());
        let events = Arc::new(EventBus::new(16));
        let watcher = AttachmentWatcher::new(
            backend.clone(),
            registry.clone(),
            events.clone(),
            scope,
            Arc::new(ContextConfig::default()),
        );
        Harness {
            backend,
            registry,
            events,
            watcher,
        }
    }

    fn default_scope() -> ContextScope {
        ContextScope {
            browser_context_id: None,
            is_default: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify() {
        let ext = "chrome-extension://abc/_generated_background_page.html";
        assert_eq!(
            classify(&info("1", "background_page", ext)),
            Some(SurfaceKind::BackgroundPage)
        );
        assert_eq!(classify(&info("2", "page", ext)), Some(SurfaceKind::BackgroundPage));
        assert_eq!(
            classify(&info("3", "page", "about:blank")),
            Some(SurfaceKind::Page)
        );
        assert_eq!(
            classify(&info("4", "service_worker", "chrome-extension://abc/sw.js")),
            Some(SurfaceKind::ServiceWorker)
        );
        for ignored in ["iframe", "worker", "shared_worker", "browser", "other"] {
            assert_eq!(classify(&info("5", ignored, "about:blank")), None);
        }

        // An extension page a tab opened is a regular page
        let mut popup = info("6", "page", "chrome-extension://abc/popup.html");
        popup.opener_id = Some("1".to_string());
        assert_eq!(classify(&popup), Some(SurfaceKind::Page));
    }

    #[test]
    fn test_scope_ownership() {
        let mut target = info("1", "page", "about:blank");
        let named = ContextScope {
            browser_context_id: Some("CTX".to_string()),
            is_default: false,
            ..Default::default()
        };
        let default = ContextScope {
            browser_context_id: Some("DEFAULT".to_string()),
            is_default: true,
            ..Default::default()
        };

        assert!(!named.owns(&target));
        assert!(default.owns(&target));

        target.browser_context_id = Some("CTX".to_string());
        assert!(named.owns(&target));
        assert!(!default.owns(&target));
    }

    #[test]
    fn test_default_without_id_skips_isolated_contexts() {
        let default = default_scope();
        default.isolated.write().insert("CTX".to_string());

        let mut target = info("1", "page", "about:blank");
        assert!(default.owns(&target));

        target.browser_context_id = Some("CTX".to_string());
        assert!(!default.owns(&target));

        target.browser_context_id = Some("UNLISTED".to_string());
        assert!(default.owns(&target));
    }

    #[tokio::test]
    async fn test_attach_registers_emits_and_resumes() {
        let h = harness(default_scope());
        let mut stream = h.events.subscribe();

        h.watcher
            .on_attached(attached(info(
                "BG",
                "background_page",
                "chrome-extension://abc/bg.html",
            )))
            .await;

        let listed = h.registry.list(SurfaceKind::BackgroundPage);
        assert_eq!(listed.len(), 1);
        assert!(h.registry.list(SurfaceKind::Page).is_empty());

        match stream.try_recv() {
            Some(ContextEvent::BackgroundPage(surface)) => assert_eq!(surface, listed[0]),
            other => panic!("Expected BackgroundPage event, got {:?}", other),
        }

        assert_eq!(h.backend.sent_to("Network.enable")[0].session_id.as_deref(), Some("S-BG"));
        assert!(h.backend.sent_to("Page.enable").is_empty());
        assert_eq!(h.backend.sent_to("Runtime.runIfWaitingForDebugger").len(), 1);
    }

    #[tokio::test]
    async fn test_ignored_target_is_resumed_not_registered() {
        let h = harness(default_scope());

        h.watcher
            .on_attached(attached(info("IF", "iframe", "http://localhost/frame.html")))
            .await;

        assert!(h.registry.is_empty());
        assert_eq!(h.backend.sent_to("Runtime.runIfWaitingForDebugger").len(), 1);
        assert!(h.backend.sent_to("Network.enable").is_empty());
    }

    #[tokio::test]
    async fn test_foreign_context_target_left_alone() {
        let h = harness(ContextScope {
            browser_context_id: Some("MINE".to_string()),
            is_default: false,
            ..Default::default()
        });
        let mut target = info("P", "page", "about:blank");
        target.browser_context_id = Some("OTHER".to_string());

        h.watcher.on_attached(attached(target)).await;

        assert!(h.registry.is_empty());
        assert!(h.backend.sent().is_empty());
    }

    #[tokio::test]
    async fn test_detach_unregisters_and_closes() {
        let h = harness(default_scope());
        h.watcher
            .on_attached(attached(info("SW", "service_worker", "chrome-extension://abc/sw.js")))
            .await;
        let sw = h.registry.list(SurfaceKind::ServiceWorker)[0].clone();

        assert_eq!(h.watcher.on_detached("S-SW"), Some(sw.clone()));
        assert_eq!(h.watcher.on_detached("S-SW"), None);

        assert!(sw.is_closed());
        assert!(h.registry.list(SurfaceKind::ServiceWorker).is_empty());
    }

    #[tokio::test]
    async fn test_info_change_updates_url() {
        let h = harness(default_scope());
        h.watcher
            .on_attached(attached(info("BG", "background_page", "about:blank")))
            .await;

        h.watcher
            .on_info_changed(&info("BG", "background_page", "chrome-extension://abc/bg.html"));

        let bg = h.registry.list(SurfaceKind::BackgroundPage)[0].clone();
        assert_eq!(bg.url(), "chrome-extension://abc/bg.html");
    }

    #[tokio::test]
    async fn test_wait_for_surface_prefers_existing() {
        let h = harness(default_scope());
        h.watcher
            .on_attached(attached(info("BG", "background_page", "chrome-extension://abc/bg.html")))
            .await;

        let found = h
            .watcher
            .wait_for_surface(SurfaceKind::BackgroundPage, |_| true, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(found.target_id(), "BG");
        assert_eq!(h.events.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_surface_times_out_cleanly() {
        let h = harness(default_scope());
        h.watcher
            .on_attached(attached(info("P", "page", "about:blank")))
            .await;

        let err = h
            .watcher
            .wait_for_surface(SurfaceKind::ServiceWorker, |_| true, Duration::from_millis(5000))
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            ContextError::AttachmentTimeout { event, timeout }
                if event == "serviceworker" && *timeout == Duration::from_millis(5000)
        ));
        assert!(err.to_string().contains("5000ms"));
        assert_eq!(h.events.waiter_count(), 0);
    }
}
