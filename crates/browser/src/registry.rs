//! Per-context surface registry.
//!
//! Three ordered lists behind one lock. Writers are the context event loop
//! only; everyone else reads snapshots.

use parking_lot::Mutex;

use crate::error::{ContextError, Result};
use crate::surface::{Surface, SurfaceKind};

#[derive(Default)]
struct Lists {
    pages: Vec<Surface>,
    background_pages: Vec<Surface>,
    service_workers: Vec<Surface>,
}

impl Lists {
    fn of(&self, kind: SurfaceKind) -> &Vec<Surface> {
        match kind {
            SurfaceKind::Page => &self.pages,
            SurfaceKind::BackgroundPage => &self.background_pages,
            SurfaceKind::ServiceWorker => &self.service_workers,
        }
    }

    fn of_mut(&mut self, kind: SurfaceKind) -> &mut Vec<Surface> {
        match kind {
            SurfaceKind::Page => &mut self.pages,
            SurfaceKind::BackgroundPage => &mut self.background_pages,
            SurfaceKind::ServiceWorker => &mut self.service_workers,
        }
    }

    fn all(&self) -> impl Iterator<Item = &Surface> {
        self.pages
            .iter()
            .chain(&self.background_pages)
            .chain(&self.service_workers)
    }
}

#[derive(Default)]
pub struct ExecutionContextRegistry {
    lists: Mutex<Lists>,
}

impl ExecutionContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time snapshot of one kind, in attach order
    pub fn list(&self, kind: SurfaceKind) -> Vec<Surface> {
        self.lists.lock().of(kind).clone()
    }

    /// Add a surface. Returns false if its target is already registered.
    pub fn register(&self, surface: &Surface) -> Result<bool> {
        if surface.is_closed() {
            return Err(ContextError::StaleSurface(surface.target_id().to_string()));
        }

        let mut lists = self.lists.lock();
        if lists.all().any(|s| s.target_id() == surface.target_id()) {
            return Ok(false);
        }
        lists.of_mut(surface.kind()).push(surface.clone());
        Ok(true)
    }

    /// Remove a surface by target id. Idempotent.
    pub fn unregister(&self, target_id: &str) -> Option<Surface> {
        let mut lists = self.lists.lock();
        for kind in SurfaceKind::ALL {
            let list = lists.of_mut(kind);
            if let Some(pos) = list.iter().position(|s| s.target_id() == target_id) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    pub fn find_by_target(&self, target_id: &str) -> Option<Surface> {
        self.lists
            .lock()
            .all()
            .find(|s| s.target_id() == target_id)
            .cloned()
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<Surface> {
        self.lists
            .lock()
            .all()
            .find(|s| s.session_id() == session_id)
            .cloned()
    }

    /// Empty every list under a single lock acquisition
    pub fn drain(&self) -> Vec<Surface> {
        let mut lists = self.lists.lock();
        let drained = std::mem::take(&mut *lists);
        drained
            .pages
            .into_iter()
            .chain(drained.background_pages)
            .chain(drained.service_workers)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lists.lock().all().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::testing::FakeBackend;
    use crate::cdp::CDPSession;

    fn surface(target: &str, kind: SurfaceKind) -> Surface {
        let session = CDPSession::new(FakeBackend::new(), target.into(), format!("S-{}", target));
        Surface::new(session, kind, "about:blank".to_string(), 16, None)
    }

    #[test]
    fn test_kinds_are_disjoint() {
        let registry = ExecutionContextRegistry::new();
        let page = surface("P1", SurfaceKind::Page);
        let bg = surface("B1", SurfaceKind::BackgroundPage);
        let sw = surface("W1", SurfaceKind::ServiceWorker);

        for s in [&page, &bg, &sw] {
            assert!(registry.register(s).unwrap());
        }

        assert_eq!(registry.list(SurfaceKind::Page), vec![page.clone()]);
        assert_eq!(registry.list(SurfaceKind::BackgroundPage), vec![bg.clone()]);
        assert_eq!(registry.list(SurfaceKind::ServiceWorker), vec![sw.clone()]);
        assert!(!registry.list(SurfaceKind::Page).contains(&bg));
        assert_eq!(registry.find_by_session("S-W1"), Some(sw));
    }

    #[test]
    fn test_register_is_exactly_once() {
        let registry = ExecutionContextRegistry::new();
        let bg = surface("B1", SurfaceKind::BackgroundPage);

        assert!(registry.register(&bg).unwrap());
        assert!(!registry.register(&bg.clone()).unwrap());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_closed_surface_is_stale() {
        let registry = ExecutionContextRegistry::new();
        let bg = surface("B1", SurfaceKind::BackgroundPage);
        bg.mark_closed();

        let err = registry.register(&bg).unwrap_err();
        assert!(matches!(err, ContextError::StaleSurface(id) if id == "B1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregistered_surface_leaves_snapshots() {
        let registry = ExecutionContextRegistry::new();
        let first = surface("P1", SurfaceKind::Page);
        let second = surface("P2", SurfaceKind::Page);
        registry.register(&first).unwrap();
        registry.register(&second).unwrap();

        let before = registry.list(SurfaceKind::Page);
        assert_eq!(registry.unregister("P1"), Some(first.clone()));
        assert_eq!(registry.unregister("P1"), None);

        // Earlier snapshots are not live views
        assert_eq!(before.len(), 2);
        assert_eq!(registry.list(SurfaceKind::Page), vec![second]);
        assert!(registry.find_by_target("P1").is_none());
    }

    #[test]
    fn test_drain_empties_everything_at_once() {
        let registry = ExecutionContextRegistry::new();
        registry.register(&surface("P1", SurfaceKind::Page)).unwrap();
        registry.register(&surface("B1", SurfaceKind::BackgroundPage)).unwrap();
        registry.register(&surface("W1", SurfaceKind::ServiceWorker)).unwrap();

        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        for kind in SurfaceKind::ALL {
            assert!(registry.list(kind).is_empty());
        }
    }
}
