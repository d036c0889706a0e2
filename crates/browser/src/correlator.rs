//! Event Correlator - network and console events to shared objects
//!
//! Raw `Network.*` and `Runtime.consoleAPICalled` events arrive per session.
//! The correlator builds one object per logical request, keeps it while the
//! request is in flight, and fans every event out twice: the owning surface's
//! stream first, then the context stream. Both deliveries carry the same `Arc`.

use dashmap::DashMap;
use std::sync::Arc;

use crate::cdp::protocol::{
    ConsoleApiCalled, LoadingFailed, LoadingFinished, RequestWillBeSent, ResponseReceived,
};
use crate::cdp::SessionId;
use crate::events::{ContextEvent, EventBus, SurfaceEvent};
use crate::network::{ConsoleMessage, Request, Response};
use crate::registry::ExecutionContextRegistry;
use crate::surface::Surface;

/// Request ids are only unique per session
type InFlightKey = (SessionId, String);

pub struct EventCorrelator {
    registry: Arc<ExecutionContextRegistry>,
    events: Arc<EventBus<ContextEvent>>,
    in_flight: DashMap<InFlightKey, Arc<Request>>,
}

impl EventCorrelator {
    pub(crate) fn new(
        registry: Arc<ExecutionContextRegistry>,
        events: Arc<EventBus<ContextEvent>>,
    ) -> Self {
        Self {
            registry,
            events,
            in_flight: DashMap::new(),
        }
    }

    fn key(session_id: &str, request_id: &str) -> InFlightKey {
        (session_id.to_string(), request_id.to_string())
    }

    fn emit(&self, surface: &Surface, surface_event: SurfaceEvent, context_event: ContextEvent) {
        surface.publish(surface_event);
        self.events.publish(context_event);
    }

    fn emit_response(&self, surface: &Surface, response: Response) {
        let response = Arc::new(response);
        self.emit(
            surface,
            SurfaceEvent::Response(response.clone()),
            ContextEvent::Response(response),
        );
    }

    fn emit_finished(&self, surface: &Surface, request: Arc<Request>) {
        self.emit(
            surface,
            SurfaceEvent::RequestFinished(request.clone()),
            ContextEvent::RequestFinished(request),
        );
    }

    pub(crate) fn on_request_will_be_sent(&self, session_id: &str, event: &RequestWillBeSent) {
        let Some(surface) = self.registry.find_by_session(session_id) else {
            return;
        };
        let key = Self::key(session_id, &event.request_id);

        // A redirect reuses the request id: the hop before it completes here
        let mut redirected_from = None;
        if let Some(redirect) = &event.redirect_response {
            if let Some((_, previous)) = self.in_flight.remove(&key) {
                previous.mark_response_start(event.timestamp);
                previous.mark_response_end(event.timestamp);
                self.emit_response(
                    &surface,
                    Response::from_cdp(previous.clone(), redirect, surface.session().clone()),
                );
                self.emit_finished(&surface, previous.clone());
                redirected_from = Some(previous);
            }
        }

        let request = Arc::new(Request::from_cdp(
            surface.target_id().to_string(),
            event,
            redirected_from,
        ));
        tracing::trace!(
            target_id = %surface.target_id(),
            method = %request.method(),
            url = %request.url(),
            "[EventCorrelator] Request"
        );
        self.in_flight.insert(key, request.clone());
        self.emit(
            &surface,
            SurfaceEvent::Request(request.clone()),
            ContextEvent::Request(request),
        );
    }

    pub(crate) fn on_response_received(&self, session_id: &str, event: &ResponseReceived) {
        let Some(surface) = self.registry.find_by_session(session_id) else {
            return;
        };
        let Some(request) = self
            .in_flight
            .get(&Self::key(session_id, &event.request_id))
            .map(|entry| entry.value().clone())
        else {
            tracing::debug!(request_id = %event.request_id, "[EventCorrelator] Response for unknown request");
            return;
        };

        request.mark_response_start(event.timestamp);
        self.emit_response(
            &surface,
            Response::from_cdp(request, &event.response, surface.session().clone()),
        );
    }

    pub(crate) fn on_loading_finished(&self, session_id: &str, event: &LoadingFinished) {
        let Some((_, request)) = self
            .in_flight
            .remove(&Self::key(session_id, &event.request_id))
        else {
            return;
        };
        request.mark_response_end(event.timestamp);
        if let Some(surface) = self.registry.find_by_session(session_id) {
            self.emit_finished(&surface, request);
        }
    }

    pub(crate) fn on_loading_failed(&self, session_id: &str, event: &LoadingFailed) {
        let Some((_, request)) = self
            .in_flight
            .remove(&Self::key(session_id, &event.request_id))
        else {
            return;
        };
        request.mark_failed(&event.error_text, event.timestamp);
        tracing::debug!(
            url = %request.url(),
            error = %event.error_text,
            canceled = event.canceled,
            "[EventCorrelator] Request failed"
        );
        if let Some(surface) = self.registry.find_by_session(session_id) {
            self.emit(
                &surface,
                SurfaceEvent::RequestFailed(request.clone()),
                ContextEvent::RequestFailed(request),
            );
        }
    }

    pub(crate) fn on_console(&self, session_id: &str, event: &ConsoleApiCalled) {
        let Some(surface) = self.registry.find_by_session(session_id) else {
            return;
        };
        let message = Arc::new(ConsoleMessage::from_cdp(
            surface.target_id().to_string(),
            event,
        ));
        self.emit(
            &surface,
            SurfaceEvent::Console(message.clone()),
            ContextEvent::Console(message),
        );
    }

    /// Drop in-flight requests of a surface that went away
    pub(crate) fn forget_session(&self, session_id: &str) {
        self.in_flight.retain(|(session, _), _| session != session_id);
    }

    pub(crate) fn clear(&self) {
        self.in_flight.clear();
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
