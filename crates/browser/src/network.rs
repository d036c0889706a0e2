//! Network and console objects shared between surface and context streams.
//!
//! Each object is created once and handed out as an `Arc`, so the same
//! logical request seen from two streams is the same allocation.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::cdp::protocol::{ConsoleApiCalled, NetworkResponse, RequestWillBeSent};
use crate::cdp::{CDPSession, TargetId};
use crate::error::Result;

/// HTTP headers, sorted by name. Lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub(crate) fn from_cdp(raw: &HashMap<String, Value>) -> Self {
        let mut pairs: Vec<(String, String)> = raw
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), value)
            })
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Self(pairs)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Lower-cased names, as `allHeaders()` reports them
    pub fn to_lowercase_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Timing in milliseconds. `start_time` is wall clock, the rest are relative to it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestTiming {
    pub start_time: f64,
    pub response_start: Option<f64>,
    pub response_end: Option<f64>,
}

#[derive(Debug)]
pub struct Request {
    id: String,
    target_id: TargetId,
    url: String,
    method: String,
    headers: Headers,
    post_data: Option<String>,
    resource_type: String,
    redirected_from: Option<Arc<Request>>,
    /// CDP monotonic timestamp (seconds) the timing offsets are based on
    base_timestamp: f64,
    timing: Mutex<RequestTiming>,
    failure: Mutex<Option<String>>,
}

impl Request {
    pub(crate) fn from_cdp(
        target_id: TargetId,
        event: &RequestWillBeSent,
        redirected_from: Option<Arc<Request>>,
    ) -> Self {
        Self {
            id: event.request_id.clone(),
            target_id,
            url: event.request.url.clone(),
            method: event.request.method.clone(),
            headers: Headers::from_cdp(&event.request.headers),
            post_data: event.request.post_data.clone(),
            resource_type: event
                .resource_type
                .as_deref()
                .unwrap_or("Other")
                .to_ascii_lowercase(),
            redirected_from,
            base_timestamp: event.timestamp,
            timing: Mutex::new(RequestTiming {
                start_time: event.wall_time * 1000.0,
                ..Default::default()
            }),
            failure: Mutex::new(None),
        }
    }

    /// CDP request id, unique within the issuing surface
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target id of the surface that issued the request
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn post_data(&self) -> Option<&str> {
        self.post_data.as_deref()
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn redirected_from(&self) -> Option<&Arc<Request>> {
        self.redirected_from.as_ref()
    }

    pub fn timing(&self) -> RequestTiming {
        *self.timing.lock()
    }

    /// Error text once the request failed
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn offset_ms(&self, timestamp: f64) -> Option<f64> {
        (timestamp > 0.0 && self.base_timestamp > 0.0)
            .then(|| (timestamp - self.base_timestamp) * 1000.0)
    }

    pub(crate) fn mark_response_start(&self, timestamp: f64) {
        self.timing.lock().response_start = self.offset_ms(timestamp);
    }

    pub(crate) fn mark_response_end(&self, timestamp: f64) {
        self.timing.lock().response_end = self.offset_ms(timestamp);
    }

    pub(crate) fn mark_failed(&self, error_text: &str, timestamp: f64) {
        *self.failure.lock() = Some(error_text.to_string());
        self.mark_response_end(timestamp);
    }
}

#[derive(Debug)]
pub struct Response {
    request: Arc<Request>,
    url: String,
    status: u16,
    status_text: String,
    headers: Headers,
    from_service_worker: bool,
    session: CDPSession,
}

impl Response {
    pub(crate) fn from_cdp(
        request: Arc<Request>,
        response: &NetworkResponse,
        session: CDPSession,
    ) -> Self {
        Self {
            request,
            url: response.url.clone(),
            status: u16::try_from(response.status).unwrap_or(0),
            status_text: response.status_text.clone(),
            headers: Headers::from_cdp(&response.headers),
            from_service_worker: response.from_service_worker,
            session,
        }
    }

    /// The request this response answers, the same instance the request streams saw
    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn ok(&self) -> bool {
        self.status == 0 || (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn from_service_worker(&self) -> bool {
        self.from_service_worker
    }

    pub async fn body(&self) -> Result<Vec<u8>> {
        Ok(self.session.response_body(self.request.id()).await?)
    }

    pub async fn text(&self) -> Result<String> {
        let body = self.body().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleMessage {
    kind: String,
    text: String,
    args: Vec<Value>,
    target_id: TargetId,
    timestamp: f64,
}

impl ConsoleMessage {
    pub(crate) fn from_cdp(target_id: TargetId, event: &ConsoleApiCalled) -> Self {
        let text = event
            .args
            .iter()
            .map(|arg| match (&arg.value, &arg.description) {
                (Some(Value::String(s)), _) => s.clone(),
                (Some(value), _) => value.to_string(),
                (None, Some(description)) => description.clone(),
                (None, None) => arg.object_type.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            kind: event.kind.clone(),
            text,
            args: event
                .args
                .iter()
                .map(|arg| arg.value.clone().unwrap_or(Value::Null))
                .collect(),
            target_id,
            timestamp: event.timestamp,
        }
    }

    /// "log", "error", "warning", ...
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }
}
