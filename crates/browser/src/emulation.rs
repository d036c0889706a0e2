//! Persistent-context emulation options
//!
//! Responsibilities:
//! - Apply page-level overrides (touch, viewport, media features, locale,
//!   timezone, geolocation) to every page as it attaches
//! - Apply extra HTTP headers to every surface, workers included
//! - Apply context-level grants (permissions, certificate errors) once

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::cdp::client::Result;
use crate::cdp::{CDPSession, CdpBackend};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmulationOptions {
    pub viewport: Option<Viewport>,
    pub device_scale_factor: Option<f64>,
    pub is_mobile: bool,
    pub has_touch: bool,
    /// "light" | "dark" | "no-preference"
    pub color_scheme: Option<String>,
    /// "reduce" | "no-preference"
    pub reduced_motion: Option<String>,
    /// "active" | "none"
    pub forced_colors: Option<String>,
    pub locale: Option<String>,
    pub timezone_id: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub permissions: Vec<String>,
    pub extra_http_headers: BTreeMap<String, String>,
    #[serde(rename = "ignoreHTTPSErrors")]
    pub ignore_https_errors: bool,
}

impl EmulationOptions {
    fn media_features(&self) -> Vec<Value> {
        [
            ("prefers-color-scheme", &self.color_scheme),
            ("prefers-reduced-motion", &self.reduced_motion),
            ("forced-colors", &self.forced_colors),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .as_ref()
                .map(|value| json!({ "name": name, "value": value }))
        })
        .collect()
    }

    /// Context-wide grants, sent once at the browser level.
    ///
    /// `Security.setIgnoreCertificateErrors` has no context parameter and
    /// covers the whole browser, so only the default context sends it.
    pub async fn apply_to_context(
        &self,
        backend: &dyn CdpBackend,
        browser_context_id: Option<&str>,
        is_default: bool,
    ) -> Result<()> {
        if !self.permissions.is_empty() {
            let mut params = json!({ "permissions": self.permissions });
            if let Some(id) = browser_context_id {
                params["browserContextId"] = json!(id);
            }
            backend
                .send_request("Browser.grantPermissions", Some(params), None)
                .await?;
        }

        if self.ignore_https_errors {
            if is_default {
                backend
                    .send_request(
                        "Security.setIgnoreCertificateErrors",
                        Some(json!({ "ignore": true })),
                        None,
                    )
                    .await?;
            } else {
                tracing::warn!(
                    browser_context_id = ?browser_context_id,
                    "ignoreHTTPSErrors is browser-wide, skipped for an isolated context"
                );
            }
        }

        Ok(())
    }

    fn page_overrides(&self) -> Vec<(&'static str, Value)> {
        let mut overrides = Vec::new();

        if let Some(viewport) = self.viewport {
            overrides.push((
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": viewport.width,
                    "height": viewport.height,
                    "deviceScaleFactor": self.device_scale_factor.unwrap_or(1.0),
                    "mobile": self.is_mobile,
                }),
            ));
        }
        if self.has_touch {
            overrides.push((
                "Emulation.setTouchEmulationEnabled",
                json!({ "enabled": true }),
            ));
        }
        let features = self.media_features();
        if !features.is_empty() {
            overrides.push((
                "Emulation.setEmulatedMedia",
                json!({ "media": "", "features": features }),
            ));
        }
        if let Some(locale) = &self.locale {
            overrides.push(("Emulation.setLocaleOverride", json!({ "locale": locale })));
        }
        if let Some(timezone_id) = &self.timezone_id {
            overrides.push((
                "Emulation.setTimezoneOverride",
                json!({ "timezoneId": timezone_id }),
            ));
        }
        if let Some(geo) = self.geolocation {
            overrides.push((
                "Emulation.setGeolocationOverride",
                json!({
                    "latitude": geo.latitude,
                    "longitude": geo.longitude,
                    "accuracy": geo.accuracy.unwrap_or(0.0),
                }),
            ));
        }

        overrides
    }

    /// Overrides that apply to pages only. Each one is sent on its own; a
    /// failure is logged and the rest still go out. Returns the failure count.
    pub async fn apply_to_page(&self, session: &CDPSession) -> usize {
        let mut failures = 0;
        for (method, params) in self.page_overrides() {
            if let Err(e) = session.send(method, Some(params)).await {
                tracing::warn!(target_id = %session.target_id, "{} failed: {}", method, e);
                failures += 1;
            }
        }
        failures
    }

    /// Overrides that apply to any surface with a network stack
    pub async fn apply_to_surface(&self, session: &CDPSession) -> Result<()> {
        if !self.extra_http_headers.is_empty() {
            session
                .send(
                    "Network.setExtraHTTPHeaders",
                    Some(json!({ "headers": self.extra_http_headers })),
                )
                .await?;
        }
        Ok(())
    }
}
