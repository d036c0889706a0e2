//! Configuration for contexts and the process-wide wait timeout.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::emulation::EmulationOptions;

/// Initial process-wide default for every wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

static DEFAULT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(DEFAULT_TIMEOUT.as_secs() * 1000);

/// Whole milliseconds, saturating at `u64::MAX`
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Timeout used by waits that pass `None` and whose context has no override.
pub fn default_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Change the process-wide default timeout.
pub fn set_default_timeout(timeout: Duration) {
    DEFAULT_TIMEOUT_MS.store(saturating_millis(timeout), Ordering::Relaxed);
}

/// Per-context configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextConfig {
    /// Overrides the process-wide default for waits on this context
    #[serde(with = "opt_millis")]
    pub default_timeout: Option<Duration>,

    /// Options applied to every attached page
    pub emulation: EmulationOptions,

    /// Broadcast capacity for the context and surface event streams
    pub event_capacity: Option<usize>,
}

impl ContextConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_emulation(mut self, emulation: EmulationOptions) -> Self {
        self.emulation = emulation;
        self
    }

    /// Resolve a caller-supplied timeout against context and process defaults.
    pub fn resolve_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout
            .or(self.default_timeout)
            .unwrap_or_else(default_timeout)
    }

    /// Never zero; a broadcast channel needs room for one event
    pub(crate) fn event_capacity(&self) -> usize {
        self.event_capacity.unwrap_or(256).max(1)
    }
}

pub(crate) mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&super::saturating_millis(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
