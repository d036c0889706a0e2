//! Browser Surfaces - extension-aware browser context tracking over CDP
//!
//! Tracks every execution surface of a browser context (pages, extension
//! background pages and extension service workers) and correlates their
//! network and console traffic, all over a single flat CDP connection.
//!
//! # Architecture
//!
//! 1. **One connection**: every surface is a flat session on one WebSocket
//! 2. **One loop per context**: target, network and console events are
//!    handled by a single task, so the registry never races with itself
//! 3. **Shared objects**: a request seen from a surface and from its context
//!    is the same `Arc`
//! 4. **Bounded waits**: every `wait_for_*` has a timeout and leaves nothing
//!    behind when it expires

pub mod cdp;
pub mod config;
pub mod context;
pub mod correlator;
pub mod emulation;
pub mod error;
pub mod events;
pub mod launch;
pub mod network;
pub mod registry;
pub mod session;
pub mod surface;
pub mod watcher;

pub use cdp::{CDPClient, CDPSession, CdpBackend};
pub use config::{default_timeout, set_default_timeout, ContextConfig};
pub use context::{BrowserContext, ContextState};
pub use emulation::EmulationOptions;
pub use error::{ContextError, Result};
pub use events::{ContextEvent, ContextEventKind, EventBus, EventStream, SurfaceEvent, SurfaceEventKind};
pub use launch::PersistentLaunchOptions;
pub use network::{ConsoleMessage, Headers, Request, Response};
pub use session::{BrowserSession, SessionConfig};
pub use surface::{Surface, SurfaceKind};
pub use watcher::{ContextScope, IsolatedContextIds};
