//! CDP (Chrome DevTools Protocol) Client Implementation
//!
//! Core principle: Single WebSocket connection, multiplexed sessions.
//! No locks in hot path - use message passing instead.

pub mod client;
pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{CDPClient, CDPError, CdpBackend, EventCallback, SubscriptionId};
pub use protocol::{CDPEvent, CDPRequest, CDPResponse, SessionId, TargetId, TargetInfo};
pub use session::{CDPSession, Evaluation};
