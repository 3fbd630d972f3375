//! # Transport Bridge
//!
//! Fan-in of change requests from MQTT and the HTTP API, fan-out of accepted
//! changes to viewers and back to the broker.
//!
//! ```text
//!  MQTT inbound ──┐                              ┌──► RealtimeHub (set_* / state_reset / reload_page)
//!                 ├──► decode ──► StateStore ────┤
//!  HTTP API ──────┘                              └──► MQTT <prefix>/<field>/state (best-effort)
//!
//!  reset timer ──► StateStore ──► reset channel ──► bridge ──► state_reset
//! ```
//!
//! Every accepted mutation is broadcast on all channels, including back to
//! MQTT, whichever transport it came from. Reload is the exception: it only
//! reaches viewers.

pub mod inbound;
pub mod transport_bridge;

pub use inbound::{InboundKind, InboundSource};
pub use transport_bridge::TransportBridge;
