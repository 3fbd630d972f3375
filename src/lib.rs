//! Avatar presentation state, kept in sync across MQTT and WebSocket viewers.
//!
//! ```text
//! mqtt ──► bridge ──► state::store ──► bridge ──► realtime (viewers)
//!  api ──┘                                    └─► mqtt (<prefix>/<field>/state)
//! ```

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod realtime;
pub mod state;
