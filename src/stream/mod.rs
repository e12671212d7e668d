//! Realtime stream modules.
//!
//! - `client`: connection lifecycle, subscribe/unsubscribe and the
//!   background socket worker.
//! - `proto`: wire frames shared with the realtime service.
//! - `registry`: subscription ids and the consumers they route to.
//! - `dispatch`: inbound frame routing.
//! - `transport`: socket factory seam and the websocket implementation.

/// Realtime client and connection lifecycle.
pub mod client;
/// Inbound frame routing.
pub mod dispatch;
/// Wire frames.
pub mod proto;
/// Subscription registry and consumer capability.
pub mod registry;
/// Socket factory abstraction.
pub mod transport;
