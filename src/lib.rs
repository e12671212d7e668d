//! User-facing Rust SDK for the Defined realtime subscription service.
//!
//! The crate is organized by concern:
//! - `auth`: connection-time auth header encoding and URL construction.
//! - `gql`: subscription query builders and typed payloads.
//! - `stream`: the realtime websocket client, frame codec and dispatcher.

/// Auth header encoding and connection URL helpers.
pub mod auth;
/// Subscription query builders and typed payload shapes.
pub mod gql;
/// Realtime client, protocol frames, subscription registry and transport.
pub mod stream;

pub use stream::client::{
    ConnectionState, RealtimeClient, RealtimeClientOptions, RealtimeError, SubscriptionHandle,
};
pub use stream::registry::{Consumer, FnSink, SubscriptionError, SubscriptionId};
