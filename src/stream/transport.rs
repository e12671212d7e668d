//! Socket factory seam.
//!
//! The client never touches a websocket type directly: it asks a
//! [`SocketFactory`] for a [`SocketHandle`] (a text sink plus a text stream)
//! once per client, and drives that handle from its connection worker.

use std::pin::Pin;

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::stream::client::RealtimeError;

/// Subprotocol announced during the websocket handshake.
pub const WS_TRANSPORT_PROTOCOL: &str = "graphql-ws";

pub type TextSink = Pin<Box<dyn Sink<String, Error = RealtimeError> + Send>>;
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, RealtimeError>> + Send>>;

/// An open socket.
///
/// Closing `sink` requests a close; `stream` ends once the close has been
/// observed or the peer goes away.
pub struct SocketHandle {
    pub sink: TextSink,
    pub stream: TextStream,
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle").finish_non_exhaustive()
    }
}

/// Opens sockets for the realtime client.
pub trait SocketFactory: Send + Sync + 'static {
    /// Opens a socket to `url` announcing `subprotocol`. The returned future
    /// resolves once the socket is open.
    fn connect(
        &self,
        url: String,
        subprotocol: &'static str,
    ) -> BoxFuture<'static, Result<SocketHandle, RealtimeError>>;
}

/// Default factory backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteFactory;

impl SocketFactory for TungsteniteFactory {
    fn connect(
        &self,
        url: String,
        subprotocol: &'static str,
    ) -> BoxFuture<'static, Result<SocketHandle, RealtimeError>> {
        Box::pin(async move {
            let mut request = url.into_client_request()?;
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(subprotocol)?);

            let (socket, _) = connect_async(request).await?;
            let (sink, stream) = socket.split();

            let sink = sink
                .sink_map_err(RealtimeError::from)
                .with(|text: String| future::ready(Ok::<_, RealtimeError>(Message::Text(text))));
            let stream = stream.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => {
                        debug!(event = "binary_frame_ignored", len = bytes.len());
                        None
                    }
                    // Ping/pong replies are handled by tungstenite; close is
                    // followed by the end of the stream.
                    Ok(_) => None,
                    Err(err) => Some(Err(RealtimeError::from(err))),
                })
            });

            Ok(SocketHandle {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}
