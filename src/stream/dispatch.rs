//! Inbound frame routing.
//!
//! Every text frame read from the socket passes through [`dispatch_frame`]
//! exactly once, in the order the socket delivered it. Nothing here returns
//! an error: frames that cannot be routed are logged and dropped.

use tracing::{debug, warn};

use crate::stream::proto::{FrameKind, ServerFrame};
use crate::stream::registry::{SubscriptionError, SubscriptionId, SubscriptionRegistry};

/// What happened to one inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Payload data was handed to the subscription's consumer.
    Delivered(SubscriptionId),
    /// An error frame was handed to the subscription's `on_error`.
    Errored(SubscriptionId),
    /// The server completed the subscription; its entry was released.
    Completed(SubscriptionId),
    /// Start acknowledgement, nothing to forward.
    Acknowledged(SubscriptionId),
    /// Heartbeat.
    KeepAlive,
    /// Frame was not JSON or not a frame envelope.
    Malformed,
    /// Frame carried no subscription id.
    Unroutable,
    /// Frame id does not belong to any registered subscription.
    Foreign,
}

/// Routes one raw inbound frame to the consumer registered for its id.
pub fn dispatch_frame(registry: &SubscriptionRegistry, text: &str) -> Dispatch {
    let frame = match ServerFrame::from_text(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "frame_parse_failed", error = %err);
            return Dispatch::Malformed;
        }
    };

    if frame.kind == FrameKind::KeepAlive {
        return Dispatch::KeepAlive;
    }

    let Some(raw_id) = frame.id.as_deref() else {
        warn!(
            event = "frame_missing_id",
            kind = ?frame.kind,
            errors = %frame.errors()
        );
        return Dispatch::Unroutable;
    };

    let Ok(id) = raw_id.parse::<SubscriptionId>() else {
        debug!(event = "frame_foreign", id = raw_id);
        return Dispatch::Foreign;
    };
    let Some(consumer) = registry.lookup(&id) else {
        debug!(event = "frame_foreign", id = raw_id);
        return Dispatch::Foreign;
    };

    match frame.kind {
        FrameKind::StartAck => Dispatch::Acknowledged(id),
        FrameKind::Error => {
            let errors = frame.errors();
            warn!(event = "subscription_error", subscription_id = %id, errors = %errors);
            consumer.on_error(SubscriptionError { id, errors });
            Dispatch::Errored(id)
        }
        FrameKind::Complete => {
            registry.unregister(&id);
            consumer.on_complete();
            Dispatch::Completed(id)
        }
        _ => {
            consumer.on_data(frame.data());
            Dispatch::Delivered(id)
        }
    }
}
