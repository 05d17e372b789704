//! Consumer-facing callbacks of a live session.
//!
//! The session calls its sink with one batch at a time, in arrival order, and
//! never concurrently. It does not time the sink out: a slow sink holds back
//! every later batch.

use tokio::sync::mpsc;
use tracing::debug;

use crate::model::DeliveryBatch;
use crate::subscription::session::SessionError;

/// Receives normalized value batches.
pub trait UpdateSink: Send + Sync + 'static {
    fn deliver(&self, batch: DeliveryBatch);
}

impl<F> UpdateSink for F
where
    F: Fn(DeliveryBatch) + Send + Sync + 'static,
{
    fn deliver(&self, batch: DeliveryBatch) {
        self(batch)
    }
}

/// Receives errors the session surfaces to its owner.
pub trait ErrorHandler: Send + Sync + 'static {
    fn on_error(&self, error: SessionError);
}

impl<F> ErrorHandler for F
where
    F: Fn(SessionError) + Send + Sync + 'static,
{
    fn on_error(&self, error: SessionError) {
        self(error)
    }
}

/// Sink that forwards batches into an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DeliveryBatch>,
}

impl UpdateSink for ChannelSink {
    fn deliver(&self, batch: DeliveryBatch) {
        if self.tx.send(batch).is_err() {
            debug!(event = "sink_receiver_dropped");
        }
    }
}

/// Creates a [`ChannelSink`] and the receiver its batches arrive on.
pub fn channel_sink() -> (ChannelSink, mpsc::UnboundedReceiver<DeliveryBatch>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{channel_sink, UpdateSink};
    use crate::model::{DeliveryBatch, ValueUpdate};

    #[test]
    fn channel_sink_preserves_batch_order() {
        let (sink, mut rx) = channel_sink();
        for value in [1, 2] {
            let batch = DeliveryBatch::new(vec![ValueUpdate {
                element_id: "pump".to_string(),
                value: json!(value),
                timestamp: None,
                quality: None,
            }])
            .expect("batch");
            sink.deliver(batch);
        }

        let first = rx.try_recv().expect("first batch");
        let second = rx.try_recv().expect("second batch");
        assert_eq!(first.updates()[0].value, json!(1));
        assert_eq!(second.updates()[0].value, json!(2));
    }

    #[test]
    fn channel_sink_ignores_dropped_receiver() {
        let (sink, rx) = channel_sink();
        drop(rx);
        let batch = DeliveryBatch::new(vec![ValueUpdate {
            element_id: "pump".to_string(),
            value: json!(0),
            timestamp: None,
            quality: None,
        }])
        .expect("batch");
        sink.deliver(batch);
    }
}
