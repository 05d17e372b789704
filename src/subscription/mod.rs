//! Subscription lifecycle and live value delivery.
//!
//! - `handle`: server-side subscription plus its monitored points.
//! - `session`: push/poll state machine with reconnection.
//! - `channel`: delivery channels a session drives.
//! - `sink`: consumer callbacks.
//! - `sse`: event-stream framing.

/// Delivery channel traits and their HTTP implementations.
pub mod channel;
/// Subscription handle.
pub mod handle;
/// Live session state machine.
pub mod session;
/// Batch and error callbacks.
pub mod sink;
/// Server-Sent Events decoder.
pub mod sse;

pub use channel::{FrameSource, FrameStream, SseChannel, SubscriptionSync, SyncSource};
pub use handle::Subscription;
pub use session::{
    DeliveryMode, LiveSession, SessionDefaults, SessionError, SessionOptions, SessionState,
};
pub use sink::{channel_sink, ChannelSink, ErrorHandler, UpdateSink};
