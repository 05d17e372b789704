//! Client SDK for i3x industrial information servers.
//!
//! The crate is organized by concern:
//! - `api`: request/response client for browsing and reading values.
//! - `normalize`: folds the server's response dialects into canonical records.
//! - `subscription`: subscriptions and live push/poll value delivery.
//! - `model`: canonical records shared by the above.
//! - `retry`: reconnect backoff policy.

/// HTTP client and request/response types.
pub mod api;
/// Canonical records.
pub mod model;
/// Response dialect normalization.
pub mod normalize;
/// Reconnect backoff policy.
pub mod retry;
/// Subscriptions and live sessions.
pub mod subscription;

pub use api::{ApiError, I3xClient, I3xClientOptions};
pub use model::{DeliveryBatch, HistoricalValue, SubscriptionId, ValueUpdate};
pub use retry::ReconnectPolicy;
pub use subscription::{LiveSession, SessionError, SessionOptions, SessionState, Subscription};
