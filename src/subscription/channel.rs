//! Delivery channels a live session can drive.
//!
//! - [`FrameSource`]: opens the long-lived push channel and yields raw frames.
//! - [`SyncSource`]: performs one explicit poll of current values.
//!
//! The HTTP-backed implementations bind an [`I3xClient`] to one subscription.

use std::collections::VecDeque;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use reqwest::Response;

use crate::api::{ApiError, I3xClient};
use crate::model::{SubscriptionId, ValueUpdate};
use crate::subscription::sse::SseDecoder;

/// Raw frames of one established push channel. The stream ends or yields an
/// error when the channel is lost.
pub type FrameStream = BoxStream<'static, Result<String, ApiError>>;

pub trait FrameSource: Send + Sync + 'static {
    /// Establishes the channel. Resolving `Ok` is the live signal.
    fn open(&self) -> BoxFuture<'static, Result<FrameStream, ApiError>>;
}

pub trait SyncSource: Send + Sync + 'static {
    /// Fetches the current, already normalized, values.
    fn sync(&self) -> BoxFuture<'static, Result<Vec<ValueUpdate>, ApiError>>;
}

/// Server-Sent Events channel of one subscription.
#[derive(Clone)]
pub struct SseChannel {
    client: I3xClient,
    subscription_id: SubscriptionId,
}

impl SseChannel {
    pub fn new(client: I3xClient, subscription_id: SubscriptionId) -> Self {
        Self {
            client,
            subscription_id,
        }
    }
}

impl FrameSource for SseChannel {
    fn open(&self) -> BoxFuture<'static, Result<FrameStream, ApiError>> {
        let client = self.client.clone();
        let subscription_id = self.subscription_id.clone();
        async move {
            let response = client.open_stream(&subscription_id).await?;
            Ok(sse_frames(response))
        }
        .boxed()
    }
}

/// Explicit-sync poller of one subscription.
#[derive(Clone)]
pub struct SubscriptionSync {
    client: I3xClient,
    subscription_id: SubscriptionId,
}

impl SubscriptionSync {
    pub fn new(client: I3xClient, subscription_id: SubscriptionId) -> Self {
        Self {
            client,
            subscription_id,
        }
    }
}

impl SyncSource for SubscriptionSync {
    fn sync(&self) -> BoxFuture<'static, Result<Vec<ValueUpdate>, ApiError>> {
        let client = self.client.clone();
        let subscription_id = self.subscription_id.clone();
        async move { client.sync(&subscription_id).await }.boxed()
    }
}

fn sse_frames(response: Response) -> FrameStream {
    let bytes = response.bytes_stream().boxed();
    let state = (bytes, SseDecoder::new(), VecDeque::<String>::new());

    stream::unfold(state, |(mut bytes, mut decoder, mut ready)| async move {
        loop {
            if let Some(frame) = ready.pop_front() {
                return Some((Ok(frame), (bytes, decoder, ready)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                Some(Err(err)) => return Some((Err(ApiError::Network(err)), (bytes, decoder, ready))),
                None => return None,
            }
        }
    })
    .boxed()
}
