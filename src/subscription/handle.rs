use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::api::{ApiError, I3xClient};
use crate::model::{SubscriptionId, ValueUpdate};
use crate::subscription::channel::{SseChannel, SubscriptionSync};
use crate::subscription::session::{DeliveryMode, LiveSession, SessionOptions};
use crate::subscription::sink::{ErrorHandler, UpdateSink};

/// Server-side subscription plus a local mirror of its monitored points.
///
/// The mirror only changes after the server accepted a register or
/// unregister call.
#[derive(Clone, Debug)]
pub struct Subscription {
    client: I3xClient,
    id: SubscriptionId,
    created_at: DateTime<Utc>,
    points: BTreeSet<String>,
}

impl Subscription {
    /// Creates a new subscription on the server.
    pub async fn create(client: I3xClient) -> Result<Self, ApiError> {
        let created = client.create_subscription().await?;
        info!(
            event = "subscription_created",
            subscription_id = %created.subscription_id
        );
        Ok(Self::attach(client, created.subscription_id))
    }

    /// Binds to a subscription that already exists, with an empty mirror.
    pub fn attach(client: I3xClient, id: SubscriptionId) -> Self {
        Self {
            client,
            id,
            created_at: Utc::now(),
            points: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Element ids currently registered through this handle.
    pub fn points(&self) -> impl Iterator<Item = &str> {
        self.points.iter().map(String::as_str)
    }

    pub fn client(&self) -> &I3xClient {
        &self.client
    }

    pub async fn register(
        &mut self,
        element_ids: &[impl AsRef<str>],
        max_depth: Option<u32>,
    ) -> Result<Value, ApiError> {
        let response = self
            .client
            .register_monitored_items(&self.id, element_ids, max_depth)
            .await?;
        self.points
            .extend(element_ids.iter().map(|id| id.as_ref().to_string()));
        info!(
            event = "monitored_items_registered",
            subscription_id = %self.id,
            count = element_ids.len(),
            total = self.points.len()
        );
        Ok(response)
    }

    pub async fn unregister(&mut self, element_ids: &[impl AsRef<str>]) -> Result<Value, ApiError> {
        let response = self
            .client
            .unregister_monitored_items(&self.id, element_ids)
            .await?;
        for id in element_ids {
            self.points.remove(id.as_ref());
        }
        info!(
            event = "monitored_items_unregistered",
            subscription_id = %self.id,
            count = element_ids.len(),
            total = self.points.len()
        );
        Ok(response)
    }

    pub async fn sync(&self) -> Result<Vec<ValueUpdate>, ApiError> {
        self.client.sync(&self.id).await
    }

    pub fn stream_url(&self) -> String {
        self.client.stream_url(&self.id)
    }

    /// Deletes the subscription on the server. Stop any session built from
    /// this handle first.
    pub async fn delete(self) -> Result<(), ApiError> {
        self.client.delete_subscription(&self.id).await?;
        info!(event = "subscription_deleted", subscription_id = %self.id);
        Ok(())
    }

    /// Builds an idle session delivering this subscription's values.
    pub fn live_session(
        &self,
        options: SessionOptions,
        sink: impl UpdateSink,
        on_error: impl ErrorHandler,
    ) -> LiveSession {
        match options.mode {
            DeliveryMode::Push => LiveSession::push(
                SseChannel::new(self.client.clone(), self.id.clone()),
                sink,
                on_error,
                options.reconnect,
            ),
            DeliveryMode::Poll => LiveSession::poll(
                SubscriptionSync::new(self.client.clone(), self.id.clone()),
                sink,
                on_error,
                options.poll_interval,
            ),
        }
    }
}
