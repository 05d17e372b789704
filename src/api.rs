use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::model::{
    CreateSubscriptionResponse, GetSubscriptionsResponse, HistoricalValue, Namespace,
    ObjectInstance, ObjectType, RelationshipType, SubscriptionId, ValueUpdate,
};
use crate::normalize::{self, NormalizeError};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const DEFAULT_SERVER_URL: &str = "https://i3x.cesmii.net";
pub const LOCAL_SERVER_URL: &str = "http://localhost:8080";
/// Depth used by value and history queries unless the caller asks otherwise.
pub const DEFAULT_MAX_DEPTH: u32 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct I3xClientDefaults;

impl I3xClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct I3xClientOptions {
    pub connect_timeout: Duration,
    /// Applies to one-shot calls only; the stream request is unbounded.
    pub request_timeout: Duration,
}

impl Default for I3xClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: I3xClientDefaults::CONNECT_TIMEOUT,
            request_timeout: I3xClientDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// Thin request/response client for an i3x server.
///
/// Every call is a single attempt: non-success statuses surface as
/// [`ApiError::Transport`] and unreachable servers as [`ApiError::Network`].
#[derive(Clone, Debug)]
pub struct I3xClient {
    http: Client,
    base_url: Url,
    api_key: Option<SecretString>,
    request_timeout: Duration,
}

impl I3xClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_options(base_url, None, I3xClientOptions::default())
    }

    pub fn with_api_key(base_url: &str, api_key: SecretString) -> Result<Self, ApiError> {
        Self::with_options(base_url, Some(api_key), I3xClientOptions::default())
    }

    pub fn with_options(
        base_url: &str,
        api_key: Option<SecretString>,
        options: I3xClientOptions,
    ) -> Result<Self, ApiError> {
        let base_url = parse_base_url(base_url)?;
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Network)?;

        Ok(Self {
            http,
            base_url,
            api_key,
            request_timeout: options.request_timeout,
        })
    }

    /// Base address without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    pub async fn get_namespaces(&self) -> Result<Vec<Namespace>, ApiError> {
        self.get_json(&["namespaces"], &[]).await
    }

    pub async fn get_object_types(
        &self,
        namespace_uri: Option<&str>,
    ) -> Result<Vec<ObjectType>, ApiError> {
        let query = namespace_query(namespace_uri);
        self.get_json(&["objecttypes"], &query).await
    }

    pub async fn get_object_type(&self, element_id: &str) -> Result<ObjectType, ApiError> {
        self.get_json(&["objecttypes", element_id], &[]).await
    }

    pub async fn get_relationship_types(
        &self,
        namespace_uri: Option<&str>,
    ) -> Result<Vec<RelationshipType>, ApiError> {
        let query = namespace_query(namespace_uri);
        self.get_json(&["relationshiptypes"], &query).await
    }

    pub async fn get_objects(
        &self,
        type_id: Option<&str>,
        include_metadata: bool,
    ) -> Result<Vec<ObjectInstance>, ApiError> {
        let mut query = Vec::new();
        if let Some(type_id) = type_id {
            query.push(("typeId", type_id.to_string()));
        }
        query.push(("includeMetadata", include_metadata.to_string()));
        self.get_json(&["objects"], &query).await
    }

    pub async fn get_object(
        &self,
        element_id: &str,
        include_metadata: bool,
    ) -> Result<ObjectInstance, ApiError> {
        let query = [("includeMetadata", include_metadata.to_string())];
        self.get_json(&["objects", element_id], &query).await
    }

    pub async fn get_related_objects(
        &self,
        element_id: &str,
        relationship_type: Option<&str>,
        include_metadata: bool,
    ) -> Result<Vec<ObjectInstance>, ApiError> {
        let request = RelatedObjectsRequest {
            element_ids: vec![element_id.to_string()],
            relationship_type: relationship_type.map(str::to_owned),
            include_metadata,
        };
        let payload: Value = self.post_json(&["objects", "related"], &request).await?;
        Ok(normalize::normalize_related(payload, element_id)?)
    }

    /// Current value of one element, or `None` when the server has none.
    pub async fn get_value(
        &self,
        element_id: &str,
        max_depth: u32,
    ) -> Result<Option<ValueUpdate>, ApiError> {
        let mut values = self.get_values(&[element_id], max_depth).await?;
        Ok((!values.is_empty()).then(|| values.swap_remove(0)))
    }

    pub async fn get_values(
        &self,
        element_ids: &[impl AsRef<str>],
        max_depth: u32,
    ) -> Result<Vec<ValueUpdate>, ApiError> {
        let request = ValueRequest {
            element_ids: owned_ids(element_ids),
            max_depth,
        };
        let payload: Value = self.post_json(&["objects", "value"], &request).await?;
        Ok(normalize::normalize_values(payload, &request.element_ids)?)
    }

    /// History of one element. Elements the server knows nothing about yield
    /// an empty record rather than an error.
    pub async fn get_history(
        &self,
        element_id: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        max_depth: u32,
    ) -> Result<HistoricalValue, ApiError> {
        let history = self
            .get_histories(&[element_id], start_time, end_time, max_depth)
            .await?;
        Ok(history
            .into_iter()
            .next()
            .unwrap_or_else(|| HistoricalValue::empty(element_id)))
    }

    pub async fn get_histories(
        &self,
        element_ids: &[impl AsRef<str>],
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        max_depth: u32,
    ) -> Result<Vec<HistoricalValue>, ApiError> {
        let request = HistoryRequest {
            element_ids: owned_ids(element_ids),
            start_time,
            end_time,
            max_depth,
        };
        let payload: Value = self.post_json(&["objects", "history"], &request).await?;
        Ok(normalize::normalize_history(payload, &request.element_ids)?)
    }

    pub async fn get_subscriptions(&self) -> Result<GetSubscriptionsResponse, ApiError> {
        self.get_json(&["subscriptions"], &[]).await
    }

    pub async fn create_subscription(&self) -> Result<CreateSubscriptionResponse, ApiError> {
        self.post_json(&["subscriptions"], &json!({})).await
    }

    pub async fn delete_subscription(&self, subscription_id: &SubscriptionId) -> Result<(), ApiError> {
        let url = self.endpoint(&["subscriptions", subscription_id.as_str()])?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    pub async fn register_monitored_items(
        &self,
        subscription_id: &SubscriptionId,
        element_ids: &[impl AsRef<str>],
        max_depth: Option<u32>,
    ) -> Result<Value, ApiError> {
        let request = MonitoredItemsRequest {
            element_ids: owned_ids(element_ids),
            max_depth,
        };
        self.post_json(&["subscriptions", subscription_id.as_str(), "register"], &request)
            .await
    }

    pub async fn unregister_monitored_items(
        &self,
        subscription_id: &SubscriptionId,
        element_ids: &[impl AsRef<str>],
    ) -> Result<Value, ApiError> {
        let request = MonitoredItemsRequest {
            element_ids: owned_ids(element_ids),
            max_depth: None,
        };
        self.post_json(&["subscriptions", subscription_id.as_str(), "unregister"], &request)
            .await
    }

    /// Explicitly polls the current values of a subscription's points.
    pub async fn sync(&self, subscription_id: &SubscriptionId) -> Result<Vec<ValueUpdate>, ApiError> {
        let url = self.endpoint(&["subscriptions", subscription_id.as_str(), "sync"])?;
        let body = self.send(self.request(Method::POST, url)).await?;
        let payload = parse_json_body::<Value>(&body)?;
        Ok(normalize::normalize_values(payload, &[])?)
    }

    pub fn stream_url(&self, subscription_id: &SubscriptionId) -> String {
        format!(
            "{}/subscriptions/{}/stream",
            self.base_url(),
            subscription_id
        )
    }

    /// Opens the long-lived event stream of a subscription.
    ///
    /// The returned response has passed the status check; its body is the
    /// raw event stream.
    pub async fn open_stream(&self, subscription_id: &SubscriptionId) -> Result<Response, ApiError> {
        let url = self.endpoint(&["subscriptions", subscription_id.as_str(), "stream"])?;
        let mut builder = self
            .http
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = builder.send().await.map_err(ApiError::Network)?;
        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(error) => {
                    debug!(event = "error_body_unreadable", status = %status, error = %error);
                    String::new()
                }
            };
            return Err(ApiError::Transport { status, body });
        }
        Ok(response)
    }

    pub async fn test_connection(&self) -> bool {
        match self.get_namespaces().await {
            Ok(_) => true,
            Err(error) => {
                debug!(event = "connection_test_failed", error = %error);
                false
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.endpoint(segments)?;
        let mut builder = self.request(Method::GET, url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        let body = self.send(builder).await?;
        parse_json_body(&body)
    }

    async fn post_json<B, T>(&self, segments: &[&str], request: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(segments)?;
        let body = self
            .send(self.request(Method::POST, url).json(request))
            .await?;
        parse_json_body(&body)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .timeout(self.request_timeout)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<String, ApiError> {
        let response = builder.send().await.map_err(ApiError::Network)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Network)?;

        if !status.is_success() {
            return Err(ApiError::Transport { status, body });
        }

        Ok(body)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueRequest {
    pub element_ids: Vec<String>,
    pub max_depth: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub element_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub max_depth: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelatedObjectsRequest {
    pub element_ids: Vec<String>,
    #[serde(rename = "relationshiptype", skip_serializing_if = "Option::is_none")]
    pub relationship_type: Option<String>,
    pub include_metadata: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredItemsRequest {
    pub element_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// No response reached the client.
    #[error("network error: {0}")]
    Network(reqwest::Error),

    /// The server answered with a non-success status.
    #[error("http status {status}: {body}")]
    Transport { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short human-readable form of a transport error body.
    pub fn summary(&self) -> Option<String> {
        match self {
            Self::Transport { body, .. } => Some(summarize_error_body(body)),
            _ => None,
        }
    }
}

fn parse_base_url(base_url: &str) -> Result<Url, ApiError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|err| ApiError::InvalidBaseUrl(format!("{trimmed}: {err}")))?;
    if url.cannot_be_a_base() {
        return Err(ApiError::InvalidBaseUrl(trimmed.to_string()));
    }
    Ok(url)
}

fn parse_json_body<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    // DELETE and register endpoints may answer with an empty body.
    if body.trim().is_empty() {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_str(body)?)
}

fn namespace_query(namespace_uri: Option<&str>) -> Vec<(&'static str, String)> {
    namespace_uri
        .map(|uri| vec![("namespaceUri", uri.to_string())])
        .unwrap_or_default()
}

fn owned_ids(element_ids: &[impl AsRef<str>]) -> Vec<String> {
    element_ids
        .iter()
        .map(|id| id.as_ref().to_string())
        .collect()
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.detail.or(parsed.error).or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
