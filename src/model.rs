use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub uri: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectType {
    pub element_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub namespace_uri: String,
    #[serde(default)]
    pub schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipType {
    pub element_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub namespace_uri: String,
    #[serde(default)]
    pub reverse_of: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInstance {
    pub element_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub type_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_composition: bool,
    #[serde(default)]
    pub namespace_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Map<String, Value>>,
}

/// Latest known value of one element, as delivered to consumers.
///
/// Built fresh for every response or frame and never mutated afterwards; a
/// later update for the same element supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueUpdate {
    pub element_id: String,
    pub value: Value,
    pub timestamp: Option<String>,
    pub quality: Option<String>,
}

impl ValueUpdate {
    pub fn is_empty(&self) -> bool {
        self.element_id.trim().is_empty()
    }
}

/// Ordered, non-empty group of updates that arrived together.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryBatch(Vec<ValueUpdate>);

impl DeliveryBatch {
    /// Returns `None` for an empty list.
    pub fn new(updates: Vec<ValueUpdate>) -> Option<Self> {
        (!updates.is_empty()).then_some(Self(updates))
    }

    pub fn updates(&self) -> &[ValueUpdate] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ValueUpdate> {
        self.0.iter()
    }

    pub fn into_updates(self) -> Vec<ValueUpdate> {
        self.0
    }
}

impl IntoIterator for DeliveryBatch {
    type Item = ValueUpdate;
    type IntoIter = std::vec::IntoIter<ValueUpdate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalValue {
    pub element_id: String,
    pub value: Value,
    pub timestamp: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_composition: bool,
    #[serde(default)]
    pub namespace_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl HistoricalValue {
    /// Placeholder used when the server reports nothing for `element_id`.
    pub fn empty(element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            value: Value::Array(Vec::new()),
            timestamp: now_rfc3339(),
            parent_id: None,
            is_composition: false,
            namespace_uri: String::new(),
            data_type: None,
        }
    }
}

/// Server-assigned subscription identifier.
///
/// Creation responses carry it as a string while listings carry a number;
/// both decode to the same textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubscriptionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for SubscriptionId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl Serialize for SubscriptionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SubscriptionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(u64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Number(number) => Self(number.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub subscription_id: SubscriptionId,
    #[serde(default)]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetSubscriptionsResponse {
    #[serde(default)]
    pub subscription_ids: Vec<SubscriptionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionResponse {
    pub subscription_id: SubscriptionId,
    #[serde(default)]
    pub message: Option<String>,
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    fn update(id: &str) -> ValueUpdate {
        ValueUpdate {
            element_id: id.to_string(),
            value: json!(1),
            timestamp: None,
            quality: None,
        }
    }

    #[test]
    fn delivery_batch_rejects_empty_list() {
        assert!(DeliveryBatch::new(Vec::new()).is_none());

        let batch = DeliveryBatch::new(vec![update("a"), update("b")]).expect("non-empty");
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        let ids: Vec<_> = batch.iter().map(|u| u.element_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn blank_element_id_counts_as_empty_update() {
        assert!(update("  ").is_empty());
        assert!(!update("pump-1").is_empty());
    }

    #[test]
    fn subscription_id_accepts_string_and_number() {
        let created: CreateSubscriptionResponse =
            serde_json::from_value(json!({"subscriptionId": "12", "message": "ok"}))
                .expect("decode create response");
        assert_eq!(created.subscription_id.as_str(), "12");

        let listed: GetSubscriptionsResponse = serde_json::from_value(json!({
            "subscriptionIds": [{"subscriptionId": 12, "created": "2025-01-01T00:00:00Z"}]
        }))
        .expect("decode listing");
        assert_eq!(listed.subscription_ids[0].subscription_id, created.subscription_id);
    }

    #[test]
    fn empty_history_uses_defaults() {
        let history = HistoricalValue::empty("boiler");
        assert_eq!(history.element_id, "boiler");
        assert_eq!(history.value, json!([]));
        assert_eq!(history.parent_id, None);
        assert_eq!(history.namespace_uri, "");
        assert!(!history.is_composition);
        assert!(DateTime::parse_from_rfc3339(&history.timestamp).is_ok());
    }

    #[test]
    fn object_instance_tolerates_minimal_payload() {
        let object: ObjectInstance = serde_json::from_value(json!({
            "elementId": "line-1",
            "displayName": "Line 1",
            "typeId": "LineType",
            "parentId": null,
            "isComposition": true,
            "namespaceUri": "urn:plant"
        }))
        .expect("decode object");
        assert_eq!(object.element_id, "line-1");
        assert!(object.is_composition);
        assert!(object.relationships.is_none());
    }
}
