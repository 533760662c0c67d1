/// Shared wire types: items, ids, conversation summaries
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Server-assigned identifier: backends hand out integers or strings.
/// Integral text is stored as `Int`, so `"3"` and `3` are the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged, from = "RawId")]
pub enum Id {
    Int(i64),
    Text(String),
}

/// Id as it appears on the wire, before canonicalization
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Text(String),
}

impl From<RawId> for Id {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Int(n) => Id::Int(n),
            RawId::Text(s) => Id::parse(&s),
        }
    }
}

impl Id {
    /// Integer value, parsing numeric strings
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Id::Int(n) => Some(*n),
            Id::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Ascending id order used as the tie-break and as the fallback when
    /// timestamps do not parse.
    pub fn compare(&self, other: &Id) -> Ordering {
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.to_string().cmp(&other.to_string()),
        }
    }

    /// Parse a command-line id: integral text becomes `Int`
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<i64>() {
            Ok(n) => Id::Int(n),
            Err(_) => Id::Text(s.trim().to_string()),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Int(n) => write!(f, "{}", n),
            Id::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Int(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::parse(s)
    }
}

/// Sender as either a bare id or an embedded user object with an `id`
fn sender_from_value(value: &Value) -> Option<Id> {
    let id = match value {
        Value::Object(user) => user.get("id")?,
        other => other,
    };
    Id::deserialize(id).ok()
}

fn sender_ref<'de, D>(deserializer: D) -> Result<Option<Id>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(sender_from_value))
}

/// Parse a wire timestamp. Accepts RFC 3339 and naive ISO-8601 (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// A message in a conversation or a question in an event's Q&A
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Id,

    #[serde(default, alias = "body", alias = "text")]
    pub content: String,

    #[serde(
        rename = "senderId",
        alias = "sender_id",
        alias = "sender",
        default,
        deserialize_with = "sender_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<Id>,

    /// Raw wire timestamp; kept as text so malformed values can fall back to id order
    #[serde(
        rename = "createdAt",
        alias = "created_at",
        alias = "timestamp",
        default
    )]
    pub created_at: String,

    /// Kind-specific fields (upvoteCount, upvoters, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }

    pub fn upvote_count(&self) -> Option<u64> {
        self.extra
            .get("upvoteCount")
            .or_else(|| self.extra.get("upvote_count"))
            .and_then(Value::as_u64)
    }

    /// Overwrite fields from a point-update payload. The id never changes.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            match key.as_str() {
                "id" => {}
                "content" | "body" | "text" => {
                    if let Some(s) = value.as_str() {
                        self.content = s.to_string();
                    }
                }
                "createdAt" | "created_at" | "timestamp" => {
                    if let Some(s) = value.as_str() {
                        self.created_at = s.to_string();
                    }
                }
                "senderId" | "sender_id" | "sender" => {
                    self.sender_id = sender_from_value(value);
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// The other side of a direct conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Id,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Latest-item metadata carried by a conversation summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    #[serde(default, alias = "createdAt", alias = "created_at")]
    pub timestamp: String,
    #[serde(
        rename = "senderId",
        alias = "sender_id",
        alias = "sender",
        default,
        deserialize_with = "sender_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<Id>,
}

/// One row of the member directory (conversation list)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Id,
    #[serde(
        rename = "otherParticipant",
        alias = "other_participant",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub other_participant: Option<Participant>,
    #[serde(
        rename = "lastMessage",
        alias = "last_message",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message: Option<LastMessage>,
}

/// The signed-in user as persisted in local state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_wire_aliases() {
        let camel: Item = serde_json::from_value(json!({
            "id": 7,
            "content": "hi",
            "senderId": 3,
            "createdAt": "2024-05-01T10:00:00Z",
            "upvoteCount": 2
        }))
        .unwrap();
        let snake: Item = serde_json::from_value(json!({
            "id": 7,
            "body": "hi",
            "sender_id": 3,
            "created_at": "2024-05-01T10:00:00Z",
            "upvoteCount": 2
        }))
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.upvote_count(), Some(2));
        assert!(camel.timestamp().is_some());

        let out = serde_json::to_value(&camel).unwrap();
        assert_eq!(out["createdAt"], "2024-05-01T10:00:00Z");
        assert_eq!(out["senderId"], 3);
        assert_eq!(out["upvoteCount"], 2);
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("2024-05-01T10:00:00+02:00").is_some());
        assert!(parse_timestamp("2024-05-01T10:00:00.123456").is_some());
        assert!(parse_timestamp("2024-05-01 10:00:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_id_compare() {
        assert_eq!(Id::Int(2).compare(&Id::Int(10)), Ordering::Less);
        assert_eq!(Id::from("2").compare(&Id::Int(10)), Ordering::Less);
        assert_eq!(Id::from("b").compare(&Id::from("a")), Ordering::Greater);
        assert_eq!(Id::parse("42"), Id::Int(42));
        assert_eq!(Id::parse("abc"), Id::from("abc"));
    }

    #[test]
    fn test_embedded_sender_object() {
        let item: Item = serde_json::from_value(json!({
            "id": 8,
            "content": "yo",
            "sender": {"id": 2, "username": "bob"},
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(item.sender_id, Some(Id::Int(2)));

        let bare: Item = serde_json::from_value(json!({"id": 9, "sender": "2"})).unwrap();
        assert_eq!(bare.sender_id, Some(Id::Int(2)));

        let last: LastMessage = serde_json::from_value(json!({
            "timestamp": "2024-05-01T10:00:00Z",
            "sender": {"id": "u-4"}
        }))
        .unwrap();
        assert_eq!(last.sender_id, Some(Id::from("u-4")));

        let mut patched = bare.clone();
        let patch = json!({"sender": {"id": 5}});
        patched.apply_patch(patch.as_object().unwrap());
        assert_eq!(patched.sender_id, Some(Id::Int(5)));
    }

    #[test]
    fn test_numeric_text_id_is_canonical() {
        let text: Id = serde_json::from_value(json!("3")).unwrap();
        let int: Id = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(text, int);

        let mut seen = std::collections::HashSet::new();
        seen.insert(int);
        assert!(seen.contains(&text));

        let slug: Id = serde_json::from_value(json!("q-1")).unwrap();
        assert_eq!(slug, Id::Text("q-1".to_string()));
    }

    #[test]
    fn test_apply_patch_keeps_id() {
        let mut item: Item = serde_json::from_value(json!({
            "id": 5, "content": "old", "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        let patch = json!({"id": 99, "body": "new", "upvoteCount": 4});
        item.apply_patch(patch.as_object().unwrap());
        assert_eq!(item.id, Id::Int(5));
        assert_eq!(item.content, "new");
        assert_eq!(item.upvote_count(), Some(4));
    }
}
