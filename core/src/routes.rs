/// REST and WebSocket paths of the backend contracts
use crate::model::Id;

pub const DIRECTORY_PATH: &str = "/api/conversations/";

/// The collection a live view is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Direct messages of one conversation
    Conversation(Id),
    /// Live Q&A questions of one event
    EventQuestions(Id),
}

impl Channel {
    /// Snapshot (GET) and create (POST) endpoint
    pub fn collection_path(&self) -> String {
        match self {
            Channel::Conversation(id) => format!("/api/conversations/{}/messages/", id),
            Channel::EventQuestions(id) => format!("/api/events/{}/questions/", id),
        }
    }

    /// PATCH/DELETE endpoint of one item
    pub fn item_path(&self, item_id: &Id) -> String {
        match self {
            Channel::Conversation(_) => format!("/api/messages/{}/", item_id),
            Channel::EventQuestions(_) => format!("/api/questions/{}/", item_id),
        }
    }

    /// Upvote endpoint; only questions can be upvoted
    pub fn upvote_path(&self, item_id: &Id) -> Option<String> {
        match self {
            Channel::Conversation(_) => None,
            Channel::EventQuestions(_) => Some(format!("/api/questions/{}/upvote/", item_id)),
        }
    }

    pub fn socket_path(&self) -> String {
        match self {
            Channel::Conversation(id) => format!("/ws/chat/{}/", id),
            Channel::EventQuestions(id) => format!("/ws/events/{}/questions/", id),
        }
    }

    /// Body field the create/edit endpoints expect
    pub fn content_field(&self) -> &'static str {
        match self {
            Channel::Conversation(_) => "content",
            Channel::EventQuestions(_) => "body",
        }
    }

    /// Conversation id whose read watermark this view maintains
    pub fn watermark_id(&self) -> Option<String> {
        match self {
            Channel::Conversation(id) => Some(id.to_string()),
            Channel::EventQuestions(_) => None,
        }
    }
}

/// Full socket URL: base + path + urlencoded token
pub fn socket_url(ws_base: &str, channel: &Channel, token: &str) -> String {
    format!(
        "{}{}?token={}",
        ws_base.trim_end_matches('/'),
        channel.socket_path(),
        urlencoding::encode(token)
    )
}
