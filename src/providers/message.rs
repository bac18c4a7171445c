//! Normalised message model shared by every provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::ProviderKind;

/// Kind tag for a media attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Voice,
    Document,
}

/// Where the attachment's bytes live. Exactly one of the three.
#[derive(Debug, Clone)]
pub enum MediaContent {
    Bytes(Vec<u8>),
    Path(PathBuf),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub content: MediaContent,
    pub mime: Option<String>,
    pub file_name: Option<String>,
    /// Declared size in bytes, when the source exposes one. Used for
    /// pre-flight size checks.
    pub size: Option<u64>,
    pub thumbnail: Option<Vec<u8>>,
}

impl MediaAttachment {
    pub fn new(kind: MediaKind, content: MediaContent) -> Self {
        Self {
            kind,
            content,
            mime: None,
            file_name: None,
            size: None,
            thumbnail: None,
        }
    }

    pub fn is_voice_or_audio(&self) -> bool {
        matches!(self.kind, MediaKind::Voice | MediaKind::Audio)
    }
}

/// Group-chat context attached to an inbound message (WhatsApp-Web only
/// today). `chat_id` is the backend's group address.
#[derive(Debug, Clone)]
pub struct GroupContext {
    pub chat_id: String,
    pub subject: Option<String>,
    /// Whether the operator's own identity appears in the message's mention
    /// list.
    pub mentioned_me: bool,
}

/// An inbound message, normalised across backends.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Backend message id, unique within the provider.
    pub id: String,
    /// Canonical sender identifier.
    pub from: String,
    /// Canonical receiver identifier (the operator's own address).
    pub to: String,
    pub body: String,
    /// Millisecond unix timestamp.
    pub timestamp_ms: i64,
    /// Display name the backend attached to the sender, if any. For group
    /// messages this carries the individual member's identifier.
    pub sender_name: Option<String>,
    pub media: Vec<MediaAttachment>,
    pub provider: ProviderKind,
    pub group: Option<GroupContext>,
    /// Raw backend payload, kept for debugging only.
    pub raw: Option<serde_json::Value>,
}

impl InboundMessage {
    /// Session routing key source: the group chat id for group traffic,
    /// otherwise the sender.
    pub fn session_peer(&self) -> &str {
        match &self.group {
            Some(g) => &g.chat_id,
            None => &self.from,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sent,
    Queued,
    Failed,
}

/// Outcome of a send. Failed sends are values, not errors — callers inspect
/// `status` and log `error`.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub message_id: String,
    pub status: SendStatus,
    pub error: Option<String>,
    /// Provider-specific extras (SID, JID, user id) under stable keys.
    pub metadata: HashMap<String, String>,
}

impl SendResult {
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            status: SendStatus::Sent,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn queued(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            status: SendStatus::Queued,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            status: SendStatus::Failed,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == SendStatus::Failed
    }
}

/// Options for a send: an ordered media list (providers honour at least the
/// first item), an optional message to reply to, and a typing pre-indicator
/// request.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub media: Vec<MediaAttachment>,
    pub reply_to: Option<String>,
    pub typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
    Failed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DeliveryStatus {
    pub state: DeliveryState,
    pub timestamp_ms: i64,
    pub error: Option<String>,
}

impl DeliveryStatus {
    /// The answer for providers without delivery tracking.
    pub fn unknown_now() -> Self {
        Self {
            state: DeliveryState::Unknown,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_result_constructors() {
        let ok = SendResult::sent("SM123").with_meta("sid", "SM123");
        assert_eq!(ok.status, SendStatus::Sent);
        assert_eq!(ok.metadata.get("sid").map(String::as_str), Some("SM123"));
        assert!(!ok.is_failed());

        let bad = SendResult::failed("rate limited");
        assert!(bad.is_failed());
        assert_eq!(bad.error.as_deref(), Some("rate limited"));
        assert!(bad.message_id.is_empty());
    }

    #[test]
    fn test_session_peer_prefers_group_chat() {
        let mut msg = InboundMessage {
            id: "1".into(),
            from: "+15551234567".into(),
            to: "+15550000000".into(),
            body: "hi".into(),
            timestamp_ms: 0,
            sender_name: None,
            media: vec![],
            provider: ProviderKind::WaWeb,
            group: None,
            raw: None,
        };
        assert_eq!(msg.session_peer(), "+15551234567");

        msg.group = Some(GroupContext {
            chat_id: "12345-678@g.us".into(),
            subject: None,
            mentioned_me: true,
        });
        assert_eq!(msg.session_peer(), "12345-678@g.us");
    }

    #[test]
    fn test_voice_or_audio_detection() {
        let voice = MediaAttachment::new(MediaKind::Voice, MediaContent::Bytes(vec![]));
        let doc = MediaAttachment::new(MediaKind::Document, MediaContent::Url("u".into()));
        assert!(voice.is_voice_or_audio());
        assert!(!doc.is_voice_or_audio());
    }

    #[test]
    fn test_delivery_unknown_now_has_timestamp() {
        let st = DeliveryStatus::unknown_now();
        assert_eq!(st.state, DeliveryState::Unknown);
        assert!(st.timestamp_ms > 0);
    }
}
