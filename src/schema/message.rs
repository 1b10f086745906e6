use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum Direction {
    Inbound,
    Outbound,
}

#[forge::forge_enum]
pub enum SenderType {
    Contact,
    Agent,
    Bot,
    System,
}

#[forge::forge_enum]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Contact,
    Interactive,
    Template,
    Sticker,
}

/// Status only ever advances `pending -> sent -> delivered -> read`, with
/// `failed` as the one terminal alternative at any point in that chain.
#[forge::forge_enum]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// `failed` is terminal from any state; otherwise only forward moves
    /// along pending->sent->delivered->read are legal, and a status already
    /// at or past the target is accepted as a no-op (out-of-order webhooks).
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        if next == MessageStatus::Failed {
            return self != MessageStatus::Failed;
        }
        next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Message {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub conversation_id: Uuid,
    pub direction: Direction,
    pub sender_type: SenderType,
    pub message_type: MessageType,
    /// Polymorphic content, shape keyed by `message_type` (schema-versioned
    /// via an internal `"v"` tag, per the JSONB blob convention shared with
    /// `context_variables`, `canvas_data`, and node `data`).
    pub content: serde_json::Value,
    pub status: MessageStatus,
    pub upstream_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub trace_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
