use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum WindowStatus {
    Active,
    Expired,
    ManuallyExtended,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct ConversationWindow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub conversation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub is_active: bool,
    pub status: WindowStatus,
    pub close_reason: Option<String>,
    /// Optimistic-concurrency token; bumped on every write so C4 and C9 never
    /// lose a concurrent update to the same window row.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationWindow {
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.ends_at
    }

    pub fn hours_remaining(&self, now: DateTime<Utc>) -> f64 {
        self.minutes_remaining(now) / 60.0
    }

    pub fn minutes_remaining(&self, now: DateTime<Utc>) -> f64 {
        let remaining = (self.ends_at - now).num_seconds() as f64 / 60.0;
        remaining.max(0.0)
    }
}

/// Append-only record of an admin override against a window (currently only
/// `extend`). Persisted in the same transaction as the override itself.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct AdminAction {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub conversation_id: Uuid,
    pub action: String,
    pub actor: Option<Uuid>,
    pub reason: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
