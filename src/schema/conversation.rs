use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum ConversationStatus {
    Open,
    Queued,
    Active,
    Closed,
    Archived,
}

/// Where the flow engine's cursor sits. Mirrors the per-conversation state
/// machine: `running` while the interpreter advances nodes on its own,
/// `awaiting_user` once it blocks on a question/interactive node,
/// `handed_off` once a human owns it, `closed` once the flow has ended.
#[forge::forge_enum]
pub enum FlowCursorState {
    Running,
    AwaitingUser,
    HandedOff,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Conversation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub whatsapp_number_id: Uuid,
    pub status: ConversationStatus,
    pub is_bot_active: bool,
    pub active_chatbot_id: Option<Uuid>,
    pub active_flow_id: Option<Uuid>,
    pub current_node_id: Option<Uuid>,
    pub flow_cursor_state: FlowCursorState,
    pub last_user_message_at: Option<DateTime<Utc>>,
    pub window_expires_at: Option<DateTime<Utc>>,
    pub current_agent_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub queue_id: Option<Uuid>,
    pub context_variables: serde_json::Value,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn context_variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.context_variables.get(name)
    }
}
