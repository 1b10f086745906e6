use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum PlanTier {
    Free,
    Starter,
    Business,
    Enterprise,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub plan_tier: PlanTier,
    pub max_concurrent_conversations_per_agent: i32,
    pub monthly_message_limit: i32,
    pub global_variables: serde_json::Value,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
