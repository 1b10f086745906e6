use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[forge::forge_enum]
pub enum ConnectionType {
    Official,
    Qrcode,
}

#[forge::forge_enum]
pub enum QualityRating {
    Green,
    Yellow,
    Red,
    Flagged,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct WhatsAppNumber {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub display_name: String,
    pub connection_type: ConnectionType,
    pub quality_rating: QualityRating,
    pub messaging_limit_tier: String,
    /// Cloud API phone_number_id; null for qrcode numbers.
    pub official_phone_number_id: Option<String>,
    /// Cloud API app secret used for webhook HMAC verification; null for qrcode numbers.
    pub official_app_secret: Option<String>,
    /// Cloud API access token; null for qrcode numbers.
    pub official_access_token: Option<String>,
    /// Evolution/qrcode instance name; null for official numbers.
    pub qrcode_instance_name: Option<String>,
    /// Bearer token compared against inbound qrcode webhook calls; null for official numbers.
    pub qrcode_webhook_token: Option<String>,
    pub default_chatbot_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WhatsAppNumber {
    /// `official` numbers require app secret + access token; `qrcode` numbers require
    /// an instance name. A number with the wrong pair populated cannot be dispatched to.
    pub fn has_required_credentials(&self) -> bool {
        match self.connection_type {
            ConnectionType::Official => {
                self.official_phone_number_id.is_some()
                    && self.official_app_secret.is_some()
                    && self.official_access_token.is_some()
            }
            ConnectionType::Qrcode => self.qrcode_instance_name.is_some(),
        }
    }
}
