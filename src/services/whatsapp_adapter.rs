use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::schema::{ConnectionType, MessageType, WhatsAppNumber};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct TemplateComponent {
    pub kind: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage<'a> {
    pub to: &'a str,
    pub message_type: MessageType,
    pub text: Option<&'a str>,
    pub media_url: Option<&'a str>,
    pub template_name: Option<&'a str>,
    pub template_language: Option<&'a str>,
    pub template_components: Vec<TemplateComponent>,
}

/// The one send/receive contract both upstreams are abstracted behind.
/// Grounded in `AiService`'s narrow-capability shape; the two upstreams
/// (`OfficialCloudApiAdapter`, `QrCodeAdapter`) differ entirely in wire
/// format but expose the same surface to C7/C8.
#[async_trait::async_trait]
pub trait WhatsAppAdapter: Send + Sync {
    async fn send(&self, number_id: &str, message: OutboundMessage<'_>) -> anyhow::Result<String>;
}

pub fn connection_type_for(adapter_kind: &str) -> Option<ConnectionType> {
    match adapter_kind {
        "official" => Some(ConnectionType::Official),
        "qrcode" => Some(ConnectionType::Qrcode),
        _ => None,
    }
}

/// `X-Hub-Signature-256: sha256=<hex>` verification, constant-time compare.
pub fn verify_official_signature(app_secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time bearer-token comparison for the qrcode channel's webhook.
pub fn verify_qrcode_token(configured: &str, presented: &str) -> bool {
    if configured.len() != presented.len() {
        return false;
    }
    configured
        .as_bytes()
        .iter()
        .zip(presented.as_bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OfficialCloudApiAdapter {
    client: reqwest::Client,
    phone_number_id: String,
    access_token: String,
}

impl OfficialCloudApiAdapter {
    pub fn new(phone_number_id: String, access_token: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            phone_number_id,
            access_token,
        })
    }

    fn payload(message: &OutboundMessage<'_>) -> serde_json::Value {
        let mut body = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": message.to,
        });

        match message.message_type {
            MessageType::Template => {
                body["type"] = serde_json::json!("template");
                body["template"] = serde_json::json!({
                    "name": message.template_name,
                    "language": { "code": message.template_language.unwrap_or("en_US") },
                    "components": message.template_components.iter().map(|c| {
                        serde_json::json!({ "type": c.kind, "parameters": c.parameters })
                    }).collect::<Vec<_>>(),
                });
            }
            MessageType::Image | MessageType::Video | MessageType::Audio | MessageType::Document => {
                let kind = match message.message_type {
                    MessageType::Image => "image",
                    MessageType::Video => "video",
                    MessageType::Audio => "audio",
                    _ => "document",
                };
                body["type"] = serde_json::json!(kind);
                body[kind] = serde_json::json!({ "link": message.media_url, "caption": message.text });
            }
            _ => {
                body["type"] = serde_json::json!("text");
                body["text"] = serde_json::json!({ "body": message.text.unwrap_or_default() });
            }
        }

        body
    }
}

#[async_trait::async_trait]
impl WhatsAppAdapter for OfficialCloudApiAdapter {
    async fn send(&self, _number_id: &str, message: OutboundMessage<'_>) -> anyhow::Result<String> {
        let url = format!("{GRAPH_API_BASE}/{}/messages", self.phone_number_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&Self::payload(&message))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();

        if !status.is_success() {
            anyhow::bail!("cloud api send failed ({status}): {body}");
        }

        body["messages"][0]["id"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("cloud api response missing message id: {body}"))
    }
}

/// Wraps an embedded `whatsapp-rust` client, the same surface `gateway.rs`
/// and `delivery.rs` shared through `WA_CLIENT`, behind the capability trait.
pub struct QrCodeAdapter {
    client: Arc<whatsapp_rust::Client>,
}

impl QrCodeAdapter {
    pub fn new(client: Arc<whatsapp_rust::Client>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl WhatsAppAdapter for QrCodeAdapter {
    async fn send(&self, _number_id: &str, message: OutboundMessage<'_>) -> anyhow::Result<String> {
        let jid: whatsapp_rust::Jid = message
            .to
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid jid {}: {e}", message.to))?;

        let wa_message = waproto::whatsapp::Message {
            conversation: message.text.map(ToString::to_string),
            ..Default::default()
        };

        self.client
            .send_message(jid, wa_message)
            .await
            .map_err(|e| anyhow::anyhow!("qrcode send failed: {e}"))
    }
}

/// Picks the right adapter for a number's `connection_type`. Official numbers
/// are stateless (a fresh `reqwest::Client` per resolve is cheap); qrcode
/// numbers need a live, already-paired `whatsapp-rust` connection, which is
/// provisioned by out-of-scope infra and only looked up here.
#[async_trait::async_trait]
pub trait AdapterResolver: Send + Sync {
    async fn resolve(&self, number: &WhatsAppNumber) -> anyhow::Result<Arc<dyn WhatsAppAdapter>>;
}

#[derive(Default)]
pub struct DefaultAdapterResolver {
    qrcode_clients: RwLock<HashMap<Uuid, Arc<whatsapp_rust::Client>>>,
}

impl DefaultAdapterResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_qrcode_client(&self, number_id: Uuid, client: Arc<whatsapp_rust::Client>) {
        self.qrcode_clients.write().await.insert(number_id, client);
    }
}

#[async_trait::async_trait]
impl AdapterResolver for DefaultAdapterResolver {
    async fn resolve(&self, number: &WhatsAppNumber) -> anyhow::Result<Arc<dyn WhatsAppAdapter>> {
        match number.connection_type {
            ConnectionType::Official => {
                let phone_number_id = number
                    .official_phone_number_id
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("number {} missing official_phone_number_id", number.id))?;
                let access_token = number
                    .official_access_token
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("number {} missing official_access_token", number.id))?;
                Ok(Arc::new(OfficialCloudApiAdapter::new(phone_number_id, access_token)?))
            }
            ConnectionType::Qrcode => {
                let clients = self.qrcode_clients.read().await;
                let client = clients
                    .get(&number.id)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("no paired qrcode client for number {}", number.id))?;
                Ok(Arc::new(QrCodeAdapter::new(client)))
            }
        }
    }
}
