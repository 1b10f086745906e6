use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreError;
use crate::functions::{flow_engine, window_engine};
use crate::schema::{CanvasData, ConnectionType, FlowCursorState, MessageType, NodeType};
use crate::services::{verify_official_signature, verify_qrcode_token, AiPromptClient, EphemeralStore, RateLimiter};

type CoreResult<T> = std::result::Result<T, CoreError>;

/// Dedup window for upstream message ids; matches the platform's own
/// at-least-once redelivery guarantee for webhook callbacks.
pub const DEDUP_TTL: Duration = Duration::from_secs(24 * 3600);

/// A normalized inbound customer message, already stripped of whichever
/// upstream's wire shape produced it.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub organization_id: Uuid,
    pub whatsapp_number_id: Uuid,
    pub upstream_message_id: String,
    pub sender_whatsapp_id: String,
    pub message_type: MessageType,
    pub text: Option<String>,
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Duplicate,
    Processed {
        conversation_id: Uuid,
        flow_messages_queued: usize,
    },
}

struct NumberAuth {
    #[allow(dead_code)]
    connection_type: ConnectionType,
    official_app_secret: Option<String>,
    qrcode_webhook_token: Option<String>,
}

async fn fetch_number_auth(db: &PgPool, number_id: Uuid) -> CoreResult<NumberAuth> {
    sqlx::query_as!(
        NumberAuth,
        r#"
        SELECT connection_type as "connection_type: ConnectionType", official_app_secret, qrcode_webhook_token
        FROM whatsapp_numbers
        WHERE id = $1
        "#,
        number_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("whatsapp_number {number_id}")))
}

/// Step 1 (official channel): `X-Hub-Signature-256` over the raw request body.
pub async fn verify_official_webhook(
    db: &PgPool,
    number_id: Uuid,
    body: &[u8],
    signature_header: &str,
) -> CoreResult<bool> {
    let auth = fetch_number_auth(db, number_id).await?;
    let Some(app_secret) = auth.official_app_secret else {
        return Ok(false);
    };
    Ok(verify_official_signature(&app_secret, body, signature_header))
}

/// Step 1 (qrcode channel): bearer token configured per-number at pairing time.
pub async fn verify_qrcode_webhook(db: &PgPool, number_id: Uuid, presented_token: &str) -> CoreResult<bool> {
    let auth = fetch_number_auth(db, number_id).await?;
    let Some(configured) = auth.qrcode_webhook_token else {
        return Ok(false);
    };
    Ok(verify_qrcode_token(&configured, presented_token))
}

/// Navigates the Cloud API webhook's `entry[0].changes[0].value.messages[0]`
/// shape. Returns `None` for callbacks that carry no customer message
/// (delivery receipts, template status updates) — those aren't this
/// pipeline's concern.
pub fn parse_official_webhook_payload(
    organization_id: Uuid,
    whatsapp_number_id: Uuid,
    body: &serde_json::Value,
) -> Option<InboundEvent> {
    let message = body
        .get("entry")?
        .get(0)?
        .get("changes")?
        .get(0)?
        .get("value")?
        .get("messages")?
        .get(0)?;

    let upstream_message_id = message.get("id")?.as_str()?.to_string();
    let sender_whatsapp_id = message.get("from")?.as_str()?.to_string();
    let kind = message.get("type").and_then(|v| v.as_str()).unwrap_or("text");

    let (message_type, text, media_url) = match kind {
        "text" => (
            MessageType::Text,
            message.get("text").and_then(|t| t.get("body")).and_then(|v| v.as_str()).map(String::from),
            None,
        ),
        "image" | "video" | "audio" | "document" | "sticker" => {
            let mt = match kind {
                "image" => MessageType::Image,
                "video" => MessageType::Video,
                "audio" => MessageType::Audio,
                "document" => MessageType::Document,
                _ => MessageType::Sticker,
            };
            let media_url = message.get(kind).and_then(|m| m.get("id")).and_then(|v| v.as_str()).map(String::from);
            (mt, None, media_url)
        }
        "interactive" => {
            let interactive = message.get("interactive");
            let reply = interactive.and_then(|i| i.get("button_reply").or_else(|| i.get("list_reply")));
            let text = reply.and_then(|r| r.get("title")).and_then(|v| v.as_str()).map(String::from);
            (MessageType::Interactive, text, None)
        }
        "location" => (MessageType::Location, None, None),
        _ => (MessageType::Text, None, None),
    };

    Some(InboundEvent {
        organization_id,
        whatsapp_number_id,
        upstream_message_id,
        sender_whatsapp_id,
        message_type,
        text,
        media_url,
    })
}

/// Navigates the qrcode channel's Evolution-style `{ data: { key, message } }`
/// webhook shape.
pub fn parse_qrcode_webhook_payload(
    organization_id: Uuid,
    whatsapp_number_id: Uuid,
    body: &serde_json::Value,
) -> Option<InboundEvent> {
    let data = body.get("data")?;
    let key = data.get("key")?;
    let upstream_message_id = key.get("id")?.as_str()?.to_string();
    let remote_jid = key.get("remoteJid")?.as_str()?.to_string();
    let sender_whatsapp_id = remote_jid.split('@').next().unwrap_or(&remote_jid).to_string();
    let text = data.get("message").and_then(|m| m.get("conversation")).and_then(|v| v.as_str()).map(String::from);

    Some(InboundEvent {
        organization_id,
        whatsapp_number_id,
        upstream_message_id,
        sender_whatsapp_id,
        message_type: MessageType::Text,
        text,
        media_url: None,
    })
}

async fn upsert_contact(db: &PgPool, organization_id: Uuid, whatsapp_id: &str) -> CoreResult<Uuid> {
    let row = sqlx::query!(
        r#"
        INSERT INTO contacts (id, organization_id, whatsapp_id, is_blocked, created_at, updated_at)
        VALUES ($1, $2, $3, false, now(), now())
        ON CONFLICT (organization_id, whatsapp_id) DO UPDATE SET updated_at = now()
        RETURNING id
        "#,
        Uuid::new_v4(),
        organization_id,
        whatsapp_id
    )
    .fetch_one(db)
    .await
    .map_err(CoreError::from)?;

    Ok(row.id)
}

struct MainFlowStart {
    chatbot_id: Option<Uuid>,
    flow_id: Option<Uuid>,
    start_node_id: Option<Uuid>,
}

/// Resolves a number's configured chatbot to its main flow's start node, if any.
async fn default_main_flow_start(db: &PgPool, whatsapp_number_id: Uuid) -> CoreResult<MainFlowStart> {
    let chatbot_id = sqlx::query!(
        "SELECT default_chatbot_id FROM whatsapp_numbers WHERE id = $1",
        whatsapp_number_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .and_then(|r| r.default_chatbot_id);

    let Some(chatbot_id) = chatbot_id else {
        return Ok(MainFlowStart { chatbot_id: None, flow_id: None, start_node_id: None });
    };

    let flow = sqlx::query!(
        "SELECT id FROM flows WHERE chatbot_id = $1 AND is_main = true AND deleted_at IS NULL LIMIT 1",
        chatbot_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?;

    let Some(flow) = flow else {
        return Ok(MainFlowStart { chatbot_id: Some(chatbot_id), flow_id: None, start_node_id: None });
    };

    let start_node_id = sqlx::query!(
        "SELECT id FROM nodes WHERE flow_id = $1 AND node_type = 'start' LIMIT 1",
        flow.id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .map(|r| r.id);

    Ok(MainFlowStart { chatbot_id: Some(chatbot_id), flow_id: Some(flow.id), start_node_id })
}

/// Step 4: prefers an existing non-closed conversation for this
/// `(contact, number)` pair; otherwise creates one, seeding the active flow
/// from the number's configured chatbot when it has one.
async fn resolve_conversation(
    db: &PgPool,
    now: DateTime<Utc>,
    organization_id: Uuid,
    contact_id: Uuid,
    whatsapp_number_id: Uuid,
) -> CoreResult<Uuid> {
    let existing = sqlx::query!(
        r#"
        SELECT id FROM conversations
        WHERE contact_id = $1 AND whatsapp_number_id = $2 AND status != 'closed' AND deleted_at IS NULL
        ORDER BY created_at DESC
        LIMIT 1
        "#,
        contact_id,
        whatsapp_number_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?;

    if let Some(row) = existing {
        return Ok(row.id);
    }

    let main_flow = default_main_flow_start(db, whatsapp_number_id).await?;
    let flow_cursor_state = if main_flow.flow_id.is_some() {
        FlowCursorState::Running
    } else {
        FlowCursorState::Closed
    };
    let conversation_id = Uuid::new_v4();

    sqlx::query!(
        r#"
        INSERT INTO conversations
            (id, organization_id, contact_id, whatsapp_number_id, status, is_bot_active,
             active_chatbot_id, active_flow_id, current_node_id, flow_cursor_state,
             context_variables, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'open', true, $5, $6, $7, $8, '{}'::jsonb, $9, $9)
        "#,
        conversation_id,
        organization_id,
        contact_id,
        whatsapp_number_id,
        main_flow.chatbot_id,
        main_flow.flow_id,
        main_flow.start_node_id,
        flow_cursor_state,
        now
    )
    .execute(db)
    .await
    .map_err(CoreError::from)?;

    Ok(conversation_id)
}

struct ConversationLookup {
    is_bot_active: bool,
    active_flow_id: Option<Uuid>,
    current_node_id: Option<Uuid>,
}

async fn fetch_conversation_lookup(db: &PgPool, conversation_id: Uuid) -> CoreResult<ConversationLookup> {
    sqlx::query_as!(
        ConversationLookup,
        "SELECT is_bot_active, active_flow_id, current_node_id FROM conversations WHERE id = $1",
        conversation_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("conversation {conversation_id}")))
}

struct RoutingNode {
    flow_id: Uuid,
    node_type: NodeType,
    data: serde_json::Value,
}

async fn fetch_node_for_routing(db: &PgPool, node_id: Uuid) -> CoreResult<RoutingNode> {
    sqlx::query_as!(
        RoutingNode,
        r#"SELECT flow_id, node_type as "node_type: NodeType", data FROM nodes WHERE id = $1"#,
        node_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("node {node_id}")))
}

/// Step 7a: stores the customer's reply into the question/interactive node's
/// configured variable and walks the cursor past it, so the next
/// `advance_conversation` call picks up at the successor rather than
/// re-asking the same question.
async fn record_answer_and_advance_past(
    db: &PgPool,
    conversation_id: Uuid,
    node_id: Uuid,
    node: &RoutingNode,
    answer: &str,
) -> CoreResult<()> {
    let output_variable = node.data.get("output_variable").and_then(|v| v.as_str()).unwrap_or("last_response");

    let current = sqlx::query!("SELECT context_variables FROM conversations WHERE id = $1", conversation_id)
        .fetch_one(db)
        .await
        .map_err(CoreError::from)?;
    let mut vars = current.context_variables;
    if let Some(obj) = vars.as_object_mut() {
        obj.insert(output_variable.to_string(), serde_json::json!(answer));
    }

    let flow = sqlx::query!("SELECT canvas_data FROM flows WHERE id = $1", node.flow_id)
        .fetch_one(db)
        .await
        .map_err(CoreError::from)?;
    let canvas = CanvasData::from_json(&flow.canvas_data);

    match canvas.default_successor(node_id) {
        Some(next) => {
            sqlx::query!(
                r#"
                UPDATE conversations
                SET context_variables = $2, current_node_id = $3, flow_cursor_state = 'running', updated_at = now()
                WHERE id = $1
                "#,
                conversation_id,
                vars,
                next
            )
            .execute(db)
            .await
            .map_err(CoreError::from)?;
        }
        None => {
            sqlx::query!(
                r#"
                UPDATE conversations
                SET context_variables = $2, current_node_id = NULL, flow_cursor_state = 'closed', updated_at = now()
                WHERE id = $1
                "#,
                conversation_id,
                vars
            )
            .execute(db)
            .await
            .map_err(CoreError::from)?;
        }
    }

    Ok(())
}

/// Step 7b: no flow to advance and no question pending. The message is
/// already visible to whoever owns the conversation's human queue once it's
/// persisted; there's nothing further to mutate here.
async fn route_to_agent_inbox(conversation_id: Uuid) {
    tracing::info!(%conversation_id, "inbound: routed to agent inbox");
}

/// Step 8: an append-only record a notification fan-out service can tail.
/// The actual WebSocket push to connected dashboards is external to this
/// runtime.
async fn emit_notification_event(db: &PgPool, organization_id: Uuid, conversation_id: Uuid, message_id: Uuid) -> CoreResult<()> {
    sqlx::query!(
        r#"
        INSERT INTO events (id, trace_id, source, action, payload, created_at)
        VALUES ($1, $2, 'inbound', 'message.received', $3, now())
        "#,
        Uuid::new_v4(),
        message_id,
        serde_json::json!({ "organization_id": organization_id, "conversation_id": conversation_id, "message_id": message_id })
    )
    .execute(db)
    .await
    .map_err(CoreError::from)?;

    Ok(())
}

/// The full steps 2-8 of the inbound pipeline; step 1 (signature
/// verification) happens in the mutation wrapper before this is ever called,
/// since it needs the raw body bytes rather than the parsed event.
pub async fn process_inbound_event(
    db: &PgPool,
    now: DateTime<Utc>,
    store: &dyn EphemeralStore,
    ai: &dyn AiPromptClient,
    rate_limiter: &RateLimiter,
    event: InboundEvent,
) -> CoreResult<InboundOutcome> {
    let dedup_key = format!("whatsapp:inbound:dedup:{}", event.upstream_message_id);
    let first_seen = store
        .set_if_absent(&dedup_key, "1", DEDUP_TTL)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    if !first_seen {
        return Ok(InboundOutcome::Duplicate);
    }

    let contact_id = upsert_contact(db, event.organization_id, &event.sender_whatsapp_id).await?;
    let conversation_id = resolve_conversation(db, now, event.organization_id, contact_id, event.whatsapp_number_id).await?;

    let message_id = Uuid::new_v4();
    sqlx::query!(
        r#"
        INSERT INTO messages
            (id, organization_id, conversation_id, direction, sender_type, message_type,
             content, status, attempt_count, created_at, updated_at)
        VALUES ($1, $2, $3, 'inbound', 'contact', $4, $5, 'delivered', 0, $6, $6)
        "#,
        message_id,
        event.organization_id,
        conversation_id,
        event.message_type,
        serde_json::json!({
            "text": event.text,
            "media_url": event.media_url,
            "upstream_message_id": event.upstream_message_id,
        }),
        now
    )
    .execute(db)
    .await
    .map_err(CoreError::from)?;

    window_engine::reset_on_inbound(db, now, conversation_id).await?;

    let conversation = fetch_conversation_lookup(db, conversation_id).await?;
    let pending_question = if conversation.is_bot_active {
        match conversation.current_node_id {
            Some(node_id) => {
                let node = fetch_node_for_routing(db, node_id).await?;
                if matches!(node.node_type, NodeType::Question | NodeType::InteractiveButtons | NodeType::InteractiveList) {
                    Some((node_id, node))
                } else {
                    None
                }
            }
            None => None,
        }
    } else {
        None
    };

    let flow_messages_queued = if let Some((node_id, node)) = pending_question {
        record_answer_and_advance_past(db, conversation_id, node_id, &node, event.text.as_deref().unwrap_or_default()).await?;
        let (intents, _outcome) = flow_engine::advance_conversation(db, conversation_id, ai).await?;
        flow_engine::dispatch_intents(db, now, rate_limiter, &intents).await?;
        intents.len()
    } else if conversation.active_flow_id.is_none() && conversation.is_bot_active {
        let main_flow = default_main_flow_start(db, event.whatsapp_number_id).await?;
        if let Some(flow_id) = main_flow.flow_id {
            sqlx::query!(
                r#"
                UPDATE conversations
                SET active_chatbot_id = $2, active_flow_id = $3, current_node_id = $4,
                    flow_cursor_state = 'running', updated_at = now()
                WHERE id = $1
                "#,
                conversation_id,
                main_flow.chatbot_id,
                flow_id,
                main_flow.start_node_id
            )
            .execute(db)
            .await
            .map_err(CoreError::from)?;

            let (intents, _outcome) = flow_engine::advance_conversation(db, conversation_id, ai).await?;
            flow_engine::dispatch_intents(db, now, rate_limiter, &intents).await?;
            intents.len()
        } else {
            route_to_agent_inbox(conversation_id).await;
            0
        }
    } else {
        route_to_agent_inbox(conversation_id).await;
        0
    };

    emit_notification_event(db, event.organization_id, conversation_id, message_id).await?;

    Ok(InboundOutcome::Processed { conversation_id, flow_messages_queued })
}

async fn build_dependencies(
    ctx_env_redis_url: String,
    ctx_env_ai_key: String,
    ctx_env_ai_model: String,
) -> std::result::Result<(Arc<dyn EphemeralStore>, crate::services::RealAiPromptClient, RateLimiter), ForgeError> {
    let store: Arc<dyn EphemeralStore> = Arc::new(
        crate::services::RedisEphemeralStore::connect(&ctx_env_redis_url)
            .await
            .map_err(|e| ForgeError::Internal(e.to_string()))?,
    );
    let rate_limiter = RateLimiter::new(store.clone());
    let ai = crate::services::RealAiPromptClient::new(ctx_env_ai_key, ctx_env_ai_model)
        .map_err(|e| ForgeError::Internal(e.to_string()))?;
    Ok((store, ai, rate_limiter))
}

#[derive(Debug, Deserialize)]
pub struct IngestOfficialWebhookInput {
    pub organization_id: Uuid,
    pub whatsapp_number_id: Uuid,
    pub signature_header: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct IngestWebhookOutput {
    pub outcome: String,
}

/// Entry point for the official Cloud API webhook.
#[forge::mutation(public)]
pub async fn ingest_official_webhook(ctx: &MutationContext, input: IngestOfficialWebhookInput) -> Result<IngestWebhookOutput> {
    let body_bytes = serde_json::to_vec(&input.body).map_err(|e| ForgeError::Internal(e.to_string()))?;
    let verified = verify_official_webhook(ctx.db(), input.whatsapp_number_id, &body_bytes, &input.signature_header)
        .await
        .map_err(ForgeError::from)?;
    if !verified {
        return Err(ForgeError::Validation("invalid webhook signature".to_string()));
    }

    let Some(event) = parse_official_webhook_payload(input.organization_id, input.whatsapp_number_id, &input.body) else {
        return Ok(IngestWebhookOutput { outcome: "ignored".to_string() });
    };

    let (store, ai, rate_limiter) = build_dependencies(
        ctx.env_parse::<String>("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        ctx.env_parse::<String>("OPENROUTER_API_KEY").unwrap_or_default(),
        ctx.env_parse::<String>("OPENROUTER_MODEL").unwrap_or_else(|_| "moonshotai/kimi-k2.5".to_string()),
    )
    .await?;

    let outcome = process_inbound_event(ctx.db(), Utc::now(), store.as_ref(), &ai, &rate_limiter, event)
        .await
        .map_err(ForgeError::from)?;

    Ok(IngestWebhookOutput { outcome: format!("{outcome:?}") })
}

#[derive(Debug, Deserialize)]
pub struct IngestQrcodeWebhookInput {
    pub organization_id: Uuid,
    pub whatsapp_number_id: Uuid,
    pub presented_token: String,
    pub body: serde_json::Value,
}

/// Entry point for the qrcode (Evolution-style) webhook.
#[forge::mutation(public)]
pub async fn ingest_qrcode_webhook(ctx: &MutationContext, input: IngestQrcodeWebhookInput) -> Result<IngestWebhookOutput> {
    let verified = verify_qrcode_webhook(ctx.db(), input.whatsapp_number_id, &input.presented_token)
        .await
        .map_err(ForgeError::from)?;
    if !verified {
        return Err(ForgeError::Validation("invalid webhook token".to_string()));
    }

    let Some(event) = parse_qrcode_webhook_payload(input.organization_id, input.whatsapp_number_id, &input.body) else {
        return Ok(IngestWebhookOutput { outcome: "ignored".to_string() });
    };

    let (store, ai, rate_limiter) = build_dependencies(
        ctx.env_parse::<String>("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        ctx.env_parse::<String>("OPENROUTER_API_KEY").unwrap_or_default(),
        ctx.env_parse::<String>("OPENROUTER_MODEL").unwrap_or_else(|_| "moonshotai/kimi-k2.5".to_string()),
    )
    .await?;

    let outcome = process_inbound_event(ctx.db(), Utc::now(), store.as_ref(), &ai, &rate_limiter, event)
        .await
        .map_err(ForgeError::from)?;

    Ok(IngestWebhookOutput { outcome: format!("{outcome:?}") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    use forge::testing::{IsolatedTestDb, TestDatabase};

    #[test]
    fn parses_cloud_api_text_payload() {
        let organization_id = Uuid::new_v4();
        let number_id = Uuid::new_v4();
        let body = serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "id": "wamid.abc123",
                            "from": "15550001111",
                            "type": "text",
                            "text": { "body": "hello there" },
                        }]
                    }
                }]
            }]
        });

        let event = parse_official_webhook_payload(organization_id, number_id, &body).unwrap();
        assert_eq!(event.upstream_message_id, "wamid.abc123");
        assert_eq!(event.sender_whatsapp_id, "15550001111");
        assert_eq!(event.text.as_deref(), Some("hello there"));
    }

    #[test]
    fn ignores_payload_with_no_messages() {
        let body = serde_json::json!({ "entry": [{ "changes": [{ "value": { "statuses": [] } }] }] });
        assert!(parse_official_webhook_payload(Uuid::new_v4(), Uuid::new_v4(), &body).is_none());
    }

    #[test]
    fn parses_qrcode_payload() {
        let body = serde_json::json!({
            "data": {
                "key": { "id": "ABCD1234", "remoteJid": "15550002222@s.whatsapp.net" },
                "message": { "conversation": "hi there" },
            }
        });
        let event = parse_qrcode_webhook_payload(Uuid::new_v4(), Uuid::new_v4(), &body).unwrap();
        assert_eq!(event.sender_whatsapp_id, "15550002222");
        assert_eq!(event.text.as_deref(), Some("hi there"));
    }

    #[derive(Default)]
    struct FakeStore {
        values: AsyncMutex<HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl EphemeralStore for FakeStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.values.lock().await.get(key).cloned())
        }
        async fn set_with_ttl(&self, key: &str, value: &str, _ttl: Duration) -> anyhow::Result<()> {
            self.values.lock().await.insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn set_if_absent(&self, key: &str, value: &str, _ttl: Duration) -> anyhow::Result<bool> {
            let mut v = self.values.lock().await;
            if v.contains_key(key) {
                Ok(false)
            } else {
                v.insert(key.to_string(), value.to_string());
                Ok(true)
            }
        }
        async fn incr(&self, key: &str) -> anyhow::Result<i64> {
            self.incr_with_ttl(key, Duration::from_secs(60)).await
        }
        async fn incr_with_ttl(&self, key: &str, _ttl: Duration) -> anyhow::Result<i64> {
            let mut v = self.values.lock().await;
            let count: i64 = v.get(key).and_then(|s| s.parse().ok()).unwrap_or(0) + 1;
            v.insert(key.to_string(), count.to_string());
            Ok(count)
        }
        async fn decr(&self, key: &str) -> anyhow::Result<i64> {
            let mut v = self.values.lock().await;
            let count: i64 = v.get(key).and_then(|s| s.parse().ok()).unwrap_or(0) - 1;
            v.insert(key.to_string(), count.to_string());
            Ok(count)
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn lpush(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn rpush(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn lpop(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn lrange(&self, _key: &str, _start: isize, _stop: isize) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn lrem(&self, _key: &str, _count: isize, _value: &str) -> anyhow::Result<i64> {
            Ok(0)
        }
        async fn scan(&self, _pattern: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct UnusedAi;

    #[async_trait::async_trait]
    impl AiPromptClient for UnusedAi {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            panic!("this fixture never reaches an ai_prompt node")
        }
    }

    async fn setup() -> (IsolatedTestDb, PgPool) {
        let base = TestDatabase::embedded().await.unwrap();
        let db = base.isolated("inbound").await.unwrap();
        db.run_sql(
            r#"
            CREATE TABLE organizations (
                id uuid PRIMARY KEY,
                global_variables jsonb NOT NULL DEFAULT '{}'::jsonb
            );

            CREATE TABLE whatsapp_numbers (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                display_name text NOT NULL,
                connection_type text NOT NULL,
                quality_rating text NOT NULL DEFAULT 'green',
                messaging_limit_tier text NOT NULL DEFAULT 'tier_1',
                official_phone_number_id text,
                official_app_secret text,
                official_access_token text,
                qrcode_instance_name text,
                qrcode_webhook_token text,
                default_chatbot_id uuid,
                deleted_at timestamptz,
                created_at timestamptz NOT NULL DEFAULT now(),
                updated_at timestamptz NOT NULL DEFAULT now()
            );

            CREATE TABLE contacts (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                whatsapp_id text NOT NULL,
                display_name text,
                is_blocked bool NOT NULL DEFAULT false,
                deleted_at timestamptz,
                created_at timestamptz NOT NULL DEFAULT now(),
                updated_at timestamptz NOT NULL DEFAULT now(),
                UNIQUE (organization_id, whatsapp_id)
            );

            CREATE TABLE flows (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                chatbot_id uuid NOT NULL,
                name text NOT NULL DEFAULT 'main',
                is_main bool NOT NULL DEFAULT false,
                variables jsonb NOT NULL DEFAULT '{}'::jsonb,
                canvas_data jsonb NOT NULL DEFAULT '{}'::jsonb,
                fallback_flow_id uuid,
                deleted_at timestamptz
            );

            CREATE TABLE nodes (
                id uuid PRIMARY KEY,
                flow_id uuid NOT NULL,
                node_type text NOT NULL,
                data jsonb NOT NULL DEFAULT '{}'::jsonb
            );

            CREATE TABLE conversations (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                contact_id uuid NOT NULL,
                whatsapp_number_id uuid NOT NULL,
                status text NOT NULL DEFAULT 'open',
                is_bot_active bool NOT NULL DEFAULT true,
                active_chatbot_id uuid,
                active_flow_id uuid,
                current_node_id uuid,
                flow_cursor_state text NOT NULL DEFAULT 'closed',
                last_user_message_at timestamptz,
                window_expires_at timestamptz,
                context_variables jsonb NOT NULL DEFAULT '{}'::jsonb,
                deleted_at timestamptz,
                created_at timestamptz NOT NULL DEFAULT now(),
                updated_at timestamptz NOT NULL DEFAULT now()
            );

            CREATE TABLE conversation_windows (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id uuid NOT NULL,
                conversation_id uuid NOT NULL UNIQUE,
                started_at timestamptz NOT NULL,
                ends_at timestamptz NOT NULL,
                is_active bool NOT NULL DEFAULT true,
                status text NOT NULL DEFAULT 'active',
                close_reason text,
                version int NOT NULL DEFAULT 0,
                created_at timestamptz NOT NULL DEFAULT now(),
                updated_at timestamptz NOT NULL DEFAULT now()
            );

            CREATE TABLE messages (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                conversation_id uuid NOT NULL,
                direction text NOT NULL,
                sender_type text NOT NULL,
                message_type text NOT NULL,
                content jsonb NOT NULL DEFAULT '{}'::jsonb,
                status text NOT NULL DEFAULT 'pending',
                upstream_message_id text,
                error_code text,
                error_message text,
                attempt_count int NOT NULL DEFAULT 0,
                next_attempt_at timestamptz,
                trace_id uuid,
                created_at timestamptz NOT NULL DEFAULT now(),
                updated_at timestamptz NOT NULL DEFAULT now()
            );

            CREATE TABLE events (
                id uuid PRIMARY KEY,
                trace_id uuid,
                source text NOT NULL,
                action text NOT NULL,
                payload jsonb NOT NULL DEFAULT '{}'::jsonb,
                created_at timestamptz NOT NULL DEFAULT now()
            );
            "#,
        )
        .await
        .unwrap();
        let pool = db.pool().clone();
        (db, pool)
    }

    async fn seed_window(pool: &PgPool, organization_id: Uuid, conversation_id: Uuid, now: DateTime<Utc>) {
        sqlx::query(
            r#"
            INSERT INTO conversation_windows (organization_id, conversation_id, started_at, ends_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(organization_id)
        .bind(conversation_id)
        .bind(now - chrono::Duration::hours(1))
        .bind(now + chrono::Duration::hours(23))
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_upstream_id_is_rejected_without_a_second_message_row() {
        let (_db, pool) = setup().await;
        let now = Utc::now();
        let organization_id = Uuid::new_v4();
        let number_id = Uuid::new_v4();

        sqlx::query!(
            "INSERT INTO organizations (id) VALUES ($1)",
            organization_id
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            "INSERT INTO whatsapp_numbers (id, organization_id, display_name, connection_type) VALUES ($1, $2, 'main', 'official')",
            number_id,
            organization_id
        )
        .execute(&pool)
        .await
        .unwrap();

        let store = FakeStore::default();
        let rate_limiter = RateLimiter::new(Arc::new(FakeStore::default()));
        let ai = UnusedAi;

        let event = InboundEvent {
            organization_id,
            whatsapp_number_id: number_id,
            upstream_message_id: "wamid-dup-1".to_string(),
            sender_whatsapp_id: "15550003333".to_string(),
            message_type: MessageType::Text,
            text: Some("hi".to_string()),
            media_url: None,
        };

        let first = process_inbound_event(&pool, now, &store, &ai, &rate_limiter, event.clone_for_retry())
            .await
            .unwrap();
        assert!(matches!(first, InboundOutcome::Processed { .. }));

        let second = process_inbound_event(&pool, now, &store, &ai, &rate_limiter, event)
            .await
            .unwrap();
        assert_eq!(second, InboundOutcome::Duplicate);

        let message_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(message_count, 1);
    }

    impl InboundEvent {
        fn clone_for_retry(&self) -> Self {
            InboundEvent {
                organization_id: self.organization_id,
                whatsapp_number_id: self.whatsapp_number_id,
                upstream_message_id: self.upstream_message_id.clone(),
                sender_whatsapp_id: self.sender_whatsapp_id.clone(),
                message_type: self.message_type,
                text: self.text.clone(),
                media_url: self.media_url.clone(),
            }
        }
    }

    #[tokio::test]
    async fn answer_to_question_node_advances_past_it() {
        let (_db, pool) = setup().await;
        let now = Utc::now();

        let organization_id = Uuid::new_v4();
        let number_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        let chatbot_id = Uuid::new_v4();
        let flow_id = Uuid::new_v4();
        let question_node_id = Uuid::new_v4();
        let end_node_id = Uuid::new_v4();

        sqlx::query!("INSERT INTO organizations (id) VALUES ($1)", organization_id)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query!(
            "INSERT INTO whatsapp_numbers (id, organization_id, display_name, connection_type) VALUES ($1, $2, 'main', 'official')",
            number_id,
            organization_id
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            "INSERT INTO contacts (id, organization_id, whatsapp_id) VALUES ($1, $2, $3)",
            contact_id,
            organization_id,
            "15550004444"
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            "INSERT INTO flows (id, organization_id, chatbot_id, is_main, canvas_data) VALUES ($1, $2, $3, true, $4)",
            flow_id,
            organization_id,
            chatbot_id,
            serde_json::json!({ "edges": [{ "from_node_id": question_node_id, "to_node_id": end_node_id, "label": null }] })
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            "INSERT INTO nodes (id, flow_id, node_type, data) VALUES ($1, $2, 'question', $3)",
            question_node_id,
            flow_id,
            serde_json::json!({ "text": "What's your name?", "output_variable": "customer_name" })
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            "INSERT INTO nodes (id, flow_id, node_type, data) VALUES ($1, $2, 'end', '{\"close_conversation\": true}'::jsonb)",
            end_node_id,
            flow_id
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            r#"
            INSERT INTO conversations
                (id, organization_id, contact_id, whatsapp_number_id, is_bot_active,
                 active_chatbot_id, active_flow_id, current_node_id, flow_cursor_state)
            VALUES ($1, $2, $3, $4, true, $5, $6, $7, 'awaiting_user')
            "#,
            conversation_id,
            organization_id,
            contact_id,
            number_id,
            chatbot_id,
            flow_id,
            question_node_id
        )
        .execute(&pool)
        .await
        .unwrap();
        seed_window(&pool, organization_id, conversation_id, now).await;

        let store = FakeStore::default();
        let rate_limiter = RateLimiter::new(Arc::new(FakeStore::default()));
        let ai = UnusedAi;

        let event = InboundEvent {
            organization_id,
            whatsapp_number_id: number_id,
            upstream_message_id: "wamid-answer-1".to_string(),
            sender_whatsapp_id: "15550004444".to_string(),
            message_type: MessageType::Text,
            text: Some("Ana".to_string()),
            media_url: None,
        };

        let outcome = process_inbound_event(&pool, now, &store, &ai, &rate_limiter, event).await.unwrap();
        assert!(matches!(outcome, InboundOutcome::Processed { conversation_id: cid, .. } if cid == conversation_id));

        let row = sqlx::query!(
            "SELECT context_variables, current_node_id, flow_cursor_state FROM conversations WHERE id = $1",
            conversation_id
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.context_variables, serde_json::json!({ "customer_name": "Ana" }));
        assert_eq!(row.current_node_id, None);
        assert_eq!(row.flow_cursor_state, "closed");
    }
}
