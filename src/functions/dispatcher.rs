use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forge::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreError;
use crate::functions::window_engine;
use crate::schema::{ConnectionType, ConversationStatus, MessageStatus, MessageType, WhatsAppNumber};
use crate::services::{AdapterResolver, OutboundMessage, RateLimiter, TemplateComponent};

pub const RETRY_BASE: Duration = Duration::from_secs(60);
pub const RETRY_MAX: Duration = Duration::from_secs(3600);
pub const MAX_ATTEMPTS: i32 = 3;

type CoreResult<T> = std::result::Result<T, CoreError>;

/// What C6/C8 hand the dispatcher: enough to build the wire payload without
/// the dispatcher needing to know where the intent came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub organization_id: Uuid,
    pub conversation_id: Uuid,
    pub message_type: MessageType,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub template_name: Option<String>,
    pub template_language: Option<String>,
    pub template_components: Vec<TemplateComponent>,
}

impl SendRequest {
    fn is_template(&self) -> bool {
        self.message_type == MessageType::Template
    }

    fn content(&self) -> serde_json::Value {
        serde_json::json!({
            "text": self.text,
            "media_url": self.media_url,
            "template_name": self.template_name,
            "template_language": self.template_language,
        })
    }
}

struct ConversationRow {
    contact_id: Uuid,
    whatsapp_number_id: Uuid,
}

struct ConversationDispatchRow {
    contact_id: Uuid,
    whatsapp_number_id: Uuid,
    status: ConversationStatus,
    is_blocked: bool,
}

async fn fetch_conversation_for_send(db: &PgPool, conversation_id: Uuid) -> CoreResult<ConversationRow> {
    sqlx::query_as!(
        ConversationRow,
        "SELECT contact_id, whatsapp_number_id FROM conversations WHERE id = $1",
        conversation_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("conversation {conversation_id}")))
}

async fn fetch_number(db: &PgPool, number_id: Uuid) -> CoreResult<WhatsAppNumber> {
    sqlx::query_as!(
        WhatsAppNumber,
        r#"
        SELECT id, organization_id, display_name,
               connection_type as "connection_type: ConnectionType",
               quality_rating as "quality_rating: crate::schema::QualityRating",
               messaging_limit_tier, official_phone_number_id, official_app_secret,
               official_access_token, qrcode_instance_name, qrcode_webhook_token,
               default_chatbot_id, deleted_at, created_at, updated_at
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

async fn fetch_contact_whatsapp_id(db: &PgPool, contact_id: Uuid) -> CoreResult<String> {
    let row = sqlx::query!("SELECT whatsapp_id FROM contacts WHERE id = $1", contact_id)
        .fetch_optional(db)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::NotFound(format!("contact {contact_id}")))?;
    Ok(row.whatsapp_id)
}

/// Step 1-4 of the outbound dispatch algorithm: lock the conversation,
/// reject blocked contacts and closed conversations, run the window +
/// rate-limit checks, and persist the Message row. The actual upstream call
/// (step 5) happens on the next `dispatcher_tick`, never inline here, so a
/// slow upstream never holds the conversation's row lock.
pub async fn enqueue_outbound(
    db: &PgPool,
    now: DateTime<Utc>,
    rate_limiter: &RateLimiter,
    request: SendRequest,
) -> CoreResult<Uuid> {
    let mut tx = db.begin().await.map_err(CoreError::from)?;

    // locks the conversation row for the rest of this transaction: a second
    // dispatcher enqueueing onto the same conversation blocks here rather
    // than interleaving with this one, per the single-cursor-at-a-time rule.
    let conversation = sqlx::query_as!(
        ConversationDispatchRow,
        r#"
        SELECT c.contact_id, c.whatsapp_number_id,
               c.status as "status: ConversationStatus",
               ct.is_blocked
        FROM conversations c
        JOIN contacts ct ON ct.id = c.contact_id
        WHERE c.id = $1
        FOR UPDATE OF c
        "#,
        request.conversation_id
    )
    .fetch_optional(&mut *tx)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("conversation {}", request.conversation_id)))?;

    if conversation.is_blocked {
        return Err(CoreError::ConversationNotDispatchable(format!(
            "contact {} is blocked",
            conversation.contact_id
        )));
    }
    if conversation.status == ConversationStatus::Closed {
        return Err(CoreError::ConversationNotDispatchable(format!(
            "conversation {} is closed",
            request.conversation_id
        )));
    }

    let validation = window_engine::validate(db, now, request.conversation_id, request.is_template()).await?;
    if !validation.is_valid {
        return Err(CoreError::WindowClosed(
            validation.reason.unwrap_or_else(|| "window closed".to_string()),
        ));
    }

    let number = fetch_number(db, conversation.whatsapp_number_id).await?;

    let wait_seconds = rate_limiter
        .wait_if_needed(&number.id.to_string(), number.connection_type)
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    // any wait, short or long, is absorbed by persisting the Message row
    // with a future `next_attempt_at` rather than dropping the intent: the
    // dispatcher's own retry poll picks it up once the wait elapses.
    let message_id = Uuid::new_v4();
    let next_attempt_at = if wait_seconds > 0 {
        Some(now + chrono::Duration::seconds(wait_seconds as i64))
    } else {
        None
    };

    sqlx::query!(
        r#"
        INSERT INTO messages
            (id, organization_id, conversation_id, direction, sender_type, message_type,
             content, status, attempt_count, next_attempt_at, created_at, updated_at)
        VALUES ($1, $2, $3, 'outbound', 'bot', $4, $5, 'pending', 0, $6, $7, $7)
        "#,
        message_id,
        request.organization_id,
        request.conversation_id,
        request.message_type,
        request.content(),
        next_attempt_at,
        now
    )
    .execute(&mut *tx)
    .await
    .map_err(CoreError::from)?;

    tx.commit().await.map_err(CoreError::from)?;
    Ok(message_id)
}

struct PendingMessage {
    id: Uuid,
    conversation_id: Uuid,
    message_type: MessageType,
    content: serde_json::Value,
    attempt_count: i32,
}

/// Exponential backoff with +/-20% jitter, clamped to `RETRY_MAX`.
fn backoff_delay(attempt: i32) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 10) as u32;
    let base = RETRY_BASE.as_secs().saturating_mul(1u64 << exponent);
    let capped = base.min(RETRY_MAX.as_secs()) as f64;
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = (capped * (1.0 + jitter)).max(1.0).round() as u64;
    Duration::from_secs(jittered)
}

async fn fetch_pending(db: &PgPool, now: DateTime<Utc>) -> CoreResult<Vec<PendingMessage>> {
    sqlx::query_as!(
        PendingMessage,
        r#"
        SELECT id, conversation_id, message_type as "message_type: MessageType", content, attempt_count
        FROM messages
        WHERE direction = 'outbound' AND status = 'pending'
          AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
        ORDER BY created_at
        LIMIT 20
        "#,
        now
    )
    .fetch_all(db)
    .await
    .map_err(CoreError::from)
}

fn build_outbound_message(content: &serde_json::Value, message_type: MessageType, to: &str) -> OutboundMessage<'_> {
    let components: Vec<TemplateComponent> = content
        .get("template_components")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    OutboundMessage {
        to,
        message_type,
        text: content.get("text").and_then(|v| v.as_str()),
        media_url: content.get("media_url").and_then(|v| v.as_str()),
        template_name: content.get("template_name").and_then(|v| v.as_str()),
        template_language: content.get("template_language").and_then(|v| v.as_str()),
        template_components: components,
    }
}

#[derive(Debug, Default, Serialize)]
pub struct DispatchStats {
    pub sent: u32,
    pub retried: u32,
    pub failed: u32,
}

/// Step 5 of the outbound dispatch algorithm, run once per due Message row:
/// resolve the adapter, send, and advance status on success or schedule a
/// retry (or terminal failure past `MAX_ATTEMPTS`) on error.
pub async fn dispatcher_tick(
    db: &PgPool,
    now: DateTime<Utc>,
    rate_limiter: &RateLimiter,
    adapters: &dyn AdapterResolver,
) -> CoreResult<DispatchStats> {
    let mut stats = DispatchStats::default();

    for pending in fetch_pending(db, now).await? {
        let conversation = match fetch_conversation_for_send(db, pending.conversation_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(message_id = %pending.id, error = %e, "dispatcher: conversation lookup failed");
                continue;
            }
        };

        let number = match fetch_number(db, conversation.whatsapp_number_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(message_id = %pending.id, error = %e, "dispatcher: number lookup failed");
                continue;
            }
        };

        let check = match rate_limiter.check(&number.id.to_string(), number.connection_type).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(message_id = %pending.id, error = %e, "dispatcher: rate limit check failed");
                continue;
            }
        };

        if !check.allowed {
            let next_attempt_at = now + chrono::Duration::seconds(check.retry_after_seconds as i64);
            let _ = sqlx::query!(
                "UPDATE messages SET next_attempt_at = $2, updated_at = now() WHERE id = $1",
                pending.id,
                next_attempt_at
            )
            .execute(db)
            .await;
            continue;
        }

        let to = match fetch_contact_whatsapp_id(db, conversation.contact_id).await {
            Ok(to) => to,
            Err(e) => {
                tracing::error!(message_id = %pending.id, error = %e, "dispatcher: contact lookup failed");
                continue;
            }
        };

        let adapter = match adapters.resolve(&number).await {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(message_id = %pending.id, error = %e, "dispatcher: adapter resolution failed");
                continue;
            }
        };

        let outbound = build_outbound_message(&pending.content, pending.message_type, &to);
        let send_result = adapter.send(&number.id.to_string(), outbound).await;

        match send_result {
            Ok(upstream_id) => {
                sqlx::query!(
                    r#"
                    UPDATE messages
                    SET status = 'sent', upstream_message_id = $2, updated_at = now()
                    WHERE id = $1
                    "#,
                    pending.id,
                    upstream_id
                )
                .execute(db)
                .await
                .map_err(CoreError::from)?;

                rate_limiter
                    .record(&number.id.to_string(), number.connection_type)
                    .await
                    .map_err(|e| CoreError::Internal(e.to_string()))?;

                stats.sent += 1;
            }
            Err(e) => {
                let attempt = pending.attempt_count + 1;
                if attempt >= MAX_ATTEMPTS {
                    sqlx::query!(
                        r#"
                        UPDATE messages
                        SET status = 'failed', attempt_count = $2, error_message = $3, updated_at = now()
                        WHERE id = $1
                        "#,
                        pending.id,
                        attempt,
                        e.to_string()
                    )
                    .execute(db)
                    .await
                    .map_err(CoreError::from)?;
                    stats.failed += 1;
                } else {
                    let delay = backoff_delay(attempt);
                    let next_attempt_at = now + chrono::Duration::seconds(delay.as_secs() as i64);
                    sqlx::query!(
                        r#"
                        UPDATE messages
                        SET attempt_count = $2, next_attempt_at = $3, error_message = $4, updated_at = now()
                        WHERE id = $1
                        "#,
                        pending.id,
                        attempt,
                        next_attempt_at,
                        e.to_string()
                    )
                    .execute(db)
                    .await
                    .map_err(CoreError::from)?;
                    stats.retried += 1;
                }
                tracing::warn!(message_id = %pending.id, attempt, error = %e, "dispatcher: send failed");
            }
        }
    }

    Ok(stats)
}

/// Applies an upstream delivery-status webhook (`sent`/`delivered`/`read`/
/// `failed`) idempotently: out-of-order or duplicate callbacks that would
/// move status backwards are accepted as no-ops rather than errors.
pub async fn apply_status_update(
    db: &PgPool,
    upstream_message_id: &str,
    new_status: MessageStatus,
    error_code: Option<String>,
    error_message: Option<String>,
) -> CoreResult<bool> {
    let row = sqlx::query!(
        r#"SELECT id, status as "status: MessageStatus" FROM messages WHERE upstream_message_id = $1"#,
        upstream_message_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?;

    let Some(row) = row else {
        return Ok(false);
    };

    if !row.status.can_advance_to(new_status) {
        return Ok(false);
    }

    sqlx::query!(
        r#"
        UPDATE messages
        SET status = $2, error_code = $3, error_message = $4, updated_at = now()
        WHERE id = $1
        "#,
        row.id,
        new_status,
        error_code,
        error_message
    )
    .execute(db)
    .await
    .map_err(CoreError::from)?;

    Ok(true)
}

#[forge::daemon]
pub async fn dispatcher(ctx: &DaemonContext) -> Result<()> {
    let store: Arc<dyn crate::services::EphemeralStore> = Arc::new(
        crate::services::RedisEphemeralStore::connect(
            &ctx.env_parse::<String>("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        )
        .await
        .map_err(|e| ForgeError::Internal(e.to_string()))?,
    );
    let rate_limiter = RateLimiter::new(store);
    let adapters = crate::services::DefaultAdapterResolver::new();
    let poll_ms: u64 = ctx.env_parse("WHATSAPP_CORE_LOOP_POLL_MS_DISPATCHER").unwrap_or(500);

    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                match dispatcher_tick(ctx.db(), Utc::now(), &rate_limiter, &adapters).await {
                    Ok(stats) if stats.sent > 0 || stats.retried > 0 || stats.failed > 0 => {
                        tracing::info!(sent = stats.sent, retried = stats.retried, failed = stats.failed, "dispatcher tick");
                    }
                    Err(e) => tracing::error!(error = %e, "dispatcher tick failed"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SendMessageInput {
    pub request: SendRequest,
}

#[derive(Debug, Serialize)]
pub struct SendMessageOutput {
    pub message_id: Uuid,
}

#[forge::mutation(public)]
pub async fn send_message(ctx: &MutationContext, input: SendMessageInput) -> Result<SendMessageOutput> {
    let store: Arc<dyn crate::services::EphemeralStore> = Arc::new(
        crate::services::RedisEphemeralStore::connect(
            &ctx.env_parse::<String>("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        )
        .await
        .map_err(|e| ForgeError::Internal(e.to_string()))?,
    );
    let rate_limiter = RateLimiter::new(store);
    let message_id = enqueue_outbound(ctx.db(), Utc::now(), &rate_limiter, input.request)
        .await
        .map_err(ForgeError::from)?;
    Ok(SendMessageOutput { message_id })
}
