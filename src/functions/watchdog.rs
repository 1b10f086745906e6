use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forge::prelude::*;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreError;
use crate::functions::{dispatcher, flow_engine, window_engine};
use crate::schema::MessageType;
use crate::services::{AiPromptClient, RateLimiter};

type CoreResult<T> = std::result::Result<T, CoreError>;

const WARNING_SENT_KEY: &str = "_inactivity_warning_sent_at";
const ACTION_DONE_KEY: &str = "_inactivity_action_done_at";
const WINDOW_WARNING_SENT_KEY: &str = "_window_warning_sent_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InactivityAction {
    Transfer,
    Close,
    SendReminder,
    FallbackFlow,
}

impl InactivityAction {
    fn parse(raw: &str) -> Self {
        match raw {
            "transfer" => InactivityAction::Transfer,
            "close" => InactivityAction::Close,
            "fallback_flow" => InactivityAction::FallbackFlow,
            _ => InactivityAction::SendReminder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowExpiryAction {
    Transfer,
    SendTemplate,
    WaitCustomer,
}

impl WindowExpiryAction {
    fn parse(raw: &str) -> Self {
        match raw {
            "transfer" => WindowExpiryAction::Transfer,
            "send_template" => WindowExpiryAction::SendTemplate,
            _ => WindowExpiryAction::WaitCustomer,
        }
    }
}

struct InactivityPolicy {
    enabled: bool,
    timeout_minutes: i64,
    send_warning_at_minutes: i64,
    warning_message: String,
    closing_message: String,
    action: InactivityAction,
    fallback_flow_id: Option<Uuid>,
}

impl Default for InactivityPolicy {
    fn default() -> Self {
        InactivityPolicy {
            enabled: true,
            timeout_minutes: 60,
            send_warning_at_minutes: 50,
            warning_message: "Are you still there? This conversation will close in {{remaining_minutes}} minutes.".to_string(),
            closing_message: "Closing this conversation due to inactivity.".to_string(),
            action: InactivityAction::Close,
            fallback_flow_id: None,
        }
    }
}

/// Overlays a flow's `inactivity_settings` JSON over the global defaults;
/// any field the flow doesn't set falls back to the default.
fn effective_inactivity_policy(settings: &serde_json::Value) -> InactivityPolicy {
    let defaults = InactivityPolicy::default();
    InactivityPolicy {
        enabled: settings.get("enabled").and_then(|v| v.as_bool()).unwrap_or(defaults.enabled),
        timeout_minutes: settings.get("timeout_minutes").and_then(|v| v.as_i64()).unwrap_or(defaults.timeout_minutes),
        send_warning_at_minutes: settings
            .get("send_warning_at_minutes")
            .and_then(|v| v.as_i64())
            .unwrap_or(defaults.send_warning_at_minutes),
        warning_message: settings
            .get("warning_message")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or(defaults.warning_message),
        closing_message: settings
            .get("closing_message")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or(defaults.closing_message),
        action: settings.get("action").and_then(|v| v.as_str()).map(InactivityAction::parse).unwrap_or(defaults.action),
        fallback_flow_id: settings
            .get("fallback_flow_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok()),
    }
}

struct WindowExpiryPolicy {
    enabled: bool,
    warning_at_hours: f64,
    warning_message: String,
    action: WindowExpiryAction,
    template_name: Option<String>,
}

impl Default for WindowExpiryPolicy {
    fn default() -> Self {
        WindowExpiryPolicy {
            enabled: true,
            warning_at_hours: 2.0,
            warning_message: "This conversation window closes in {{remaining_minutes}} minutes.".to_string(),
            action: WindowExpiryAction::WaitCustomer,
            template_name: None,
        }
    }
}

fn effective_window_expiry_policy(settings: &serde_json::Value) -> WindowExpiryPolicy {
    let defaults = WindowExpiryPolicy::default();
    WindowExpiryPolicy {
        enabled: settings.get("enabled").and_then(|v| v.as_bool()).unwrap_or(defaults.enabled),
        warning_at_hours: settings.get("warning_at_hours").and_then(|v| v.as_f64()).unwrap_or(defaults.warning_at_hours),
        warning_message: settings
            .get("warning_message")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or(defaults.warning_message),
        action: settings.get("action").and_then(|v| v.as_str()).map(WindowExpiryAction::parse).unwrap_or(defaults.action),
        template_name: settings.get("template_name").and_then(|v| v.as_str()).map(String::from),
    }
}

/// The four template variables every watchdog message supports.
fn replace_message_variables(template: &str, timeout_minutes: i64, warning_at_minutes: i64, inactive_minutes: i64, remaining_minutes: i64) -> String {
    template
        .replace("{{timeout_minutes}}", &timeout_minutes.to_string())
        .replace("{{warning_at_minutes}}", &warning_at_minutes.to_string())
        .replace("{{inactive_minutes}}", &inactive_minutes.to_string())
        .replace("{{remaining_minutes}}", &remaining_minutes.to_string())
}

struct InactivityCandidate {
    conversation_id: Uuid,
    organization_id: Uuid,
    active_flow_id: Option<Uuid>,
    last_user_message_at: Option<DateTime<Utc>>,
    context_variables: serde_json::Value,
}

async fn fetch_inactivity_candidates(db: &PgPool) -> CoreResult<Vec<InactivityCandidate>> {
    sqlx::query_as!(
        InactivityCandidate,
        r#"
        SELECT c.id as conversation_id, c.organization_id, c.active_flow_id,
               c.last_user_message_at, c.context_variables
        FROM conversations c
        JOIN conversation_windows w ON w.conversation_id = c.id
        WHERE c.is_bot_active = true
          AND c.status != 'closed'
          AND c.deleted_at IS NULL
          AND w.is_active = true
          AND c.last_user_message_at IS NOT NULL
        "#,
    )
    .fetch_all(db)
    .await
    .map_err(CoreError::from)
}

async fn send_watchdog_message(
    db: &PgPool,
    now: DateTime<Utc>,
    rate_limiter: &RateLimiter,
    organization_id: Uuid,
    conversation_id: Uuid,
    text: String,
) {
    let request = dispatcher::SendRequest {
        organization_id,
        conversation_id,
        message_type: MessageType::Text,
        text: Some(text),
        media_url: None,
        template_name: None,
        template_language: None,
        template_components: Vec::new(),
    };
    if let Err(e) = dispatcher::enqueue_outbound(db, now, rate_limiter, request).await {
        tracing::warn!(%conversation_id, error = %e, "watchdog: failed to enqueue message");
    }
}

async fn set_context_flag(db: &PgPool, conversation_id: Uuid, mut vars: serde_json::Value, key: &str, value: DateTime<Utc>) -> CoreResult<()> {
    if let Some(obj) = vars.as_object_mut() {
        obj.insert(key.to_string(), serde_json::json!(value));
    }
    sqlx::query!(
        "UPDATE conversations SET context_variables = $2, updated_at = now() WHERE id = $1",
        conversation_id,
        vars
    )
    .execute(db)
    .await
    .map_err(CoreError::from)?;
    Ok(())
}

async fn execute_inactivity_action(
    db: &PgPool,
    now: DateTime<Utc>,
    ai: &dyn AiPromptClient,
    rate_limiter: &RateLimiter,
    candidate: &InactivityCandidate,
    policy: &InactivityPolicy,
) -> CoreResult<()> {
    match policy.action {
        InactivityAction::Close => {
            send_watchdog_message(db, now, rate_limiter, candidate.organization_id, candidate.conversation_id, policy.closing_message.clone()).await;
            sqlx::query!(
                "UPDATE conversations SET status = 'closed', is_bot_active = false, flow_cursor_state = 'closed', updated_at = now() WHERE id = $1",
                candidate.conversation_id
            )
            .execute(db)
            .await
            .map_err(CoreError::from)?;
        }
        InactivityAction::Transfer => {
            sqlx::query!(
                "UPDATE conversations SET is_bot_active = false, flow_cursor_state = 'handed_off', updated_at = now() WHERE id = $1",
                candidate.conversation_id
            )
            .execute(db)
            .await
            .map_err(CoreError::from)?;
        }
        InactivityAction::SendReminder => {
            send_watchdog_message(db, now, rate_limiter, candidate.organization_id, candidate.conversation_id, policy.closing_message.clone()).await;
        }
        InactivityAction::FallbackFlow => {
            if let Some(fallback_flow_id) = policy.fallback_flow_id {
                let start_node_id = sqlx::query!(
                    "SELECT id FROM nodes WHERE flow_id = $1 AND node_type = 'start' LIMIT 1",
                    fallback_flow_id
                )
                .fetch_optional(db)
                .await
                .map_err(CoreError::from)?
                .map(|r| r.id);

                sqlx::query!(
                    r#"
                    UPDATE conversations
                    SET active_flow_id = $2, current_node_id = $3, flow_cursor_state = 'running', updated_at = now()
                    WHERE id = $1
                    "#,
                    candidate.conversation_id,
                    fallback_flow_id,
                    start_node_id
                )
                .execute(db)
                .await
                .map_err(CoreError::from)?;

                let (intents, _outcome) = flow_engine::advance_conversation(db, candidate.conversation_id, ai).await?;
                flow_engine::dispatch_intents(db, now, rate_limiter, &intents).await?;
            } else {
                tracing::warn!(conversation_id = %candidate.conversation_id, "watchdog: fallback_flow action with no fallback_flow_id configured");
            }
        }
    }
    Ok(())
}

/// Per spec.md §4.6: the inactivity sweep's warning and action each fire
/// once per inactivity cycle, tracked via reserved `context_variables` keys
/// that `reset_on_inbound`'s caller (C8) implicitly clears by never copying
/// them forward into a fresh cycle — a new inbound message updates
/// `last_user_message_at`, which makes `inactive` small again regardless of
/// whether the flags are still present.
async fn process_inactivity_candidate(
    db: &PgPool,
    now: DateTime<Utc>,
    ai: &dyn AiPromptClient,
    rate_limiter: &RateLimiter,
    candidate: InactivityCandidate,
) -> CoreResult<(bool, bool)> {
    let Some(last_user_message_at) = candidate.last_user_message_at else {
        return Ok((false, false));
    };

    let flow = match candidate.active_flow_id {
        Some(flow_id) => sqlx::query!("SELECT inactivity_settings FROM flows WHERE id = $1", flow_id)
            .fetch_optional(db)
            .await
            .map_err(CoreError::from)?
            .map(|r| r.inactivity_settings),
        None => None,
    };
    let policy = effective_inactivity_policy(&flow.unwrap_or(serde_json::json!({})));
    if !policy.enabled {
        return Ok((false, false));
    }

    let inactive_minutes = (now - last_user_message_at).num_minutes();
    let mut warning_sent = false;
    let mut action_executed = false;

    let warning_already_sent = candidate.context_variables.get(WARNING_SENT_KEY).is_some();
    if inactive_minutes >= policy.send_warning_at_minutes && !warning_already_sent {
        let remaining_minutes = (policy.timeout_minutes - inactive_minutes).max(0);
        let text = replace_message_variables(&policy.warning_message, policy.timeout_minutes, policy.send_warning_at_minutes, inactive_minutes, remaining_minutes);
        send_watchdog_message(db, now, rate_limiter, candidate.organization_id, candidate.conversation_id, text).await;
        set_context_flag(db, candidate.conversation_id, candidate.context_variables.clone(), WARNING_SENT_KEY, now).await?;
        warning_sent = true;
    }

    let action_already_done = candidate.context_variables.get(ACTION_DONE_KEY).is_some();
    if inactive_minutes >= policy.timeout_minutes && !action_already_done {
        execute_inactivity_action(db, now, ai, rate_limiter, &candidate, &policy).await?;
        set_context_flag(db, candidate.conversation_id, candidate.context_variables.clone(), ACTION_DONE_KEY, now).await?;
        action_executed = true;
    }

    Ok((warning_sent, action_executed))
}

struct WindowExpiryCandidate {
    conversation_id: Uuid,
    organization_id: Uuid,
    active_flow_id: Option<Uuid>,
    ends_at: DateTime<Utc>,
    context_variables: serde_json::Value,
}

async fn fetch_window_expiry_candidates(db: &PgPool) -> CoreResult<Vec<WindowExpiryCandidate>> {
    sqlx::query_as!(
        WindowExpiryCandidate,
        r#"
        SELECT c.id as conversation_id, c.organization_id, c.active_flow_id,
               w.ends_at, c.context_variables
        FROM conversations c
        JOIN conversation_windows w ON w.conversation_id = c.id
        WHERE c.is_bot_active = true AND c.status != 'closed' AND c.deleted_at IS NULL AND w.is_active = true
        "#,
    )
    .fetch_all(db)
    .await
    .map_err(CoreError::from)
}

async fn execute_window_expiry_action(
    db: &PgPool,
    now: DateTime<Utc>,
    rate_limiter: &RateLimiter,
    candidate: &WindowExpiryCandidate,
    policy: &WindowExpiryPolicy,
) -> CoreResult<()> {
    match policy.action {
        WindowExpiryAction::Transfer => {
            sqlx::query!(
                "UPDATE conversations SET is_bot_active = false, flow_cursor_state = 'handed_off', updated_at = now() WHERE id = $1",
                candidate.conversation_id
            )
            .execute(db)
            .await
            .map_err(CoreError::from)?;
        }
        WindowExpiryAction::SendTemplate => {
            if let Some(template_name) = policy.template_name.clone() {
                let request = dispatcher::SendRequest {
                    organization_id: candidate.organization_id,
                    conversation_id: candidate.conversation_id,
                    message_type: MessageType::Template,
                    text: None,
                    media_url: None,
                    template_name: Some(template_name),
                    template_language: Some("en_US".to_string()),
                    template_components: Vec::new(),
                };
                if let Err(e) = dispatcher::enqueue_outbound(db, now, rate_limiter, request).await {
                    tracing::warn!(conversation_id = %candidate.conversation_id, error = %e, "watchdog: failed to enqueue expiry template");
                }
            }
        }
        WindowExpiryAction::WaitCustomer => {}
    }
    Ok(())
}

async fn process_window_expiry_candidate(
    db: &PgPool,
    now: DateTime<Utc>,
    rate_limiter: &RateLimiter,
    candidate: WindowExpiryCandidate,
) -> CoreResult<(bool, bool)> {
    let flow = match candidate.active_flow_id {
        Some(flow_id) => sqlx::query!("SELECT window_expiry_settings FROM flows WHERE id = $1", flow_id)
            .fetch_optional(db)
            .await
            .map_err(CoreError::from)?
            .map(|r| r.window_expiry_settings),
        None => None,
    };
    let policy = effective_window_expiry_policy(&flow.unwrap_or(serde_json::json!({})));
    if !policy.enabled {
        return Ok((false, false));
    }

    let remaining_minutes = (candidate.ends_at - now).num_minutes();
    let mut warning_sent = false;
    let mut action_executed = false;

    let warning_already_sent = candidate.context_variables.get(WINDOW_WARNING_SENT_KEY).is_some();
    let warning_threshold_minutes = (policy.warning_at_hours * 60.0) as i64;
    if remaining_minutes >= 0 && remaining_minutes <= warning_threshold_minutes && !warning_already_sent {
        let text = replace_message_variables(&policy.warning_message, 0, 0, 0, remaining_minutes.max(0));
        send_watchdog_message(db, now, rate_limiter, candidate.organization_id, candidate.conversation_id, text).await;
        set_context_flag(db, candidate.conversation_id, candidate.context_variables.clone(), WINDOW_WARNING_SENT_KEY, now).await?;
        warning_sent = true;
    }

    if candidate.ends_at <= now {
        execute_window_expiry_action(db, now, rate_limiter, &candidate, &policy).await?;
        action_executed = true;
    }

    Ok((warning_sent, action_executed))
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct WatchdogStats {
    pub inactivity_warnings_sent: u32,
    pub inactivity_actions_executed: u32,
    pub window_warnings_sent: u32,
    pub window_actions_executed: u32,
    pub windows_closed: u64,
}

/// Both sweeps of a single watchdog tick. Each candidate is processed in
/// its own round trip rather than one giant transaction, so a failure on
/// one conversation logs and the rest still get scanned.
pub async fn watchdog_tick(db: &PgPool, now: DateTime<Utc>, ai: &dyn AiPromptClient, rate_limiter: &RateLimiter) -> CoreResult<WatchdogStats> {
    let mut stats = WatchdogStats::default();

    for candidate in fetch_inactivity_candidates(db).await? {
        let conversation_id = candidate.conversation_id;
        match process_inactivity_candidate(db, now, ai, rate_limiter, candidate).await {
            Ok((warning_sent, action_executed)) => {
                if warning_sent {
                    stats.inactivity_warnings_sent += 1;
                }
                if action_executed {
                    stats.inactivity_actions_executed += 1;
                }
            }
            Err(e) => tracing::error!(%conversation_id, error = %e, "watchdog: inactivity sweep failed for conversation"),
        }
    }

    for candidate in fetch_window_expiry_candidates(db).await? {
        let conversation_id = candidate.conversation_id;
        let organization_id = candidate.organization_id;
        match process_window_expiry_candidate(db, now, rate_limiter, candidate).await {
            Ok((warning_sent, action_executed)) => {
                if warning_sent {
                    stats.window_warnings_sent += 1;
                }
                if action_executed {
                    stats.window_actions_executed += 1;
                }
            }
            Err(e) => tracing::error!(%conversation_id, error = %e, "watchdog: window-expiry sweep failed for conversation"),
        }

        stats.windows_closed += window_engine::close_expired(db, now, organization_id).await?;
    }

    Ok(stats)
}

#[forge::daemon]
pub async fn watchdog(ctx: &DaemonContext) -> Result<()> {
    let store: std::sync::Arc<dyn crate::services::EphemeralStore> = std::sync::Arc::new(
        crate::services::RedisEphemeralStore::connect(
            &ctx.env_parse::<String>("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        )
        .await
        .map_err(|e| ForgeError::Internal(e.to_string()))?,
    );
    let rate_limiter = RateLimiter::new(store);
    let ai = crate::services::RealAiPromptClient::new(
        ctx.env_parse::<String>("OPENROUTER_API_KEY").unwrap_or_default(),
        ctx.env_parse::<String>("OPENROUTER_MODEL").unwrap_or_else(|_| "moonshotai/kimi-k2.5".to_string()),
    )
    .map_err(|e| ForgeError::Internal(e.to_string()))?;
    let poll_ms: u64 = ctx.env_parse("WHATSAPP_CORE_LOOP_POLL_MS_WATCHDOG").unwrap_or(300_000);

    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                match watchdog_tick(ctx.db(), Utc::now(), &ai, &rate_limiter).await {
                    Ok(stats) if stats.inactivity_warnings_sent > 0
                        || stats.inactivity_actions_executed > 0
                        || stats.window_warnings_sent > 0
                        || stats.window_actions_executed > 0 =>
                    {
                        tracing::info!(
                            inactivity_warnings = stats.inactivity_warnings_sent,
                            inactivity_actions = stats.inactivity_actions_executed,
                            window_warnings = stats.window_warnings_sent,
                            window_actions = stats.window_actions_executed,
                            windows_closed = stats.windows_closed,
                            "watchdog tick"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "watchdog tick failed"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge::testing::{IsolatedTestDb, TestDatabase};
    use std::sync::Arc;
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct FakeStore {
        values: AsyncMutex<HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl crate::services::EphemeralStore for FakeStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.values.lock().await.get(key).cloned())
        }
        async fn set_with_ttl(&self, key: &str, value: &str, _ttl: std::time::Duration) -> anyhow::Result<()> {
            self.values.lock().await.insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn set_if_absent(&self, key: &str, value: &str, _ttl: std::time::Duration) -> anyhow::Result<bool> {
            let mut v = self.values.lock().await;
            if v.contains_key(key) {
                Ok(false)
            } else {
                v.insert(key.to_string(), value.to_string());
                Ok(true)
            }
        }
        async fn incr(&self, key: &str) -> anyhow::Result<i64> {
            self.incr_with_ttl(key, std::time::Duration::from_secs(60)).await
        }
        async fn incr_with_ttl(&self, key: &str, _ttl: std::time::Duration) -> anyhow::Result<i64> {
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
        async fn expire(&self, _key: &str, _ttl: std::time::Duration) -> anyhow::Result<()> {
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

    #[test]
    fn replaces_all_four_template_variables() {
        let out = replace_message_variables(
            "timeout={{timeout_minutes}} warn={{warning_at_minutes}} inactive={{inactive_minutes}} remaining={{remaining_minutes}}",
            60,
            50,
            55,
            5,
        );
        assert_eq!(out, "timeout=60 warn=50 inactive=55 remaining=5");
    }

    #[test]
    fn effective_policy_overlays_only_configured_fields() {
        let settings = serde_json::json!({ "timeout_minutes": 30, "action": "transfer" });
        let policy = effective_inactivity_policy(&settings);
        assert_eq!(policy.timeout_minutes, 30);
        assert_eq!(policy.action, InactivityAction::Transfer);
        assert_eq!(policy.send_warning_at_minutes, 50);
    }

    async fn setup() -> (IsolatedTestDb, PgPool) {
        let base = TestDatabase::embedded().await.unwrap();
        let db = base.isolated("watchdog").await.unwrap();
        db.run_sql(
            r#"
            CREATE TABLE organizations (id uuid PRIMARY KEY);

            CREATE TABLE whatsapp_numbers (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                connection_type text NOT NULL DEFAULT 'official'
            );

            CREATE TABLE contacts (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                whatsapp_id text NOT NULL,
                is_blocked bool NOT NULL DEFAULT false
            );

            CREATE TABLE flows (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                chatbot_id uuid NOT NULL,
                canvas_data jsonb NOT NULL DEFAULT '{}'::jsonb,
                variables jsonb NOT NULL DEFAULT '{}'::jsonb,
                inactivity_settings jsonb NOT NULL DEFAULT '{}'::jsonb,
                window_expiry_settings jsonb NOT NULL DEFAULT '{}'::jsonb
            );

            CREATE TABLE nodes (id uuid PRIMARY KEY, flow_id uuid NOT NULL, node_type text NOT NULL, data jsonb NOT NULL DEFAULT '{}'::jsonb);

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
                flow_cursor_state text NOT NULL DEFAULT 'running',
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
            "#,
        )
        .await
        .unwrap();
        let pool = db.pool().clone();
        (db, pool)
    }

    #[tokio::test]
    async fn inactivity_timeout_with_transfer_action_hands_off_conversation() {
        let (_db, pool) = setup().await;
        let now = Utc::now();
        let organization_id = Uuid::new_v4();
        let number_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        let flow_id = Uuid::new_v4();

        sqlx::query!("INSERT INTO organizations (id) VALUES ($1)", organization_id)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query!(
            "INSERT INTO whatsapp_numbers (id, organization_id) VALUES ($1, $2)",
            number_id,
            organization_id
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            "INSERT INTO contacts (id, organization_id, whatsapp_id) VALUES ($1, $2, '15550005555')",
            contact_id,
            organization_id
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            "INSERT INTO flows (id, organization_id, chatbot_id, inactivity_settings) VALUES ($1, $2, $3, $4)",
            flow_id,
            organization_id,
            Uuid::new_v4(),
            serde_json::json!({ "timeout_minutes": 30, "send_warning_at_minutes": 20, "action": "transfer" })
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            r#"
            INSERT INTO conversations
                (id, organization_id, contact_id, whatsapp_number_id, is_bot_active, active_flow_id, last_user_message_at)
            VALUES ($1, $2, $3, $4, true, $5, $6)
            "#,
            conversation_id,
            organization_id,
            contact_id,
            number_id,
            flow_id,
            now - ChronoDuration::minutes(45)
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query!(
            r#"
            INSERT INTO conversation_windows (organization_id, conversation_id, started_at, ends_at)
            VALUES ($1, $2, $3, $4)
            "#,
            organization_id,
            conversation_id,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(23)
        )
        .execute(&pool)
        .await
        .unwrap();

        let rate_limiter = RateLimiter::new(Arc::new(FakeStore::default()));
        let ai = UnusedAi;

        let stats = watchdog_tick(&pool, now, &ai, &rate_limiter).await.unwrap();
        assert_eq!(stats.inactivity_warnings_sent, 1);
        assert_eq!(stats.inactivity_actions_executed, 1);

        let row = sqlx::query!("SELECT is_bot_active, flow_cursor_state FROM conversations WHERE id = $1", conversation_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(!row.is_bot_active);
        assert_eq!(row.flow_cursor_state, "handed_off");

        // second tick with the same state is a no-op: flags already set.
        let stats2 = watchdog_tick(&pool, now, &ai, &rate_limiter).await.unwrap();
        assert_eq!(stats2.inactivity_warnings_sent, 0);
        assert_eq!(stats2.inactivity_actions_executed, 0);
    }
}
