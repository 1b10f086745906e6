use forge::prelude::*;
use uuid::Uuid;

use crate::schema::{AdminAction, Direction, Event, Message, MessageStatus, MessageType, SenderType};

#[derive(Debug, Deserialize)]
pub struct ListEventsInput {
    pub conversation_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[forge::query(public)]
pub async fn list_events(ctx: &QueryContext, input: ListEventsInput) -> Result<Vec<Event>> {
    let limit = input.limit.unwrap_or(100).min(500);

    if let Some(conversation_id) = input.conversation_id {
        sqlx::query_as!(
            Event,
            r#"
            SELECT id, trace_id, source, action, payload, created_at
            FROM events
            WHERE (payload ->> 'conversation_id')::uuid = $1
            ORDER BY created_at, id
            LIMIT $2
            "#,
            conversation_id,
            limit
        )
        .fetch_all(ctx.db())
        .await
        .map_err(|e| ForgeError::Database(e.to_string()))
    } else {
        sqlx::query_as!(
            Event,
            r#"
            SELECT id, trace_id, source, action, payload, created_at
            FROM events
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
            limit
        )
        .fetch_all(ctx.db())
        .await
        .map_err(|e| ForgeError::Database(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesInput {
    pub conversation_id: Uuid,
    pub limit: Option<i64>,
}

#[forge::query(public)]
pub async fn list_messages(ctx: &QueryContext, input: ListMessagesInput) -> Result<Vec<Message>> {
    let limit = input.limit.unwrap_or(100).min(500);

    sqlx::query_as!(
        Message,
        r#"
        SELECT id, organization_id, conversation_id,
               direction as "direction: Direction", sender_type as "sender_type: SenderType",
               message_type as "message_type: MessageType", content, status as "status: MessageStatus",
               upstream_message_id, error_code, error_message, attempt_count,
               next_attempt_at, trace_id, created_at, updated_at
        FROM messages
        WHERE conversation_id = $1
        ORDER BY created_at, id
        LIMIT $2
        "#,
        input.conversation_id,
        limit
    )
    .fetch_all(ctx.db())
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ListAdminActionsInput {
    pub conversation_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[forge::query(public)]
pub async fn list_admin_actions(ctx: &QueryContext, input: ListAdminActionsInput) -> Result<Vec<AdminAction>> {
    let limit = input.limit.unwrap_or(50).min(200);

    if let Some(conversation_id) = input.conversation_id {
        sqlx::query_as!(
            AdminAction,
            r#"
            SELECT id, organization_id, conversation_id, action, actor, reason, payload, created_at
            FROM admin_actions
            WHERE conversation_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            conversation_id,
            limit
        )
        .fetch_all(ctx.db())
        .await
        .map_err(|e| ForgeError::Database(e.to_string()))
    } else {
        sqlx::query_as!(
            AdminAction,
            r#"
            SELECT id, organization_id, conversation_id, action, actor, reason, payload, created_at
            FROM admin_actions
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
            limit
        )
        .fetch_all(ctx.db())
        .await
        .map_err(|e| ForgeError::Database(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
pub struct HealthView {
    pub pending_messages: i64,
    pub failed_messages: i64,
    pub stuck_messages: i64,
    pub open_conversations: i64,
    pub handed_off_conversations: i64,
}

#[forge::query(public)]
pub async fn get_health(ctx: &QueryContext, _input: GetHealthInput) -> Result<HealthView> {
    let messages = sqlx::query!(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'pending') as "pending!",
            COUNT(*) FILTER (WHERE status = 'failed') as "failed!",
            COUNT(*) FILTER (WHERE status = 'pending' AND next_attempt_at < now() - interval '30 minutes') as "stuck!"
        FROM messages
        WHERE direction = 'outbound'
        "#
    )
    .fetch_one(ctx.db())
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))?;

    let conversations = sqlx::query!(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status != 'closed') as "open!",
            COUNT(*) FILTER (WHERE flow_cursor_state = 'handed_off') as "handed_off!"
        FROM conversations
        WHERE deleted_at IS NULL
        "#
    )
    .fetch_one(ctx.db())
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))?;

    Ok(HealthView {
        pending_messages: messages.pending,
        failed_messages: messages.failed,
        stuck_messages: messages.stuck,
        open_conversations: conversations.open,
        handed_off_conversations: conversations.handed_off,
    })
}

#[derive(Debug, Deserialize)]
pub struct GetHealthInput {}

#[derive(Debug, Deserialize)]
pub struct ForceCloseConversationInput {
    pub conversation_id: Uuid,
    pub actor: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ForceCloseConversationOutput {
    pub closed: bool,
}

/// Operator override: closes a conversation regardless of flow or window
/// state and records the override alongside the window-extend audit trail.
#[forge::mutation(public)]
pub async fn force_close_conversation(ctx: &MutationContext, input: ForceCloseConversationInput) -> Result<ForceCloseConversationOutput> {
    let db = ctx.db();

    let row = sqlx::query!("SELECT organization_id FROM conversations WHERE id = $1", input.conversation_id)
        .fetch_optional(db)
        .await
        .map_err(|e| ForgeError::Database(e.to_string()))?;
    let Some(row) = row else {
        return Ok(ForceCloseConversationOutput { closed: false });
    };

    let result = sqlx::query!(
        r#"
        UPDATE conversations
        SET status = 'closed', is_bot_active = false, flow_cursor_state = 'closed', updated_at = now()
        WHERE id = $1 AND status != 'closed'
        "#,
        input.conversation_id
    )
    .execute(db)
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))?;

    if result.rows_affected() > 0 {
        sqlx::query!(
            r#"
            INSERT INTO admin_actions (id, organization_id, conversation_id, action, actor, reason, payload)
            VALUES ($1, $2, $3, 'force_close', $4, $5, '{}'::jsonb)
            "#,
            Uuid::new_v4(),
            row.organization_id,
            input.conversation_id,
            input.actor,
            input.reason
        )
        .execute(db)
        .await
        .map_err(|e| ForgeError::Database(e.to_string()))?;
    }

    Ok(ForceCloseConversationOutput {
        closed: result.rows_affected() > 0,
    })
}

#[derive(Debug, Deserialize)]
pub struct ReassignConversationInput {
    pub conversation_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub actor: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReassignConversationOutput {
    pub reassigned: bool,
}

/// Operator override: hands a conversation to a specific agent/department
/// and turns the bot off for it, the same transition the watchdog's
/// `transfer` action performs automatically.
#[forge::mutation(public)]
pub async fn reassign_conversation(ctx: &MutationContext, input: ReassignConversationInput) -> Result<ReassignConversationOutput> {
    let db = ctx.db();

    let row = sqlx::query!("SELECT organization_id FROM conversations WHERE id = $1", input.conversation_id)
        .fetch_optional(db)
        .await
        .map_err(|e| ForgeError::Database(e.to_string()))?;
    let Some(row) = row else {
        return Ok(ReassignConversationOutput { reassigned: false });
    };

    let result = sqlx::query!(
        r#"
        UPDATE conversations
        SET current_agent_id = $2, department_id = $3, is_bot_active = false,
            flow_cursor_state = 'handed_off', updated_at = now()
        WHERE id = $1
        "#,
        input.conversation_id,
        input.agent_id,
        input.department_id
    )
    .execute(db)
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))?;

    sqlx::query!(
        r#"
        INSERT INTO admin_actions (id, organization_id, conversation_id, action, actor, reason, payload)
        VALUES ($1, $2, $3, 'reassign', $4, $5, $6)
        "#,
        Uuid::new_v4(),
        row.organization_id,
        input.conversation_id,
        input.actor,
        input.reason,
        serde_json::json!({ "agent_id": input.agent_id, "department_id": input.department_id })
    )
    .execute(db)
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))?;

    Ok(ReassignConversationOutput {
        reassigned: result.rows_affected() > 0,
    })
}
