use std::sync::Arc;

use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreError;
use crate::functions::dispatcher::{self, SendRequest};
use crate::schema::{CanvasData, ConnectionType, FlowCursorState, MessageType, NodeType};
use crate::services::{AiPromptClient, RateLimiter};

/// A node's effect on the interpreter: either move the cursor forward, block
/// waiting on the customer, hand the conversation off, or close the flow.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Advance(Option<Uuid>),
    AwaitUser,
    HandedOff,
    Closed,
}

/// One outbound message the interpreter wants sent; C7 turns this into a
/// Message row. Kept separate from persistence so node handlers stay pure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageIntent {
    pub conversation_id: Uuid,
    pub message_type: MessageType,
    pub text: Option<String>,
    pub media_url: Option<String>,
}

struct ConversationRow {
    id: Uuid,
    organization_id: Uuid,
    whatsapp_number_id: Uuid,
    active_flow_id: Option<Uuid>,
    current_node_id: Option<Uuid>,
    context_variables: serde_json::Value,
}

struct NodeRow {
    id: Uuid,
    flow_id: Uuid,
    node_type: NodeType,
    data: serde_json::Value,
}

struct FlowRow {
    id: Uuid,
    canvas_data: serde_json::Value,
    fallback_flow_id: Option<Uuid>,
    variables: serde_json::Value,
}

/// Substitutes `{{name}}` placeholders against the merged variable map
/// (global ∪ flow ∪ conversation, later sources win). Undefined placeholders
/// render as empty string.
pub fn interpolate(template: &str, variables: &serde_json::Value) -> String {
    interpolate_checked(template, variables).0
}

/// Same substitution as `interpolate`, but also reports whether any
/// placeholder had no matching entry in `variables` — callers that need to
/// distinguish "genuinely empty" from "undefined" (condition evaluation)
/// use this instead of the empty-string-only `interpolate`.
pub fn interpolate_checked(template: &str, variables: &serde_json::Value) -> (String, bool) {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut missing = false;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_start = &rest[start + 2..];
        let Some(end) = after_start.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after_start[..end].trim();
        let value = variables
            .get(name)
            .map(value_to_plain_string)
            .unwrap_or_default();
        if variables.get(name).is_none() {
            missing = true;
            tracing::warn!(variable = name, "flow_engine: undefined variable in template");
        }
        out.push_str(&value);
        rest = &after_start[end + 2..];
    }
    out.push_str(rest);
    (out, missing)
}

fn value_to_plain_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn merge_variables(
    global: &serde_json::Value,
    flow: &serde_json::Value,
    conversation: &serde_json::Value,
) -> serde_json::Value {
    let mut merged = serde_json::Map::new();
    for source in [global, flow, conversation] {
        if let Some(obj) = source.as_object() {
            for (k, v) in obj {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    serde_json::Value::Object(merged)
}

#[derive(Debug, Clone, PartialEq)]
enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

fn parse_condition_op(raw: &str) -> Option<ConditionOp> {
    match raw {
        "==" => Some(ConditionOp::Eq),
        "!=" => Some(ConditionOp::Ne),
        ">" => Some(ConditionOp::Gt),
        ">=" => Some(ConditionOp::Gte),
        "<" => Some(ConditionOp::Lt),
        "<=" => Some(ConditionOp::Lte),
        "contains" => Some(ConditionOp::Contains),
        _ => None,
    }
}

/// Evaluates `{{var}} OP literal` against the merged variable map. Unknown
/// operators or missing variables route to the `default` edge (handled by
/// the caller); this only ever returns a definitive true/false.
fn evaluate_condition(left: &str, op: &ConditionOp, right: &str) -> bool {
    match op {
        ConditionOp::Eq => left == right,
        ConditionOp::Ne => left != right,
        ConditionOp::Contains => left.contains(right),
        ConditionOp::Gt | ConditionOp::Gte | ConditionOp::Lt | ConditionOp::Lte => {
            let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) else {
                return false;
            };
            match op {
                ConditionOp::Gt => l > r,
                ConditionOp::Gte => l >= r,
                ConditionOp::Lt => l < r,
                ConditionOp::Lte => l <= r,
                _ => unreachable!(),
            }
        }
    }
}

struct JumpToFlowData {
    target_flow_id: Uuid,
    pass_variables: bool,
    variable_mapping: Option<serde_json::Map<String, serde_json::Value>>,
}

fn parse_jump_to_flow(data: &serde_json::Value) -> Option<JumpToFlowData> {
    let target_flow_id = data.get("target_flow_id")?.as_str()?.parse().ok()?;
    let pass_variables = data.get("pass_variables").and_then(|v| v.as_bool()).unwrap_or(false);
    let variable_mapping = data
        .get("variable_mapping")
        .and_then(|v| v.as_object())
        .cloned();
    Some(JumpToFlowData {
        target_flow_id,
        pass_variables,
        variable_mapping,
    })
}

/// Mirrors `_extract_source_variables`: with no mapping the full current
/// variable map passes through; with a mapping, each target name is filled
/// from a `{{source}}` lookup or a literal value, and unmapped keys drop.
fn extract_source_variables(jump: &JumpToFlowData, context_variables: &serde_json::Value) -> serde_json::Value {
    if !jump.pass_variables {
        return serde_json::json!({});
    }

    let Some(mapping) = &jump.variable_mapping else {
        return context_variables.clone();
    };

    let mut out = serde_json::Map::new();
    for (target, source_expr) in mapping {
        if let Some(expr) = source_expr.as_str() {
            if let Some(name) = expr.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
                if let Some(value) = context_variables.get(name.trim()) {
                    out.insert(target.clone(), value.clone());
                }
                continue;
            }
        }
        out.insert(target.clone(), source_expr.clone());
    }
    serde_json::Value::Object(out)
}

async fn fetch_conversation(db: &PgPool, conversation_id: Uuid) -> CoreResult<ConversationRow> {
    sqlx::query_as!(
        ConversationRow,
        r#"
        SELECT id, organization_id, whatsapp_number_id, active_flow_id, current_node_id, context_variables
        FROM conversations
        WHERE id = $1
        FOR UPDATE
        "#,
        conversation_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("conversation {conversation_id}")))
}

async fn fetch_node(db: &PgPool, node_id: Uuid) -> CoreResult<NodeRow> {
    sqlx::query_as!(
        NodeRow,
        r#"SELECT id, flow_id, node_type as "node_type: NodeType", data FROM nodes WHERE id = $1"#,
        node_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("node {node_id}")))
}

async fn fetch_flow(db: &PgPool, flow_id: Uuid) -> CoreResult<FlowRow> {
    sqlx::query_as!(
        FlowRow,
        r#"SELECT id, canvas_data, fallback_flow_id, variables FROM flows WHERE id = $1 AND deleted_at IS NULL"#,
        flow_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("flow {flow_id}")))
}

/// Looks up the global_variables blob for the organization that owns a flow,
/// the outermost layer of the `{{var}}` merge order.
async fn fetch_global_variables(db: &PgPool, organization_id: Uuid) -> CoreResult<serde_json::Value> {
    let row = sqlx::query!(
        "SELECT global_variables FROM organizations WHERE id = $1",
        organization_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("organization {organization_id}")))?;
    Ok(row.global_variables)
}

async fn start_node_of(db: &PgPool, flow_id: Uuid) -> CoreResult<Option<Uuid>> {
    let row = sqlx::query!(
        r#"SELECT id FROM nodes WHERE flow_id = $1 AND node_type = 'start' LIMIT 1"#,
        flow_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?;
    Ok(row.map(|r| r.id))
}

/// Executes `jump_to_flow`: resolves the target, atomically updates the
/// conversation's cursor and variables in one transaction.
async fn handle_jump_to_flow(
    db: &PgPool,
    conversation: &ConversationRow,
    node: &NodeRow,
) -> CoreResult<NodeOutcome> {
    let jump = parse_jump_to_flow(&node.data)
        .ok_or_else(|| CoreError::Validation(format!("node {} missing target_flow_id", node.id)))?;

    let target_flow = fetch_flow(db, jump.target_flow_id).await?;
    let start_node_id = start_node_of(db, target_flow.id).await?;
    let source_variables = extract_source_variables(&jump, &conversation.context_variables);

    let merged_variables = if jump.pass_variables {
        source_variables
    } else {
        conversation.context_variables.clone()
    };

    sqlx::query!(
        r#"
        UPDATE conversations
        SET active_flow_id = $2, current_node_id = $3, context_variables = $4,
            flow_cursor_state = 'running', updated_at = now()
        WHERE id = $1
        "#,
        conversation.id,
        target_flow.id,
        start_node_id,
        merged_variables
    )
    .execute(db)
    .await
    .map_err(CoreError::from)?;

    Ok(NodeOutcome::Advance(start_node_id))
}

async fn handle_condition(
    node: &NodeRow,
    canvas: &CanvasData,
    variables: &serde_json::Value,
) -> CoreResult<NodeOutcome> {
    let left_template = node.data.get("left").and_then(|v| v.as_str()).unwrap_or("");
    let op_raw = node.data.get("operator").and_then(|v| v.as_str()).unwrap_or("");
    let right_template = node.data.get("right").and_then(|v| v.as_str()).unwrap_or("");

    let label = match parse_condition_op(op_raw) {
        Some(op) => {
            let (left, left_missing) = interpolate_checked(left_template, variables);
            let (right, right_missing) = interpolate_checked(right_template, variables);
            if left_missing || right_missing {
                "default"
            } else if evaluate_condition(&left, &op, &right) {
                "true"
            } else {
                "false"
            }
        }
        None => "default",
    };

    match canvas
        .successor(node.id, Some(label))
        .or_else(|| canvas.default_successor(node.id))
    {
        Some(next) => Ok(NodeOutcome::Advance(Some(next))),
        None => Err(CoreError::Internal(format!(
            "condition node {} has no matching or default edge",
            node.id
        ))),
    }
}

async fn handle_api_call(
    db: &PgPool,
    conversation: &ConversationRow,
    node: &NodeRow,
    canvas: &CanvasData,
    variables: &serde_json::Value,
) -> CoreResult<NodeOutcome> {
    let url = interpolate(
        node.data.get("url").and_then(|v| v.as_str()).unwrap_or(""),
        variables,
    );
    let method = node.data.get("method").and_then(|v| v.as_str()).unwrap_or("GET").to_string();
    let timeout_secs = node.data.get("timeout_seconds").and_then(|v| v.as_u64()).unwrap_or(30);
    let output_variable = node.data.get("output_variable").and_then(|v| v.as_str());

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let request = client.request(
        method.parse().unwrap_or(reqwest::Method::GET),
        &url,
    );

    let result: anyhow::Result<serde_json::Value> = async {
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("api_call node got status {}", response.status());
        }
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }
    .await;

    match result {
        Ok(body) => {
            if let Some(var) = output_variable {
                let mut vars = conversation.context_variables.clone();
                if let Some(obj) = vars.as_object_mut() {
                    obj.insert(var.to_string(), body);
                }
                sqlx::query!(
                    "UPDATE conversations SET context_variables = $2, updated_at = now() WHERE id = $1",
                    conversation.id,
                    vars
                )
                .execute(db)
                .await
                .map_err(CoreError::from)?;
            }
            match canvas.default_successor(node.id) {
                Some(next) => Ok(NodeOutcome::Advance(Some(next))),
                None => Ok(NodeOutcome::Advance(None)),
            }
        }
        Err(e) => {
            tracing::warn!(node_id = %node.id, error = %e, "api_call node failed");
            match canvas.successor(node.id, Some("error")) {
                Some(next) => Ok(NodeOutcome::Advance(Some(next))),
                None => Err(CoreError::UpstreamTransient(e.to_string())),
            }
        }
    }
}

async fn handle_ai_prompt(
    db: &PgPool,
    conversation: &ConversationRow,
    node: &NodeRow,
    canvas: &CanvasData,
    variables: &serde_json::Value,
    ai: &dyn AiPromptClient,
) -> CoreResult<NodeOutcome> {
    let prompt = interpolate(
        node.data.get("prompt").and_then(|v| v.as_str()).unwrap_or(""),
        variables,
    );
    let output_variable = node
        .data
        .get("output_variable")
        .and_then(|v| v.as_str())
        .unwrap_or("ai_response");

    match ai.complete(&prompt).await {
        Ok(completion) => {
            let mut vars = conversation.context_variables.clone();
            if let Some(obj) = vars.as_object_mut() {
                obj.insert(output_variable.to_string(), serde_json::json!(completion));
            }
            sqlx::query!(
                "UPDATE conversations SET context_variables = $2, updated_at = now() WHERE id = $1",
                conversation.id,
                vars
            )
            .execute(db)
            .await
            .map_err(CoreError::from)?;

            Ok(NodeOutcome::Advance(canvas.default_successor(node.id)))
        }
        Err(e) => {
            tracing::warn!(node_id = %node.id, error = %e, "ai_prompt node failed");
            match canvas.successor(node.id, Some("error")) {
                Some(next) => Ok(NodeOutcome::Advance(Some(next))),
                None => Err(CoreError::UpstreamTransient(e.to_string())),
            }
        }
    }
}

async fn handle_handoff(db: &PgPool, conversation: &ConversationRow, node: &NodeRow) -> CoreResult<NodeOutcome> {
    let department_id: Option<Uuid> = node
        .data
        .get("department_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok());

    sqlx::query!(
        r#"
        UPDATE conversations
        SET is_bot_active = false, flow_cursor_state = 'handed_off',
            status = 'queued', department_id = $2, updated_at = now()
        WHERE id = $1
        "#,
        conversation.id,
        department_id
    )
    .execute(db)
    .await
    .map_err(CoreError::from)?;

    Ok(NodeOutcome::HandedOff)
}

async fn handle_end(db: &PgPool, conversation: &ConversationRow, node: &NodeRow) -> CoreResult<NodeOutcome> {
    let close_conversation = node.data.get("close_conversation").and_then(|v| v.as_bool()).unwrap_or(false);

    if close_conversation {
        sqlx::query!(
            r#"
            UPDATE conversations
            SET status = 'closed', flow_cursor_state = 'closed', current_node_id = NULL, updated_at = now()
            WHERE id = $1
            "#,
            conversation.id
        )
        .execute(db)
        .await
        .map_err(CoreError::from)?;
    } else {
        sqlx::query!(
            r#"
            UPDATE conversations
            SET flow_cursor_state = 'closed', current_node_id = NULL, updated_at = now()
            WHERE id = $1
            "#,
            conversation.id
        )
        .execute(db)
        .await
        .map_err(CoreError::from)?;
    }

    Ok(NodeOutcome::Closed)
}

/// Turns the message intents a node walk emitted into enqueued outbound
/// messages. A failed enqueue (closed window, exhausted rate limit) is
/// logged and skipped rather than aborting the rest of the batch — the
/// conversation's cursor has already moved on regardless of whether C7
/// could accept every intent.
pub(crate) async fn dispatch_intents(
    db: &PgPool,
    now: DateTime<Utc>,
    rate_limiter: &RateLimiter,
    intents: &[MessageIntent],
) -> CoreResult<()> {
    let Some(first) = intents.first() else {
        return Ok(());
    };
    let organization_id = sqlx::query!(
        "SELECT organization_id FROM conversations WHERE id = $1",
        first.conversation_id
    )
    .fetch_one(db)
    .await
    .map_err(CoreError::from)?
    .organization_id;

    for intent in intents {
        let request = SendRequest {
            organization_id,
            conversation_id: intent.conversation_id,
            message_type: intent.message_type,
            text: intent.text.clone(),
            media_url: intent.media_url.clone(),
            template_name: None,
            template_language: None,
            template_components: Vec::new(),
        };

        if let Err(e) = dispatcher::enqueue_outbound(db, now, rate_limiter, request).await {
            tracing::error!(
                conversation_id = %intent.conversation_id,
                error = %e,
                "flow_engine: failed to enqueue node-emitted message"
            );
        }
    }
    Ok(())
}

/// Advances a conversation's cursor by executing its current node. `ai` is
/// only consulted for `ai_prompt` nodes. Returns the message intents emitted
/// along the way (C7 is responsible for actually dispatching them) and the
/// final outcome once the interpreter either blocks, hands off, closes, or
/// runs out of eagerly-advanceable nodes.
pub async fn advance_conversation(
    db: &PgPool,
    conversation_id: Uuid,
    ai: &dyn AiPromptClient,
) -> CoreResult<(Vec<MessageIntent>, NodeOutcome)> {
    let mut intents = Vec::new();
    let mut conversation = fetch_conversation(db, conversation_id).await?;

    let Some(mut node_id) = conversation.current_node_id else {
        return Ok((intents, NodeOutcome::Closed));
    };

    // bound the number of nodes walked in a single tick so a cyclic graph
    // authored without a blocking node cannot spin the daemon forever.
    for _ in 0..64 {
        let node = fetch_node(db, node_id).await?;
        let flow = fetch_flow(db, node.flow_id).await?;
        let canvas = CanvasData::from_json(&flow.canvas_data);
        let global_variables = fetch_global_variables(db, conversation.organization_id).await?;
        let variables = merge_variables(&global_variables, &flow.variables, &conversation.context_variables);

        let outcome = match node.node_type {
            NodeType::Start => Ok(NodeOutcome::Advance(canvas.default_successor(node.id))),
            NodeType::Message => {
                let text = interpolate(
                    node.data.get("text").and_then(|v| v.as_str()).unwrap_or(""),
                    &variables,
                );
                intents.push(MessageIntent {
                    conversation_id,
                    message_type: MessageType::Text,
                    text: Some(text),
                    media_url: node.data.get("media_url").and_then(|v| v.as_str()).map(String::from),
                });
                Ok(NodeOutcome::Advance(canvas.default_successor(node.id)))
            }
            NodeType::Question => {
                let text = interpolate(
                    node.data.get("text").and_then(|v| v.as_str()).unwrap_or(""),
                    &variables,
                );
                intents.push(MessageIntent {
                    conversation_id,
                    message_type: MessageType::Text,
                    text: Some(text),
                    media_url: None,
                });
                Ok(NodeOutcome::AwaitUser)
            }
            NodeType::InteractiveButtons | NodeType::InteractiveList => {
                let numbers = sqlx::query!(
                    "SELECT connection_type as \"connection_type: ConnectionType\" FROM whatsapp_numbers WHERE id = $1",
                    conversation.whatsapp_number_id
                )
                .fetch_optional(db)
                .await
                .map_err(CoreError::from)?;

                if !matches!(numbers.map(|n| n.connection_type), Some(ConnectionType::Official)) {
                    Err(CoreError::Validation(
                        "interactive nodes require an official-channel number".to_string(),
                    ))
                } else {
                    let text = interpolate(
                        node.data.get("text").and_then(|v| v.as_str()).unwrap_or(""),
                        &variables,
                    );
                    intents.push(MessageIntent {
                        conversation_id,
                        message_type: MessageType::Interactive,
                        text: Some(text),
                        media_url: None,
                    });
                    Ok(NodeOutcome::AwaitUser)
                }
            }
            NodeType::Condition => handle_condition(&node, &canvas, &variables).await,
            NodeType::ApiCall => handle_api_call(db, &conversation, &node, &canvas, &variables).await,
            NodeType::AiPrompt => handle_ai_prompt(db, &conversation, &node, &canvas, &variables, ai).await,
            NodeType::JumpToFlow => handle_jump_to_flow(db, &conversation, &node).await,
            NodeType::Handoff => handle_handoff(db, &conversation, &node).await,
            NodeType::End => handle_end(db, &conversation, &node).await,
            NodeType::Action => Ok(NodeOutcome::Advance(canvas.default_successor(node.id))),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(node_id = %node.id, error = %e, "flow_engine: node failed, routing to fallback");
                match flow.fallback_flow_id {
                    Some(fallback_id) => {
                        let start = start_node_of(db, fallback_id).await?;
                        sqlx::query!(
                            "UPDATE conversations SET active_flow_id = $2, current_node_id = $3, updated_at = now() WHERE id = $1",
                            conversation_id,
                            fallback_id,
                            start
                        )
                        .execute(db)
                        .await
                        .map_err(CoreError::from)?;
                        NodeOutcome::Advance(start)
                    }
                    None => {
                        handle_handoff(db, &conversation, &node).await?;
                        NodeOutcome::HandedOff
                    }
                }
            }
        };

        match outcome {
            NodeOutcome::Advance(Some(next)) => {
                sqlx::query!(
                    "UPDATE conversations SET current_node_id = $2, updated_at = now() WHERE id = $1",
                    conversation_id,
                    next
                )
                .execute(db)
                .await
                .map_err(CoreError::from)?;
                conversation = fetch_conversation(db, conversation_id).await?;
                node_id = next;
                continue;
            }
            NodeOutcome::Advance(None) => {
                sqlx::query!(
                    "UPDATE conversations SET current_node_id = NULL, flow_cursor_state = 'closed', updated_at = now() WHERE id = $1",
                    conversation_id
                )
                .execute(db)
                .await
                .map_err(CoreError::from)?;
                return Ok((intents, NodeOutcome::Closed));
            }
            terminal => {
                let next_cursor_state = match terminal {
                    NodeOutcome::AwaitUser => FlowCursorState::AwaitingUser,
                    NodeOutcome::HandedOff => FlowCursorState::HandedOff,
                    _ => FlowCursorState::Closed,
                };
                sqlx::query!(
                    "UPDATE conversations SET flow_cursor_state = $2, updated_at = now() WHERE id = $1",
                    conversation_id,
                    next_cursor_state
                )
                .execute(db)
                .await
                .map_err(CoreError::from)?;
                return Ok((intents, terminal));
            }
        }
    }

    Err(CoreError::Internal(format!(
        "conversation {conversation_id} exceeded node walk budget; possible cyclic flow"
    )))
}

pub struct FlowEngineDeps {
    pub ai: Arc<dyn AiPromptClient>,
    pub rate_limiter: RateLimiter,
}

pub async fn flow_engine_tick(db: &PgPool, now: DateTime<Utc>, deps: &FlowEngineDeps) -> CoreResult<u32> {
    let runnable = sqlx::query!(
        r#"
        SELECT id FROM conversations
        WHERE flow_cursor_state = 'running' AND current_node_id IS NOT NULL
        ORDER BY updated_at
        LIMIT 20
        FOR UPDATE SKIP LOCKED
        "#
    )
    .fetch_all(db)
    .await
    .map_err(CoreError::from)?;

    let mut processed = 0u32;
    for row in runnable {
        match advance_conversation(db, row.id, deps.ai.as_ref()).await {
            Ok((intents, outcome)) => {
                dispatch_intents(db, now, &deps.rate_limiter, &intents).await?;
                tracing::info!(conversation_id = %row.id, intents = intents.len(), ?outcome, "flow_engine tick");
                processed += 1;
            }
            Err(e) => tracing::error!(conversation_id = %row.id, error = %e, "flow_engine tick failed"),
        }
    }

    Ok(processed)
}

#[forge::daemon]
pub async fn flow_engine(ctx: &DaemonContext) -> Result<()> {
    let api_key = ctx.env_parse::<String>("OPENROUTER_API_KEY").unwrap_or_default();
    let model = ctx
        .env_parse::<String>("OPENROUTER_MODEL")
        .unwrap_or_else(|_| "moonshotai/kimi-k2.5".to_string());
    let ai: Arc<dyn AiPromptClient> = Arc::new(
        crate::services::RealAiPromptClient::new(api_key, model)
            .map_err(|e| ForgeError::Internal(e.to_string()))?,
    );
    let store: Arc<dyn crate::services::EphemeralStore> = Arc::new(
        crate::services::RedisEphemeralStore::connect(
            &ctx.env_parse::<String>("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        )
        .await
        .map_err(|e| ForgeError::Internal(e.to_string()))?,
    );
    let deps = FlowEngineDeps { ai, rate_limiter: RateLimiter::new(store) };
    let poll_ms: u64 = ctx.env_parse("WHATSAPP_CORE_LOOP_POLL_MS_FLOW_ENGINE").unwrap_or(500);

    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                match flow_engine_tick(ctx.db(), Utc::now(), &deps).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "flow_engine tick"),
                    Err(e) => tracing::error!(error = %e, "flow_engine tick failed"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Serialize)]
pub struct FlowAdvanceResult {
    pub messages_queued: usize,
    pub outcome: String,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceConversationInput {
    pub conversation_id: Uuid,
}

/// Manually kicks the interpreter for one conversation, used by the admin
/// surface to unstick a flow without waiting for the daemon's next tick.
#[forge::mutation(public)]
pub async fn trigger_flow_advance(
    ctx: &MutationContext,
    input: AdvanceConversationInput,
) -> Result<FlowAdvanceResult> {
    let api_key = ctx.env_parse::<String>("OPENROUTER_API_KEY").unwrap_or_default();
    let model = ctx
        .env_parse::<String>("OPENROUTER_MODEL")
        .unwrap_or_else(|_| "moonshotai/kimi-k2.5".to_string());
    let ai = crate::services::RealAiPromptClient::new(api_key, model).map_err(|e| ForgeError::Internal(e.to_string()))?;

    let (intents, outcome) = advance_conversation(ctx.db(), input.conversation_id, &ai)
        .await
        .map_err(ForgeError::from)?;

    let store: Arc<dyn crate::services::EphemeralStore> = Arc::new(
        crate::services::RedisEphemeralStore::connect(
            &ctx.env_parse::<String>("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        )
        .await
        .map_err(|e| ForgeError::Internal(e.to_string()))?,
    );
    let rate_limiter = RateLimiter::new(store);
    dispatch_intents(ctx.db(), Utc::now(), &rate_limiter, &intents)
        .await
        .map_err(ForgeError::from)?;

    Ok(FlowAdvanceResult {
        messages_queued: intents.len(),
        outcome: format!("{outcome:?}"),
    })
}
