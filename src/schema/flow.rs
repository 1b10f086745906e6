use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Flow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub chatbot_id: Uuid,
    pub name: String,
    pub is_main: bool,
    pub variables: serde_json::Value,
    /// Per-flow inactivity policy overlaying the watchdog's global defaults.
    pub inactivity_settings: serde_json::Value,
    /// Per-flow window-expiry warning/terminal-action policy.
    pub window_expiry_settings: serde_json::Value,
    pub fallback_flow_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[forge::forge_enum]
pub enum NodeType {
    Start,
    Message,
    Question,
    Condition,
    Action,
    ApiCall,
    AiPrompt,
    JumpToFlow,
    Handoff,
    End,
    InteractiveButtons,
    InteractiveList,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct Node {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub node_type: NodeType,
    /// Type-specific payload; see `node_data` for the typed projection of
    /// this blob used by the interpreter.
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One directed edge in a flow's canvas, optionally labelled (conditions
/// route by label, every other node type has exactly one unlabelled edge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from_node_id: Uuid,
    pub to_node_id: Uuid,
    pub label: Option<String>,
}

/// `canvas_data` decoded: the full edge list for a flow, keyed by source
/// node so the interpreter can find a node's successor(s) in one lookup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CanvasData {
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl CanvasData {
    pub fn from_json(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn successor(&self, from: Uuid, label: Option<&str>) -> Option<Uuid> {
        self.edges
            .iter()
            .find(|e| e.from_node_id == from && e.label.as_deref() == label)
            .map(|e| e.to_node_id)
    }

    pub fn default_successor(&self, from: Uuid) -> Option<Uuid> {
        self.successor(from, None)
            .or_else(|| self.successor(from, Some("default")))
    }
}
