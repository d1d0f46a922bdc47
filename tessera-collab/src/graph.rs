//! Domain model for the edited document graph.
//!
//! These types are what the event ledger and the optimistic tracker
//! describe; the actual rendered graph state lives with the UI layer.

use serde::{Deserialize, Serialize};

/// 2D position on the document canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ZERO: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::ZERO
    }
}

/// A node in the plan DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub position: Position,
    /// Node-type-specific configuration, opaque at this layer.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            position,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A directed edge between two plan DAG nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl GraphEdge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        }
    }
}
