//! Event ledger for graph mutations.
//!
//! Every mutation — local, confirmed, rolled back or remote — is recorded
//! as an immutable [`GraphEvent`]. The kind set is closed; consumers are
//! expected to match exhaustively with no default branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{GraphEdge, GraphNode, Position};
use crate::tracker::{RemoteChange, RollbackData};

/// Schema version stamped into every event.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// A fully-populated domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEvent {
    /// Globally unique, collision-free even under concurrent creation.
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub project_id: i32,
    pub version: u32,
    #[serde(flatten)]
    pub kind: GraphEventKind,
}

/// The closed set of event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum GraphEventKind {
    NodeCreated {
        node: GraphNode,
    },
    NodeUpdated {
        node_id: String,
        /// State before the update, kept for reversal.
        previous: GraphNode,
        updated: GraphNode,
    },
    NodeDeleted {
        /// The deleted entity in full.
        node: GraphNode,
    },
    NodeMoved {
        node_id: String,
        from: Position,
        to: Position,
    },
    EdgeCreated {
        edge: GraphEdge,
    },
    EdgeDeleted {
        edge: GraphEdge,
    },
    PlanDagUpdated {
        previous_version: u64,
    },
    PlanDagValidated {
        valid: bool,
        errors: Vec<String>,
    },
    RemoteChangeReceived {
        change: RemoteChange,
    },
    OptimisticUpdateApplied {
        operation_id: Uuid,
    },
    OptimisticUpdateConfirmed {
        operation_id: Uuid,
    },
    OptimisticUpdateRollback {
        operation_id: Uuid,
        /// The triggering cause, always paired with the payload for
        /// diagnosability.
        reason: String,
        rollback: RollbackData,
    },
}

/// Pure constructor for [`GraphEvent`]s. No I/O.
///
/// Holds the originating client and project identity; each call stamps a
/// fresh v4 UUID and the current wall-clock time.
#[derive(Debug, Clone)]
pub struct EventFactory {
    client_id: String,
    project_id: i32,
}

impl EventFactory {
    pub fn new(client_id: impl Into<String>, project_id: i32) -> Self {
        Self {
            client_id: client_id.into(),
            project_id,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn project_id(&self) -> i32 {
        self.project_id
    }

    fn event(&self, kind: GraphEventKind) -> GraphEvent {
        GraphEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            client_id: self.client_id.clone(),
            project_id: self.project_id,
            version: EVENT_SCHEMA_VERSION,
            kind,
        }
    }

    pub fn node_created(&self, node: GraphNode) -> GraphEvent {
        self.event(GraphEventKind::NodeCreated { node })
    }

    pub fn node_updated(&self, previous: GraphNode, updated: GraphNode) -> GraphEvent {
        self.event(GraphEventKind::NodeUpdated {
            node_id: updated.id.clone(),
            previous,
            updated,
        })
    }

    pub fn node_deleted(&self, node: GraphNode) -> GraphEvent {
        self.event(GraphEventKind::NodeDeleted { node })
    }

    pub fn node_moved(
        &self,
        node_id: impl Into<String>,
        from: Position,
        to: Position,
    ) -> GraphEvent {
        self.event(GraphEventKind::NodeMoved {
            node_id: node_id.into(),
            from,
            to,
        })
    }

    pub fn edge_created(&self, edge: GraphEdge) -> GraphEvent {
        self.event(GraphEventKind::EdgeCreated { edge })
    }

    pub fn edge_deleted(&self, edge: GraphEdge) -> GraphEvent {
        self.event(GraphEventKind::EdgeDeleted { edge })
    }

    pub fn plan_dag_updated(&self, previous_version: u64) -> GraphEvent {
        self.event(GraphEventKind::PlanDagUpdated { previous_version })
    }

    pub fn plan_dag_validated(&self, valid: bool, errors: Vec<String>) -> GraphEvent {
        self.event(GraphEventKind::PlanDagValidated { valid, errors })
    }

    pub fn remote_change_received(&self, change: RemoteChange) -> GraphEvent {
        self.event(GraphEventKind::RemoteChangeReceived { change })
    }

    pub fn optimistic_applied(&self, operation_id: Uuid) -> GraphEvent {
        self.event(GraphEventKind::OptimisticUpdateApplied { operation_id })
    }

    pub fn optimistic_confirmed(&self, operation_id: Uuid) -> GraphEvent {
        self.event(GraphEventKind::OptimisticUpdateConfirmed { operation_id })
    }

    pub fn optimistic_rollback(
        &self,
        operation_id: Uuid,
        reason: impl Into<String>,
        rollback: RollbackData,
    ) -> GraphEvent {
        self.event(GraphEventKind::OptimisticUpdateRollback {
            operation_id,
            reason: reason.into(),
            rollback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn factory() -> EventFactory {
        EventFactory::new("client-1", 7)
    }

    #[test]
    fn test_event_metadata_populated() {
        let node = GraphNode::new("n1", "Load", Position::new(1.0, 2.0));
        let event = factory().node_created(node.clone());

        assert_eq!(event.client_id, "client-1");
        assert_eq!(event.project_id, 7);
        assert_eq!(event.version, EVENT_SCHEMA_VERSION);
        assert_eq!(event.kind, GraphEventKind::NodeCreated { node });
    }

    #[test]
    fn test_event_ids_unique() {
        let f = factory();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let event = f.optimistic_applied(Uuid::new_v4());
            assert!(seen.insert(event.event_id), "duplicate event id");
        }
    }

    #[test]
    fn test_event_ids_unique_across_threads() {
        let f = factory();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let f = f.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| f.plan_dag_updated(0).event_id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate event id across threads");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_event_kind_tag_format() {
        let event = factory().node_moved("n1", Position::ZERO, Position::new(5.0, 5.0));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "NODE_MOVED");
        assert_eq!(value["nodeId"], "n1");
        assert_eq!(value["from"]["x"], 0.0);
        assert_eq!(value["to"]["x"], 5.0);
        assert!(value["eventId"].is_string());
    }

    #[test]
    fn test_node_updated_carries_prior_state() {
        let previous = GraphNode::new("n1", "Old", Position::ZERO);
        let updated = GraphNode::new("n1", "New", Position::ZERO);
        let event = factory().node_updated(previous.clone(), updated.clone());

        match event.kind {
            GraphEventKind::NodeUpdated {
                previous: p,
                updated: u,
                ..
            } => {
                assert_eq!(p, previous);
                assert_eq!(u, updated);
            }
            other => panic!("Expected NodeUpdated, got {other:?}"),
        }
    }

    #[test]
    fn test_event_roundtrip() {
        let edge = GraphEdge::new("e1", "n1", "n2");
        let event = factory().edge_deleted(edge);
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: GraphEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_rollback_event_pairs_reason_and_payload() {
        let op_id = Uuid::new_v4();
        let rollback = RollbackData::RestorePosition {
            node_id: "n1".into(),
            position: Position::new(10.0, 10.0),
        };
        let event = factory().optimistic_rollback(op_id, "remote change won", rollback.clone());

        match event.kind {
            GraphEventKind::OptimisticUpdateRollback {
                operation_id,
                reason,
                rollback: payload,
            } => {
                assert_eq!(operation_id, op_id);
                assert_eq!(reason, "remote change won");
                assert_eq!(payload, rollback);
            }
            other => panic!("Expected OptimisticUpdateRollback, got {other:?}"),
        }
    }
}
