//! Optimistic update tracking with last-writer-wins reconciliation.
//!
//! Local mutations apply immediately; each one is held as a
//! [`PendingOperation`] until the server confirms it, rejects it, or a
//! competing remote change supersedes it. No merging happens here — when
//! a remote change touches an entity with a pending local operation, the
//! local operation is rolled back and remote state wins.
//!
//! ```text
//! UI mutation
//!     │
//!     ▼
//! apply_optimistic()  ──► OPTIMISTIC_UPDATE_APPLIED
//!     │
//!     ├── server ack ──► confirm()   ──► OPTIMISTIC_UPDATE_CONFIRMED
//!     ├── server err ──► rollback()  ──► OPTIMISTIC_UPDATE_ROLLBACK
//!     └── remote hit ──► handle_remote_change()
//!                            ──► ROLLBACK + REMOTE_CHANGE_RECEIVED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::events::{EventFactory, GraphEvent};
use crate::graph::{GraphEdge, GraphNode, Position};

/// Which entity an operation or remote change touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Node(String),
    Edge(String),
    PlanDag,
}

/// An authoritative change that arrived from a remote collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub entity: EntityRef,
    /// The remote entity state, opaque at this layer — the caller applies
    /// it to its own document after pending conflicts are rolled back.
    pub payload: serde_json::Value,
}

impl RemoteChange {
    pub fn new(entity: EntityRef, payload: serde_json::Value) -> Self {
        Self { entity, payload }
    }
}

/// The closed set of local mutations. Each variant carries whatever
/// pre-mutation state is needed to reverse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum GraphOperation {
    CreateNode {
        node: GraphNode,
    },
    UpdateNode {
        node_id: String,
        previous: GraphNode,
        updated: GraphNode,
    },
    DeleteNode {
        node: GraphNode,
    },
    MoveNode {
        node_id: String,
        from: Position,
        to: Position,
    },
    CreateEdge {
        edge: GraphEdge,
    },
    DeleteEdge {
        edge: GraphEdge,
    },
    UpdatePlanDag {
        previous_version: u64,
        new_version: u64,
    },
}

impl GraphOperation {
    /// The entity this operation mutates.
    pub fn entity(&self) -> EntityRef {
        match self {
            Self::CreateNode { node } | Self::DeleteNode { node } => {
                EntityRef::Node(node.id.clone())
            }
            Self::UpdateNode { node_id, .. } | Self::MoveNode { node_id, .. } => {
                EntityRef::Node(node_id.clone())
            }
            Self::CreateEdge { edge } | Self::DeleteEdge { edge } => {
                EntityRef::Edge(edge.id.clone())
            }
            Self::UpdatePlanDag { .. } => EntityRef::PlanDag,
        }
    }

    /// Derive the snapshot needed to reverse this operation.
    fn rollback_data(&self) -> RollbackData {
        match self {
            Self::CreateNode { node } => RollbackData::RemoveNode {
                node_id: node.id.clone(),
            },
            Self::UpdateNode { previous, .. } => RollbackData::RestoreNode {
                node: previous.clone(),
            },
            Self::DeleteNode { node } => RollbackData::RestoreNode { node: node.clone() },
            Self::MoveNode { node_id, from, .. } => RollbackData::RestorePosition {
                node_id: node_id.clone(),
                position: *from,
            },
            Self::CreateEdge { edge } => RollbackData::RemoveEdge {
                edge_id: edge.id.clone(),
            },
            Self::DeleteEdge { edge } => RollbackData::RestoreEdge { edge: edge.clone() },
            Self::UpdatePlanDag {
                previous_version, ..
            } => RollbackData::RestorePlanDagVersion {
                version: *previous_version,
            },
        }
    }
}

/// Instruction for the caller to restore pre-mutation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum RollbackData {
    RemoveNode { node_id: String },
    RestoreNode { node: GraphNode },
    RestorePosition { node_id: String, position: Position },
    RemoveEdge { edge_id: String },
    RestoreEdge { edge: GraphEdge },
    RestorePlanDagVersion { version: u64 },
}

/// A local mutation awaiting server confirmation.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub operation_id: Uuid,
    pub operation: GraphOperation,
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
    /// What the caller expects the server to return, if it cares to check.
    pub expected_result: Option<serde_json::Value>,
    pub rollback: RollbackData,
}

/// Outcome of reconciling one remote change against pending operations.
#[derive(Debug, Clone)]
pub struct RemoteReconciliation {
    /// Rollbacks for superseded local operations, oldest first. The caller
    /// must restore each snapshot before applying the remote payload.
    pub rollbacks: Vec<(RollbackData, GraphEvent)>,
    /// The REMOTE_CHANGE_RECEIVED ledger entry.
    pub received: GraphEvent,
}

/// Tracks in-flight optimistic operations for one client session.
///
/// Exclusively owns the `operation_id → PendingOperation` map; the map is
/// mutated only through apply/confirm/rollback/reconcile.
pub struct OptimisticTracker {
    factory: EventFactory,
    pending: HashMap<Uuid, PendingOperation>,
}

impl OptimisticTracker {
    pub fn new(factory: EventFactory) -> Self {
        Self {
            factory,
            pending: HashMap::new(),
        }
    }

    /// Apply a local mutation optimistically.
    ///
    /// Captures the rollback snapshot, stores the pending entry and emits
    /// an OPTIMISTIC_UPDATE_APPLIED event. Returns the operation id so the
    /// caller can mark the change unconfirmed in its own presentation.
    pub fn apply_optimistic(
        &mut self,
        operation: GraphOperation,
        expected_result: Option<serde_json::Value>,
    ) -> (Uuid, GraphEvent) {
        let operation_id = Uuid::new_v4();
        let rollback = operation.rollback_data();

        log::debug!(
            "Applying optimistic operation {operation_id} on {:?}",
            operation.entity()
        );

        self.pending.insert(
            operation_id,
            PendingOperation {
                operation_id,
                operation,
                client_id: self.factory.client_id().to_string(),
                timestamp: Utc::now(),
                expected_result,
                rollback,
            },
        );

        (operation_id, self.factory.optimistic_applied(operation_id))
    }

    /// Confirm a pending operation against the server's result.
    ///
    /// Unknown ids are a no-op (`None`) — duplicate or late
    /// acknowledgements are expected and harmless.
    pub fn confirm(
        &mut self,
        operation_id: Uuid,
        server_result: Option<&serde_json::Value>,
    ) -> Option<GraphEvent> {
        let entry = self.pending.remove(&operation_id)?;

        if let (Some(expected), Some(actual)) = (&entry.expected_result, server_result) {
            if expected != actual {
                log::debug!(
                    "Operation {operation_id} confirmed with result differing from expectation"
                );
            }
        }

        log::debug!("Confirmed operation {operation_id}");
        Some(self.factory.optimistic_confirmed(operation_id))
    }

    /// Roll back a pending operation.
    ///
    /// Returns the captured pre-mutation snapshot for the caller to
    /// restore, plus the ROLLBACK event carrying the triggering cause.
    /// Unknown ids are a no-op.
    pub fn rollback(
        &mut self,
        operation_id: Uuid,
        reason: &str,
    ) -> Option<(RollbackData, GraphEvent)> {
        let entry = self.pending.remove(&operation_id)?;

        log::warn!("Rolling back operation {operation_id}: {reason}");
        let event = self
            .factory
            .optimistic_rollback(operation_id, reason, entry.rollback.clone());
        Some((entry.rollback, event))
    }

    /// Reconcile a remote change against pending local operations.
    ///
    /// Every pending operation touching the same entity is rolled back —
    /// remote state wins, no merge is attempted. Rollbacks come out oldest
    /// first so the caller restores snapshots in apply order before
    /// applying the remote payload.
    pub fn handle_remote_change(&mut self, change: RemoteChange) -> RemoteReconciliation {
        let mut conflicting: Vec<(Uuid, DateTime<Utc>)> = self
            .pending
            .values()
            .filter(|p| p.operation.entity() == change.entity)
            .map(|p| (p.operation_id, p.timestamp))
            .collect();
        conflicting.sort_by_key(|(_, ts)| *ts);

        let mut rollbacks = Vec::with_capacity(conflicting.len());
        for (operation_id, _) in conflicting {
            if let Some(pair) = self.rollback(operation_id, "superseded by remote change") {
                rollbacks.push(pair);
            }
        }

        let received = self.factory.remote_change_received(change);
        RemoteReconciliation {
            rollbacks,
            received,
        }
    }

    /// Number of in-flight operations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether an operation is still in flight.
    pub fn is_pending(&self, operation_id: Uuid) -> bool {
        self.pending.contains_key(&operation_id)
    }

    /// The pending operation record, if still in flight.
    pub fn pending(&self, operation_id: Uuid) -> Option<&PendingOperation> {
        self.pending.get(&operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GraphEventKind;

    fn tracker() -> OptimisticTracker {
        OptimisticTracker::new(EventFactory::new("client-1", 7))
    }

    fn move_op(node_id: &str, from: Position, to: Position) -> GraphOperation {
        GraphOperation::MoveNode {
            node_id: node_id.into(),
            from,
            to,
        }
    }

    #[test]
    fn test_apply_then_confirm_leaves_no_pending() {
        let mut t = tracker();
        let (id, applied) = t.apply_optimistic(
            move_op("n1", Position::ZERO, Position::new(5.0, 5.0)),
            None,
        );
        assert_eq!(t.pending_count(), 1);
        assert!(matches!(
            applied.kind,
            GraphEventKind::OptimisticUpdateApplied { operation_id } if operation_id == id
        ));

        let confirmed = t.confirm(id, None).unwrap();
        assert_eq!(t.pending_count(), 0);
        assert!(matches!(
            confirmed.kind,
            GraphEventKind::OptimisticUpdateConfirmed { operation_id } if operation_id == id
        ));
    }

    #[test]
    fn test_rollback_returns_pre_mutation_snapshot() {
        let mut t = tracker();
        let (id, _) = t.apply_optimistic(
            move_op("n1", Position::new(10.0, 10.0), Position::new(50.0, 50.0)),
            None,
        );

        let (rollback, event) = t.rollback(id, "server rejected").unwrap();
        assert_eq!(
            rollback,
            RollbackData::RestorePosition {
                node_id: "n1".into(),
                position: Position::new(10.0, 10.0),
            }
        );
        match event.kind {
            GraphEventKind::OptimisticUpdateRollback { reason, .. } => {
                assert_eq!(reason, "server rejected");
            }
            other => panic!("Expected rollback event, got {other:?}"),
        }
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let mut t = tracker();
        assert!(t.confirm(Uuid::new_v4(), None).is_none());
        assert!(t.rollback(Uuid::new_v4(), "whatever").is_none());
    }

    #[test]
    fn test_duplicate_confirm_is_noop() {
        let mut t = tracker();
        let (id, _) = t.apply_optimistic(
            GraphOperation::CreateNode {
                node: GraphNode::new("n1", "Load", Position::ZERO),
            },
            None,
        );
        assert!(t.confirm(id, None).is_some());
        assert!(t.confirm(id, None).is_none());
    }

    #[test]
    fn test_rollback_data_per_operation_kind() {
        let node = GraphNode::new("n1", "Load", Position::ZERO);
        let edge = GraphEdge::new("e1", "n1", "n2");

        assert_eq!(
            GraphOperation::CreateNode { node: node.clone() }.rollback_data(),
            RollbackData::RemoveNode {
                node_id: "n1".into()
            }
        );
        assert_eq!(
            GraphOperation::DeleteNode { node: node.clone() }.rollback_data(),
            RollbackData::RestoreNode { node: node.clone() }
        );
        assert_eq!(
            GraphOperation::UpdateNode {
                node_id: "n1".into(),
                previous: node.clone(),
                updated: GraphNode::new("n1", "Load v2", Position::ZERO),
            }
            .rollback_data(),
            RollbackData::RestoreNode { node }
        );
        assert_eq!(
            GraphOperation::CreateEdge { edge: edge.clone() }.rollback_data(),
            RollbackData::RemoveEdge {
                edge_id: "e1".into()
            }
        );
        assert_eq!(
            GraphOperation::DeleteEdge { edge: edge.clone() }.rollback_data(),
            RollbackData::RestoreEdge { edge }
        );
        assert_eq!(
            GraphOperation::UpdatePlanDag {
                previous_version: 3,
                new_version: 4,
            }
            .rollback_data(),
            RollbackData::RestorePlanDagVersion { version: 3 }
        );
    }

    #[test]
    fn test_remote_change_rolls_back_conflicting_pending() {
        let mut t = tracker();
        let (move_id, _) = t.apply_optimistic(
            move_op("n1", Position::new(10.0, 10.0), Position::new(50.0, 50.0)),
            None,
        );
        // Pending op on a different node must be untouched.
        let (other_id, _) = t.apply_optimistic(
            move_op("n2", Position::ZERO, Position::new(1.0, 1.0)),
            None,
        );

        let change = RemoteChange::new(
            EntityRef::Node("n1".into()),
            serde_json::json!({"position": {"x": 20.0, "y": 20.0}}),
        );
        let outcome = t.handle_remote_change(change);

        assert_eq!(outcome.rollbacks.len(), 1);
        assert_eq!(
            outcome.rollbacks[0].0,
            RollbackData::RestorePosition {
                node_id: "n1".into(),
                position: Position::new(10.0, 10.0),
            }
        );
        assert!(matches!(
            outcome.received.kind,
            GraphEventKind::RemoteChangeReceived { .. }
        ));
        assert!(!t.is_pending(move_id));
        assert!(t.is_pending(other_id));
    }

    #[test]
    fn test_remote_change_without_conflict() {
        let mut t = tracker();
        let (id, _) = t.apply_optimistic(
            move_op("n1", Position::ZERO, Position::new(1.0, 1.0)),
            None,
        );

        let outcome = t.handle_remote_change(RemoteChange::new(
            EntityRef::Node("n9".into()),
            serde_json::Value::Null,
        ));
        assert!(outcome.rollbacks.is_empty());
        assert!(t.is_pending(id));
    }

    #[test]
    fn test_remote_plan_dag_change_conflicts_with_dag_update() {
        let mut t = tracker();
        let (id, _) = t.apply_optimistic(
            GraphOperation::UpdatePlanDag {
                previous_version: 3,
                new_version: 4,
            },
            None,
        );

        let outcome =
            t.handle_remote_change(RemoteChange::new(EntityRef::PlanDag, serde_json::Value::Null));
        assert_eq!(outcome.rollbacks.len(), 1);
        assert_eq!(
            outcome.rollbacks[0].0,
            RollbackData::RestorePlanDagVersion { version: 3 }
        );
        assert!(!t.is_pending(id));
    }

    #[test]
    fn test_multiple_conflicts_roll_back_oldest_first() {
        let mut t = tracker();
        let (first, _) = t.apply_optimistic(
            move_op("n1", Position::ZERO, Position::new(1.0, 1.0)),
            None,
        );
        let (second, _) = t.apply_optimistic(
            move_op("n1", Position::new(1.0, 1.0), Position::new(2.0, 2.0)),
            None,
        );

        let outcome = t.handle_remote_change(RemoteChange::new(
            EntityRef::Node("n1".into()),
            serde_json::Value::Null,
        ));
        assert_eq!(outcome.rollbacks.len(), 2);

        let ids: Vec<Uuid> = outcome
            .rollbacks
            .iter()
            .map(|(_, event)| match event.kind {
                GraphEventKind::OptimisticUpdateRollback { operation_id, .. } => operation_id,
                _ => panic!("expected rollback event"),
            })
            .collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_pending_record_captures_operation() {
        let mut t = tracker();
        let op = GraphOperation::DeleteNode {
            node: GraphNode::new("n1", "Load", Position::new(3.0, 4.0)),
        };
        let (id, _) = t.apply_optimistic(op.clone(), Some(serde_json::json!({"deleted": true})));

        let record = t.pending(id).unwrap();
        assert_eq!(record.operation, op);
        assert_eq!(record.client_id, "client-1");
        assert_eq!(
            record.expected_result,
            Some(serde_json::json!({"deleted": true}))
        );
    }
}
