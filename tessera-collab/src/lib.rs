//! # tessera-collab — Real-time collaboration client for Tessera
//!
//! The resilient client core behind Tessera's multiplayer plan-DAG
//! editor: a persistent WebSocket session that survives disconnects,
//! plus event-sourced optimistic updates reconciled against
//! authoritative remote state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  operation   ┌────────────────────┐   events    ┌─────────┐
//! │    UI    │ ───────────► │ OptimisticTracker  │ ──────────► │ ledger  │
//! │ (editor) │              │ (pending op map)   │             └─────────┘
//! └────┬─────┘              └────────┬───────────┘
//!      │ cursor/session              │ remote reconciliation
//!      ▼                            ▲
//! ┌────────────────────┐  JSON      │
//! │ ConnectionManager  │ ◄──────────┴── inbound server frames
//! │ (one WS session)   │ ───────────► collaboration server
//! └────────────────────┘  heartbeat, backoff, bounded queue
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (tagged client/server frames,
//!   session URL construction)
//! - [`graph`] — plan-DAG domain types (nodes, edges, positions)
//! - [`events`] — immutable event ledger and the pure [`EventFactory`]
//! - [`connection`] — connection lifecycle: heartbeat, exponential
//!   backoff reconnection, bounded outbound queue, typed notifications
//! - [`tracker`] — optimistic apply/confirm/rollback with
//!   last-writer-wins remote reconciliation
//!
//! Conflict policy is last-writer-wins: a remote change touching an
//! entity with a pending local operation rolls the local operation back.
//! There is no operational-transform or CRDT merging at this layer.

pub mod connection;
pub mod events;
pub mod graph;
pub mod protocol;
pub mod tracker;

// Re-exports for convenience
pub use connection::{
    reconnect_delay, CollabNotification, ConnectionConfig, ConnectionManager, ConnectionState,
    MessageQueue, QueuedMessage, SendOutcome, MAX_RECONNECT_DELAY, MAX_SEND_RETRIES,
    QUEUE_MESSAGE_TTL,
};
pub use events::{EventFactory, GraphEvent, GraphEventKind, EVENT_SCHEMA_VERSION};
pub use graph::{GraphEdge, GraphNode, Position};
pub use protocol::{
    build_session_url, ClientMessage, CursorPoint, DocumentActivityData, DocumentPresence,
    DocumentUser, ProtocolError, ServerMessage, UserPresenceData, COLLABORATION_PATH,
};
pub use tracker::{
    EntityRef, GraphOperation, OptimisticTracker, PendingOperation, RemoteChange,
    RemoteReconciliation, RollbackData,
};
