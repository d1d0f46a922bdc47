//! JSON wire protocol for the collaboration session.
//!
//! Every frame is a text WebSocket message carrying one tagged JSON object:
//! ```text
//! {"type": "cursor_update", "data": {"documentId": "...", "x": 10.0, ...}}
//! ```
//! Tags are snake_case, payload fields camelCase. Both message unions are
//! closed: an unknown tag fails decoding and is reported upstream as a
//! non-fatal error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Path the collaboration endpoint is mounted on.
pub const COLLABORATION_PATH: &str = "/ws/collaboration";

/// Outbound messages (client → server).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinSession { data: JoinSessionData },
    CursorUpdate { data: CursorUpdateData },
    SwitchDocument { data: DocumentSwitchData },
    LeaveSession { data: LeaveSessionData },
    /// Heartbeat keepalive; answered by [`ServerMessage::Pong`].
    Ping,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionData {
    pub client_id: String,
    pub user_name: String,
    pub avatar_color: Option<String>,
    pub document_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdateData {
    pub document_id: String,
    pub x: f64,
    pub y: f64,
    pub selected_node_id: Option<String>,
    /// Sender-side milliseconds, used for ordering on the receiving end.
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSwitchData {
    pub document_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSessionData {
    pub document_id: Option<String>,
}

/// Inbound messages (server → client).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    UserPresence { data: UserPresenceData },
    BulkPresence { data: Vec<UserPresenceData> },
    DocumentActivity { data: DocumentActivityData },
    Error { message: String },
    /// Heartbeat acknowledgement.
    Pong,
}

/// One collaborator's transient state within the project session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceData {
    pub user_id: String,
    pub user_name: String,
    pub avatar_color: String,
    pub is_online: bool,
    pub last_active: String,
    #[serde(default)]
    pub documents: HashMap<String, DocumentPresence>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPresence {
    pub position: Option<CursorPoint>,
    pub selected_node_id: Option<String>,
    pub last_active_in_document: String,
}

/// Cursor location in document (canvas) coordinates.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct CursorPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentActivityData {
    pub document_id: String,
    pub active_users: Vec<DocumentUser>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUser {
    pub user_id: String,
    pub user_name: String,
    pub position: Option<CursorPoint>,
    pub selected_node_id: Option<String>,
}

impl ClientMessage {
    /// Create a session-join message.
    pub fn join_session(
        client_id: impl Into<String>,
        user_name: impl Into<String>,
        avatar_color: Option<String>,
        document_id: Option<String>,
    ) -> Self {
        Self::JoinSession {
            data: JoinSessionData {
                client_id: client_id.into(),
                user_name: user_name.into(),
                avatar_color,
                document_id,
            },
        }
    }

    /// Create a cursor update for a document.
    pub fn cursor_update(
        document_id: impl Into<String>,
        x: f64,
        y: f64,
        selected_node_id: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self::CursorUpdate {
            data: CursorUpdateData {
                document_id: document_id.into(),
                x,
                y,
                selected_node_id,
                timestamp,
            },
        }
    }

    /// Create a document-switch message.
    pub fn switch_document(document_id: impl Into<String>) -> Self {
        Self::SwitchDocument {
            data: DocumentSwitchData {
                document_id: document_id.into(),
            },
        }
    }

    /// Create a session-leave message.
    pub fn leave_session(document_id: Option<String>) -> Self {
        Self::LeaveSession {
            data: LeaveSessionData { document_id },
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl ServerMessage {
    /// Parse a JSON text frame from the server.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Build the WebSocket session URL from the configured base address.
///
/// Upgrades the scheme to its duplex-socket counterpart (`http → ws`,
/// `https → wss`; `ws`/`wss` pass through), appends the collaboration
/// path and attaches the project id plus the optional auth token.
pub fn build_session_url(
    base_url: &str,
    project_id: i32,
    token: Option<&str>,
) -> Result<String, ProtocolError> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ProtocolError::InvalidUrl(base_url.to_string()));
    };

    let mut url = format!("{ws_base}{COLLABORATION_PATH}?project_id={project_id}");
    if let Some(token) = token {
        url.push_str("&token=");
        url.push_str(token);
    }
    Ok(url)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidUrl(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidUrl(url) => write!(f, "Invalid base URL: {url}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
