// src/core/websocket/mod.rs

//! The per-connection websocket session: authentication against
//! panel-signed tokens, event relay from the server's bus, and inbound
//! command dispatch.

use serde::{Deserialize, Serialize};

pub mod session;

pub use session::WebsocketSession;

/// Every frame on the wire, both directions: `{event, args}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketMessage {
    pub event: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WebsocketMessage {
    pub fn new(event: &str, args: Vec<String>) -> Self {
        Self {
            event: event.to_string(),
            args,
        }
    }

    pub fn bare(event: &str) -> Self {
        Self::new(event, Vec::new())
    }
}

/// Inbound event names.
pub mod inbound {
    pub const AUTH: &str = "auth";
    pub const SET_STATE: &str = "set state";
    pub const SEND_COMMAND: &str = "send command";
    pub const SEND_LOGS: &str = "send logs";
}

/// Outbound event names that do not correspond to bus topics.
pub mod outbound {
    pub const AUTH_SUCCESS: &str = "auth success";
    pub const TOKEN_EXPIRING: &str = "token expiring";
    pub const TOKEN_EXPIRED: &str = "token expired";
    pub const JWT_ERROR: &str = "jwt error";
    pub const DAEMON_ERROR: &str = "daemon error";
}
