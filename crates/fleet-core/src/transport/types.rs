use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Address, SessionId};

/// Inbound protocol events the core consumes.
///
/// Everything else the network emits is filtered out by the adapter.
#[derive(Clone, Debug)]
pub enum InboundEvent {
    /// The handshake finished; carries the account's own addresses.
    PairingStatus {
        address: Address,
        linked: Option<Address>,
    },
    Message(IncomingMessage),
    /// Credentials were revoked remotely; the session cannot recover.
    LoggedOut { reason: String },
}

/// Identifies one message within a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageKey {
    pub chat: Address,
    pub id: String,
}

#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub key: MessageKey,
    pub sender: Address,
    pub push_name: Option<String>,
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub from_me: bool,
}

impl IncomingMessage {
    pub fn chat(&self) -> &Address {
        &self.key.chat
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Available,
    Unavailable,
}

/// A device whose credentials survive restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<Address>,
    pub registered_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn session_id(&self) -> SessionId {
        SessionId::from_address(&self.address)
    }
}
