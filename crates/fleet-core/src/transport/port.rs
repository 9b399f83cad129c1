use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{Address, SessionId},
    transport::types::{DeviceRecord, InboundEvent, MessageKey, Presence},
    Result,
};

/// One client connection to the chat network.
///
/// The registry owns the only long-lived handle to a live connection; pairing
/// owns short-lived ones until they authenticate or time out.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The connection's own primary address, once it holds a stored identity.
    fn own_address(&self) -> Option<Address>;

    /// The alias address the network assigned to this account, if known.
    fn own_linked_address(&self) -> Option<Address>;

    fn is_connected(&self) -> bool;

    /// Hand over the inbound event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>>;

    /// Negotiate a pairing code for `phone` on a fresh (unauthenticated) connection.
    async fn request_pairing_code(&self, phone: &SessionId) -> Result<String>;

    async fn send_presence(&self, presence: Presence) -> Result<()>;

    async fn send_text(&self, chat: &Address, text: &str, reply_to: Option<&MessageKey>)
        -> Result<()>;

    async fn send_reaction(&self, key: &MessageKey, emoji: &str) -> Result<()>;

    async fn mark_read(&self, key: &MessageKey, sender: &Address) -> Result<()>;

    async fn is_group_admin(&self, group: &Address, member: &Address) -> Result<bool>;

    /// Forcibly disconnect. Never waits for graceful teardown.
    async fn close(&self) -> Result<()>;
}

/// Factory for connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// A fresh device with no credentials, used for pairing.
    async fn connect_new(&self) -> Result<Arc<dyn Connection>>;

    /// Reconnect a device whose credentials are already stored.
    async fn resume(&self, device: &DeviceRecord) -> Result<Arc<dyn Connection>>;
}

/// Locally stored device credentials.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    async fn delete_device(&self, id: &SessionId) -> Result<()>;
}
