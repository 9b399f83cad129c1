use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::info;

use fleet_core::{
    domain::{Address, SessionId},
    transport::{
        port::{Connection, Connector},
        types::{DeviceRecord, InboundEvent, IncomingMessage, MessageKey},
    },
    Error, Result,
};

use crate::{
    connection::{lock, LoopbackConnection, Outbound},
    store::FileDeviceStore,
};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTVWXYZ23456789";

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    let raw: String = (0..8)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", &raw[..4], &raw[4..])
}

fn random_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let first = rng.gen_range(1..=9u8);
    std::iter::once(char::from(b'0' + first))
        .chain((1..len).map(|_| char::from(b'0' + rng.gen_range(0..=9u8))))
        .collect()
}

fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Shared state between the connector and the connections it hands out.
#[derive(Default)]
pub(crate) struct Network {
    pending: Mutex<HashMap<String, (SessionId, Weak<LoopbackConnection>)>>,
    attached: Mutex<HashMap<SessionId, Weak<LoopbackConnection>>>,
    admins: Mutex<HashMap<Address, HashSet<String>>>,
}

impl Network {
    pub(crate) fn issue_code(&self, phone: &SessionId, conn: Weak<LoopbackConnection>) -> String {
        let mut pending = lock(&self.pending);
        pending.retain(|_, (_, c)| c.upgrade().is_some_and(|c| !c.is_closed()));
        let code = loop {
            let code = random_code();
            if !pending.contains_key(&normalize_code(&code)) {
                break code;
            }
        };
        pending.insert(normalize_code(&code), (phone.clone(), conn));
        code
    }

    pub(crate) fn group_admins(&self, group: &Address) -> HashSet<String> {
        lock(&self.admins)
            .get(&group_key(group))
            .cloned()
            .unwrap_or_default()
    }

    fn attach(&self, id: SessionId, conn: &Arc<LoopbackConnection>) {
        lock(&self.attached).insert(id, Arc::downgrade(conn));
    }

    fn attached(&self, id: &SessionId) -> Option<Arc<LoopbackConnection>> {
        lock(&self.attached)
            .get(id)
            .and_then(Weak::upgrade)
            .filter(|c| !c.is_closed())
    }
}

fn group_key(group: &Address) -> Address {
    Address {
        device: None,
        ..group.clone()
    }
}

/// Connector whose "network" lives in this process.
pub struct LoopbackConnector {
    network: Arc<Network>,
    store: Arc<FileDeviceStore>,
}

impl LoopbackConnector {
    pub fn new(store: Arc<FileDeviceStore>) -> Self {
        Self {
            network: Arc::new(Network::default()),
            store,
        }
    }

    /// The phone side enters `code`: the waiting connection becomes an
    /// authenticated device and its credentials are stored.
    pub async fn confirm(&self, code: &str) -> Result<SessionId> {
        let (id, weak) = lock(&self.network.pending)
            .remove(&normalize_code(code))
            .ok_or_else(|| Error::Transport(format!("unknown or expired pairing code {code:?}")))?;
        let conn = weak
            .upgrade()
            .filter(|c| !c.is_closed())
            .ok_or_else(|| Error::Transport("pairing connection is gone".into()))?;

        let (device, lid) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(1..=20u16), random_digits(15))
        };
        let own = id.primary_address().with_device(device);
        let linked = Address::lid(lid);

        self.store
            .save(&DeviceRecord {
                address: own.clone(),
                linked: Some(linked.clone()),
                registered_at: Utc::now(),
            })
            .await?;
        self.network.attach(id.clone(), &conn);
        conn.authenticate(own, linked);

        info!(%id, "loopback pairing confirmed");
        Ok(id)
    }

    /// The live connection currently serving `id`, if any.
    pub fn connection(&self, id: &SessionId) -> Option<Arc<LoopbackConnection>> {
        self.network.attached(id)
    }

    pub fn linked_address(&self, id: &SessionId) -> Option<Address> {
        self.connection(id)?.own_linked_address()
    }

    pub fn inject(&self, id: &SessionId, event: InboundEvent) -> Result<()> {
        let conn = self
            .connection(id)
            .ok_or_else(|| Error::Transport(format!("no live loopback connection for {id}")))?;
        if conn.inject(event) {
            Ok(())
        } else {
            Err(Error::Transport(format!("connection for {id} is closed")))
        }
    }

    /// Deliver a text message from `sender` in `chat` to session `id`.
    pub fn deliver_text(&self, id: &SessionId, chat: &Address, sender: &Address, text: &str) -> Result<String> {
        let message_id = format!("LB{}", random_digits(12));
        self.inject(
            id,
            InboundEvent::Message(IncomingMessage {
                key: MessageKey {
                    chat: chat.clone(),
                    id: message_id.clone(),
                },
                sender: sender.clone(),
                push_name: None,
                text: Some(text.to_string()),
                timestamp: Utc::now(),
                from_me: false,
            }),
        )?;
        Ok(message_id)
    }

    /// Revoke `id`'s credentials from the phone side.
    pub fn log_out(&self, id: &SessionId, reason: &str) -> Result<()> {
        self.inject(
            id,
            InboundEvent::LoggedOut {
                reason: reason.to_string(),
            },
        )
    }

    pub fn grant_group_admin(&self, group: &Address, member: &str) {
        lock(&self.network.admins)
            .entry(group_key(group))
            .or_default()
            .insert(member.to_string());
    }

    pub fn outbox(&self, id: &SessionId) -> Vec<Outbound> {
        self.connection(id).map(|c| c.outbox()).unwrap_or_default()
    }

    pub fn pending_codes(&self) -> usize {
        lock(&self.network.pending)
            .values()
            .filter(|(_, c)| c.upgrade().is_some_and(|c| !c.is_closed()))
            .count()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect_new(&self) -> Result<Arc<dyn Connection>> {
        Ok(LoopbackConnection::new(self.network.clone(), None, None))
    }

    async fn resume(&self, device: &DeviceRecord) -> Result<Arc<dyn Connection>> {
        let conn = LoopbackConnection::new(
            self.network.clone(),
            Some(device.address.clone()),
            device.linked.clone(),
        );
        self.network.attach(device.session_id(), &conn);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_unambiguous_alphabet() {
        let code = random_code();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
        assert!(normalize_code(&code)
            .bytes()
            .all(|b| CODE_ALPHABET.contains(&b)));
        assert_eq!(normalize_code("ab cd-ef12"), "ABCDEF12");
    }

    #[test]
    fn random_digits_have_no_leading_zero() {
        for _ in 0..50 {
            let d = random_digits(15);
            assert_eq!(d.len(), 15);
            assert!(!d.starts_with('0'));
            assert!(d.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn confirm_authenticates_and_stores_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileDeviceStore::new(dir.path()));
        let connector = LoopbackConnector::new(store.clone());

        let conn = connector.connect_new().await.unwrap();
        let id = SessionId("923001234567".into());
        let code = conn.request_pairing_code(&id).await.unwrap();
        assert_eq!(connector.pending_codes(), 1);
        assert!(conn.own_address().is_none());

        assert_eq!(connector.confirm(&code.to_lowercase()).await.unwrap(), id);
        assert_eq!(conn.own_address().unwrap().bare(), "923001234567");
        assert!(conn.own_linked_address().unwrap().is_alias());
        assert_eq!(connector.pending_codes(), 0);
        assert!(connector.confirm(&code).await.is_err());

        use fleet_core::transport::port::DeviceStore;
        let devices = store.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].session_id(), id);
    }

    #[tokio::test]
    async fn closed_connection_cannot_be_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let connector = LoopbackConnector::new(Arc::new(FileDeviceStore::new(dir.path())));

        let conn = connector.connect_new().await.unwrap();
        let code = conn
            .request_pairing_code(&SessionId("14155550100".into()))
            .await
            .unwrap();
        conn.close().await.unwrap();
        assert!(connector.confirm(&code).await.is_err());
    }
}
