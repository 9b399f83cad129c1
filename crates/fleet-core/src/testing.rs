//! In-memory fakes for the transport ports, shared by unit tests.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::{
    domain::{Address, SessionId},
    transport::{
        port::{Connection, Connector, DeviceStore},
        types::{DeviceRecord, InboundEvent, MessageKey, Presence},
    },
    Error, Result,
};

pub(crate) struct FakeConnection {
    own: Mutex<Option<Address>>,
    linked: Mutex<Option<Address>>,
    connected: AtomicBool,
    closed: AtomicBool,
    fail_pairing: AtomicBool,
    fail_close: AtomicBool,
    events_tx: mpsc::UnboundedSender<InboundEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    admins: Mutex<HashSet<String>>,
    pub sent: Mutex<Vec<(Address, String)>>,
    pub reactions: Mutex<Vec<(String, String)>>,
    pub read: Mutex<Vec<String>>,
    pub presences: Mutex<Vec<Presence>>,
}

impl FakeConnection {
    pub fn fresh() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            own: Mutex::new(None),
            linked: Mutex::new(None),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_pairing: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            admins: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
            read: Mutex::new(Vec::new()),
            presences: Mutex::new(Vec::new()),
        })
    }

    pub fn authenticated(address: Address) -> Arc<Self> {
        let c = Self::fresh();
        c.authenticate(address, None);
        c
    }

    pub fn authenticate(&self, address: Address, linked: Option<Address>) {
        *self.own.lock().unwrap() = Some(address);
        *self.linked.lock().unwrap() = linked;
    }

    pub fn failing_pairing() -> Arc<Self> {
        let c = Self::fresh();
        c.fail_pairing.store(true, Ordering::SeqCst);
        c
    }

    /// Make `close` report an error (the connection still ends up closed).
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn inject(&self, event: InboundEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn grant_admin(&self, member: &str) {
        self.admins.lock().unwrap().insert(member.to_string());
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn own_address(&self) -> Option<Address> {
        self.own.lock().unwrap().clone()
    }

    fn own_linked_address(&self) -> Option<Address> {
        self.linked.lock().unwrap().clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn request_pairing_code(&self, phone: &SessionId) -> Result<String> {
        if self.fail_pairing.load(Ordering::SeqCst) {
            return Err(Error::Transport("handshake refused".into()));
        }
        Ok(format!("CODE-{}", &phone.as_str()[phone.as_str().len() - 4..]))
    }

    async fn send_presence(&self, presence: Presence) -> Result<()> {
        self.presences.lock().unwrap().push(presence);
        Ok(())
    }

    async fn send_text(
        &self,
        chat: &Address,
        text: &str,
        _reply_to: Option<&MessageKey>,
    ) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((chat.clone(), text.to_string()));
        Ok(())
    }

    async fn send_reaction(&self, key: &MessageKey, emoji: &str) -> Result<()> {
        self.reactions
            .lock()
            .unwrap()
            .push((key.id.clone(), emoji.to_string()));
        Ok(())
    }

    async fn mark_read(&self, key: &MessageKey, _sender: &Address) -> Result<()> {
        self.read.lock().unwrap().push(key.id.clone());
        Ok(())
    }

    async fn is_group_admin(&self, _group: &Address, member: &Address) -> Result<bool> {
        Ok(self.admins.lock().unwrap().contains(member.bare()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::Transport("socket already reset".into()));
        }
        Ok(())
    }
}

/// Hands out queued connections for `connect_new`, fresh ones otherwise.
#[derive(Default)]
pub(crate) struct FakeConnector {
    queued: Mutex<VecDeque<Arc<FakeConnection>>>,
    unreachable: Mutex<HashSet<String>>,
    stalled: AtomicBool,
    pub created: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    pub fn queue(&self, conn: Arc<FakeConnection>) {
        self.queued.lock().unwrap().push_back(conn);
    }

    /// Make `resume` fail for this primary identifier.
    pub fn refuse_resume(&self, user: &str) {
        self.unreachable.lock().unwrap().insert(user.to_string());
    }

    /// While set, `connect_new` never resolves.
    pub fn stall_connect(&self, on: bool) {
        self.stalled.store(on, Ordering::SeqCst);
    }

    pub fn last(&self) -> Option<Arc<FakeConnection>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect_new(&self) -> Result<Arc<dyn Connection>> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let conn = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(FakeConnection::fresh);
        self.created.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    async fn resume(&self, device: &DeviceRecord) -> Result<Arc<dyn Connection>> {
        if self.unreachable.lock().unwrap().contains(device.address.bare()) {
            return Err(Error::Transport("stored credentials rejected".into()));
        }
        let conn = FakeConnection::authenticated(device.address.clone());
        self.created.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

#[derive(Default)]
pub(crate) struct FakeDevices {
    devices: tokio::sync::Mutex<Vec<DeviceRecord>>,
    pub deleted: Mutex<Vec<SessionId>>,
}

impl FakeDevices {
    pub async fn put(&self, address: Address, linked: Option<Address>) {
        self.devices.lock().await.push(DeviceRecord {
            address,
            linked,
            registered_at: Utc::now(),
        });
    }
}

#[async_trait]
impl DeviceStore for FakeDevices {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.devices.lock().await.clone())
    }

    async fn delete_device(&self, id: &SessionId) -> Result<()> {
        self.devices
            .lock()
            .await
            .retain(|d| &d.session_id() != id);
        self.deleted.lock().unwrap().push(id.clone());
        Ok(())
    }
}
