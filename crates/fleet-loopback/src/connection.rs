use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use fleet_core::{
    domain::{Address, SessionId},
    transport::{
        port::Connection,
        types::{InboundEvent, MessageKey, Presence},
    },
    Error, Result,
};

use crate::connector::Network;

/// Something the bot sent over a loopback connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text { chat: Address, text: String },
    Reaction { message_id: String, emoji: String },
    Read { message_id: String },
    Presence(Presence),
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text { chat, text } => write!(f, "[{chat}] {text}"),
            Self::Reaction { message_id, emoji } => write!(f, "react {emoji} on {message_id}"),
            Self::Read { message_id } => write!(f, "read {message_id}"),
            Self::Presence(p) => write!(f, "presence {p:?}"),
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Identity {
    own: Option<Address>,
    linked: Option<Address>,
}

pub struct LoopbackConnection {
    me: Weak<LoopbackConnection>,
    network: Arc<Network>,
    identity: Mutex<Identity>,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<InboundEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    outbox: Mutex<Vec<Outbound>>,
}

impl LoopbackConnection {
    pub(crate) fn new(network: Arc<Network>, own: Option<Address>, linked: Option<Address>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            network,
            identity: Mutex::new(Identity { own, linked }),
            closed: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            outbox: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn authenticate(&self, own: Address, linked: Address) {
        *lock(&self.identity) = Identity {
            own: Some(own.clone()),
            linked: Some(linked.clone()),
        };
        self.inject(InboundEvent::PairingStatus {
            address: own,
            linked: Some(linked),
        });
    }

    /// Push an event as if it arrived from the network. Dropped once closed.
    pub fn inject(&self, event: InboundEvent) -> bool {
        !self.is_closed() && self.events_tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn outbox(&self) -> Vec<Outbound> {
        lock(&self.outbox).clone()
    }

    fn record(&self, out: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("connection closed".into()));
        }
        debug!(%out, "loopback send");
        lock(&self.outbox).push(out);
        Ok(())
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn own_address(&self) -> Option<Address> {
        lock(&self.identity).own.clone()
    }

    fn own_linked_address(&self) -> Option<Address> {
        lock(&self.identity).linked.clone()
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        lock(&self.events_rx).take()
    }

    async fn request_pairing_code(&self, phone: &SessionId) -> Result<String> {
        if self.is_closed() {
            return Err(Error::Transport("connection closed".into()));
        }
        if self.own_address().is_some() {
            return Err(Error::Transport("device is already paired".into()));
        }
        Ok(self.network.issue_code(phone, self.me.clone()))
    }

    async fn send_presence(&self, presence: Presence) -> Result<()> {
        self.record(Outbound::Presence(presence))
    }

    async fn send_text(
        &self,
        chat: &Address,
        text: &str,
        _reply_to: Option<&MessageKey>,
    ) -> Result<()> {
        self.record(Outbound::Text {
            chat: chat.clone(),
            text: text.to_string(),
        })
    }

    async fn send_reaction(&self, key: &MessageKey, emoji: &str) -> Result<()> {
        self.record(Outbound::Reaction {
            message_id: key.id.clone(),
            emoji: emoji.to_string(),
        })
    }

    async fn mark_read(&self, key: &MessageKey, _sender: &Address) -> Result<()> {
        self.record(Outbound::Read {
            message_id: key.id.clone(),
        })
    }

    async fn is_group_admin(&self, group: &Address, member: &Address) -> Result<bool> {
        let admins: HashSet<String> = self.network.group_admins(group);
        Ok(admins.contains(member.bare()))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(own = ?self.own_address(), "loopback connection closed");
        }
        Ok(())
    }
}
