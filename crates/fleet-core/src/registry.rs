//! Live sessions: at most one per identity, each with its own inbound and
//! keepalive tasks.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, RwLock},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    domain::SessionId,
    errors::PairingError,
    identity::IdentityResolver,
    notify::{FleetEvent, Notifier},
    pairing::PairingState,
    settings::SettingsStore,
    transport::{
        port::{Connection, DeviceStore},
        types::{InboundEvent, Presence},
    },
    Result,
};

/// Consumer of a session's inbound events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, session: Arc<Session>, event: InboundEvent) -> Result<()>;
}

/// One authenticated connection bound to a [`SessionId`].
pub struct Session {
    id: SessionId,
    conn: Arc<dyn Connection>,
    connected_at: DateTime<Utc>,
    last_presence: RwLock<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
}

impl Session {
    fn new(id: SessionId, conn: Arc<dyn Connection>, cancel: CancellationToken) -> Self {
        Self {
            id,
            conn,
            connected_at: Utc::now(),
            last_presence: RwLock::new(None),
            cancel,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub async fn last_presence(&self) -> Option<DateTime<Utc>> {
        *self.last_presence.read().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Outcome of [`SessionRegistry::register`].
pub enum Registration {
    Inserted(Arc<Session>),
    /// Another session or pairing attempt already owns the id; the offered
    /// connection was closed.
    AlreadyPresent,
}

/// Proof that the holder reserved an id for pairing.
///
/// The serial makes a stale copy harmless: it can neither release nor claim a
/// newer reservation for the same id.
#[derive(Clone, Debug)]
pub struct PairingTicket {
    id: SessionId,
    serial: u64,
}

impl PairingTicket {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }
}

enum Entry {
    Pairing {
        serial: u64,
        state: PairingState,
        started_at: DateTime<Utc>,
    },
    Live(Arc<Session>),
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Entry>>,
    settings: Arc<SettingsStore>,
    identities: Arc<IdentityResolver>,
    devices: Arc<dyn DeviceStore>,
    notifier: Notifier,
    keepalive_interval: Duration,
    next_serial: AtomicU64,
    cancel: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        settings: Arc<SettingsStore>,
        identities: Arc<IdentityResolver>,
        devices: Arc<dyn DeviceStore>,
        notifier: Notifier,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            identities,
            devices,
            notifier,
            keepalive_interval,
            next_serial: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Insert a live session unless `id` is already taken.
    pub async fn register(
        &self,
        id: SessionId,
        conn: Arc<dyn Connection>,
        handler: Arc<dyn EventHandler>,
    ) -> Registration {
        let session = {
            let mut map = self.sessions.write().await;
            if map.contains_key(&id) {
                None
            } else {
                let session = Arc::new(Session::new(
                    id.clone(),
                    conn.clone(),
                    self.cancel.child_token(),
                ));
                map.insert(id.clone(), Entry::Live(session.clone()));
                Some(session)
            }
        };

        match session {
            Some(session) => {
                self.activate(session.clone(), handler).await;
                Registration::Inserted(session)
            }
            None => {
                debug!(%id, "duplicate registration rejected");
                close_quietly(&id, conn.as_ref()).await;
                Registration::AlreadyPresent
            }
        }
    }

    /// Mark `id` as mid-pairing, tearing down any live session it had.
    pub async fn reserve_pairing(
        &self,
        id: SessionId,
    ) -> std::result::Result<PairingTicket, PairingError> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let previous = {
            let mut map = self.sessions.write().await;
            if matches!(map.get(&id), Some(Entry::Pairing { .. })) {
                return Err(PairingError::AlreadyPairing(id));
            }
            map.insert(
                id.clone(),
                Entry::Pairing {
                    serial,
                    state: PairingState::Requested,
                    started_at: Utc::now(),
                },
            )
        };

        if let Some(Entry::Live(old)) = previous {
            info!(%id, "re-pairing: removing existing session first");
            self.teardown(old).await;
        }
        Ok(PairingTicket { id, serial })
    }

    pub async fn mark_pairing(&self, ticket: &PairingTicket, new_state: PairingState) {
        let mut map = self.sessions.write().await;
        if let Some(Entry::Pairing { serial, state, .. }) = map.get_mut(&ticket.id) {
            if *serial == ticket.serial {
                *state = new_state;
            }
        }
    }

    /// Drop a reservation whose attempt ended without a session.
    pub async fn release_pairing(&self, ticket: PairingTicket) {
        let mut map = self.sessions.write().await;
        let reserved = matches!(
            map.get(&ticket.id),
            Some(Entry::Pairing { serial, .. }) if *serial == ticket.serial
        );
        if reserved {
            map.remove(&ticket.id);
        }
    }

    /// Turn a reservation into a live session.
    ///
    /// Returns `None` (and closes `conn`) if the reservation is gone, which
    /// only happens after shutdown.
    pub async fn register_paired(
        &self,
        ticket: PairingTicket,
        conn: Arc<dyn Connection>,
        handler: Arc<dyn EventHandler>,
    ) -> Option<Arc<Session>> {
        let session = {
            let mut map = self.sessions.write().await;
            let reserved = matches!(
                map.get(&ticket.id),
                Some(Entry::Pairing { serial, .. }) if *serial == ticket.serial
            );
            if reserved && !self.cancel.is_cancelled() {
                let session = Arc::new(Session::new(
                    ticket.id.clone(),
                    conn.clone(),
                    self.cancel.child_token(),
                ));
                map.insert(ticket.id.clone(), Entry::Live(session.clone()));
                Some(session)
            } else {
                None
            }
        };

        match session {
            Some(session) => {
                self.activate(session.clone(), handler).await;
                Some(session)
            }
            None => {
                warn!(id = %ticket.id, "pairing reservation lost; discarding connection");
                close_quietly(&ticket.id, conn.as_ref()).await;
                None
            }
        }
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        match self.sessions.read().await.get(id) {
            Some(Entry::Live(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub async fn pairing_state(&self, id: &SessionId) -> Option<(PairingState, DateTime<Utc>)> {
        match self.sessions.read().await.get(id) {
            Some(Entry::Pairing {
                state, started_at, ..
            }) => Some((*state, *started_at)),
            _ => None,
        }
    }

    /// Live session ids, sorted.
    pub async fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Live(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|e| matches!(e, Entry::Live(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove a live session and everything stored for it. Never fails.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let removed = {
            let mut map = self.sessions.write().await;
            match map.get(id) {
                Some(Entry::Live(_)) => map.remove(id),
                _ => None,
            }
        };
        match removed {
            Some(Entry::Live(session)) => {
                self.teardown(session).await;
                true
            }
            _ => false,
        }
    }

    /// Current session count plus a receiver for future notifications.
    pub async fn subscribe(&self) -> (usize, broadcast::Receiver<FleetEvent>) {
        let rx = self.notifier.subscribe();
        (self.len().await, rx)
    }

    /// Push presence if the session wants to look online. Returns whether it did.
    pub async fn keepalive(&self, id: &SessionId) -> Result<bool> {
        match self.get(id).await {
            Some(session) => keepalive_once(&session, &self.settings).await,
            None => Ok(false),
        }
    }

    /// Cancel every session task and close every connection. Stored data is kept.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let drained: Vec<(SessionId, Entry)> = self.sessions.write().await.drain().collect();
        for (id, entry) in drained {
            if let Entry::Live(session) = entry {
                close_quietly(&id, session.conn.as_ref()).await;
            }
        }
        info!("all sessions closed");
    }

    async fn activate(&self, session: Arc<Session>, handler: Arc<dyn EventHandler>) {
        spawn_inbound(session.clone(), handler);
        spawn_keepalive(session.clone(), self.settings.clone(), self.keepalive_interval);

        info!(id = %session.id, "session registered");
        self.notifier.publish(FleetEvent::NewSession {
            bot_id: session.id.clone(),
        });
        self.publish_stats().await;
    }

    async fn teardown(&self, session: Arc<Session>) {
        let id = session.id.clone();
        session.cancel.cancel();
        close_quietly(&id, session.conn.as_ref()).await;

        self.settings.remove(&id).await;
        self.identities.remove(&id).await;
        if let Err(e) = self.devices.delete_device(&id).await {
            warn!(%id, error = %e, "failed to delete stored device");
        }

        info!(%id, "session removed");
        self.notifier.publish(FleetEvent::SessionRemoved { bot_id: id });
        self.publish_stats().await;
    }

    async fn publish_stats(&self) {
        let active_bots = self.len().await;
        self.notifier.publish(FleetEvent::Stats { active_bots });
    }
}

async fn close_quietly(id: &SessionId, conn: &dyn Connection) {
    if let Err(e) = conn.close().await {
        warn!(%id, error = %e, "close failed");
    }
}

async fn keepalive_once(session: &Session, settings: &SettingsStore) -> Result<bool> {
    if session.is_cancelled() || !session.conn.is_connected() {
        return Ok(false);
    }
    if !settings.view(&session.id).await.always_online {
        return Ok(false);
    }
    session.conn.send_presence(Presence::Available).await?;
    *session.last_presence.write().await = Some(Utc::now());
    Ok(true)
}

fn spawn_keepalive(session: Arc<Session>, settings: Arc<SettingsStore>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = keepalive_once(&session, &settings).await {
                debug!(id = %session.id, error = %e, "keepalive presence failed");
            }
        }
    });
}

fn spawn_inbound(session: Arc<Session>, handler: Arc<dyn EventHandler>) {
    let Some(mut events) = session.conn.take_events() else {
        warn!(id = %session.id, "connection event stream already taken");
        return;
    };

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = session.cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };

            // Child task per event: a panicking handler must not end the loop.
            let h = handler.clone();
            let s = session.clone();
            match tokio::spawn(async move { h.handle(s, event).await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(id = %session.id, error = %e, "event handling failed"),
                Err(e) if e.is_panic() => error!(id = %session.id, "event handler panicked"),
                Err(_) => {}
            }
        }
        debug!(id = %session.id, "inbound loop ended");
    });
}
