//! Code-based pairing of new sessions.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{sync::oneshot, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    domain::{Address, SessionId},
    errors::PairingError,
    identity::IdentityResolver,
    registry::{EventHandler, PairingTicket, SessionRegistry},
    transport::port::{Connection, Connector},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PairingState {
    Requested,
    CodeIssued,
    Authenticated,
    Failed,
    TimedOut,
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "requested",
            Self::CodeIssued => "code-issued",
            Self::Authenticated => "authenticated",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
        })
    }
}

/// An issued pairing code and the attempt still waiting on it.
#[derive(Debug)]
pub struct PairingHandle {
    pub session_id: SessionId,
    pub code: String,
    pub deadline: DateTime<Utc>,
    outcome: oneshot::Receiver<PairingState>,
}

impl PairingHandle {
    /// Resolve to the attempt's terminal state.
    pub async fn wait(self) -> PairingState {
        self.outcome.await.unwrap_or(PairingState::Failed)
    }
}

#[derive(Clone, Debug)]
pub struct PairingOptions {
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub min_digits: usize,
}

impl From<&Config> for PairingOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            deadline: cfg.pairing_deadline,
            poll_interval: cfg.pairing_poll_interval,
            min_digits: cfg.pairing_min_digits,
        }
    }
}

pub struct PairingController {
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
    identities: Arc<IdentityResolver>,
    handler: Arc<dyn EventHandler>,
    opts: PairingOptions,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl PairingController {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<SessionRegistry>,
        identities: Arc<IdentityResolver>,
        handler: Arc<dyn EventHandler>,
        opts: PairingOptions,
    ) -> Self {
        Self {
            connector,
            registry,
            identities,
            handler,
            opts,
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Number of attempts still waiting for authentication.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Validate `raw`, negotiate a code and start waiting for authentication.
    ///
    /// Negotiation failures are returned here; the attempt never reaches
    /// `CodeIssued` in that case. Each negotiation step is bounded by the
    /// pairing deadline, and the reservation is released if this future is
    /// dropped before a code was issued.
    pub async fn request(&self, raw: &str) -> Result<PairingHandle, PairingError> {
        let id = SessionId::parse_phone(raw, self.opts.min_digits)?;
        let ticket = self.registry.reserve_pairing(id.clone()).await?;
        let reservation = Reservation::new(self.registry.clone(), ticket);
        info!(%id, "pairing requested");

        let (conn, code) = match self.negotiate(&id).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                reservation.release().await;
                return Err(e);
            }
        };

        let ticket = reservation.disarm();
        self.registry
            .mark_pairing(&ticket, PairingState::CodeIssued)
            .await;
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.opts.deadline)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        info!(%id, %deadline, "pairing code issued");

        let (tx, outcome) = oneshot::channel();
        let attempt = Attempt {
            ticket,
            conn,
            registry: self.registry.clone(),
            identities: self.identities.clone(),
            handler: self.handler.clone(),
            deadline: self.opts.deadline,
            poll_interval: self.opts.poll_interval,
            cancel: self.cancel.clone(),
            _guard: InFlight::enter(&self.in_flight),
        };
        tokio::spawn(async move {
            let state = attempt.run().await;
            let _ = tx.send(state);
        });

        Ok(PairingHandle {
            session_id: id,
            code,
            deadline,
            outcome,
        })
    }

    async fn negotiate(
        &self,
        id: &SessionId,
    ) -> Result<(Arc<dyn Connection>, String), PairingError> {
        let limit = self.opts.deadline;

        let conn = match timeout(limit, self.connector.connect_new()).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                warn!(%id, error = %e, "pairing connection failed");
                return Err(PairingError::Transport(e.to_string()));
            }
            Err(_) => {
                warn!(%id, ?limit, "pairing connection timed out");
                return Err(PairingError::Transport(format!(
                    "no connection within {limit:?}"
                )));
            }
        };

        let reason = match timeout(limit, conn.request_pairing_code(id)).await {
            Ok(Ok(code)) => return Ok((conn, code)),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no pairing code within {limit:?}"),
        };
        warn!(%id, %reason, "pairing code negotiation failed");
        if let Err(e) = conn.close().await {
            warn!(%id, error = %e, "close failed");
        }
        Err(PairingError::Transport(reason))
    }

    /// Abort every waiting attempt; their connections are closed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Holds a pairing reservation until a code is issued.
///
/// Dropped while still armed (the request future was cancelled), it releases
/// the reservation on the runtime so the number is not blocked.
struct Reservation {
    registry: Arc<SessionRegistry>,
    ticket: PairingTicket,
    armed: bool,
}

impl Reservation {
    fn new(registry: Arc<SessionRegistry>, ticket: PairingTicket) -> Self {
        Self {
            registry,
            ticket,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        self.registry.release_pairing(self.ticket.clone()).await;
    }

    fn disarm(mut self) -> PairingTicket {
        self.armed = false;
        self.ticket.clone()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = self.registry.clone();
        let ticket = self.ticket.clone();
        let id = ticket.session_id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!(%id, "pairing request abandoned; releasing reservation");
                rt.spawn(async move { registry.release_pairing(ticket).await });
            }
            Err(_) => warn!(%id, "pairing request dropped outside a runtime; reservation kept"),
        }
    }
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Attempt {
    ticket: PairingTicket,
    conn: Arc<dyn Connection>,
    registry: Arc<SessionRegistry>,
    identities: Arc<IdentityResolver>,
    handler: Arc<dyn EventHandler>,
    deadline: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
    _guard: InFlight,
}

impl Attempt {
    async fn run(self) -> PairingState {
        let id = self.ticket.session_id().clone();

        let poll = poll_until_authenticated(self.conn.as_ref(), self.poll_interval);
        let authenticated = tokio::select! {
            _ = self.cancel.cancelled() => None,
            res = timeout(self.deadline, poll) => res.ok(),
        };

        let Some(address) = authenticated else {
            if let Err(e) = self.conn.close().await {
                warn!(%id, error = %e, "close failed");
            }
            self.registry.release_pairing(self.ticket).await;
            if self.cancel.is_cancelled() {
                info!(%id, "pairing aborted by shutdown");
                return PairingState::Failed;
            }
            info!(%id, "pairing timed out");
            return PairingState::TimedOut;
        };

        if address.bare() != id.as_str() {
            warn!(%id, %address, "authenticated address differs from requested number");
        }

        let linked = self.conn.own_linked_address();
        match self
            .registry
            .register_paired(self.ticket, self.conn, self.handler)
            .await
        {
            Some(_) => {
                self.identities
                    .record_from_pairing(&id, linked.as_ref())
                    .await;
                info!(%id, "pairing complete");
                PairingState::Authenticated
            }
            None => PairingState::Failed,
        }
    }
}

async fn poll_until_authenticated(conn: &dyn Connection, every: Duration) -> Address {
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        if let Some(addr) = conn.own_address() {
            return addr;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        notify::Notifier,
        registry::Session,
        settings::SettingsStore,
        testing::{FakeConnection, FakeConnector, FakeDevices},
        transport::types::InboundEvent,
        Result,
    };

    struct Noop;

    #[async_trait]
    impl EventHandler for Noop {
        async fn handle(&self, _session: Arc<Session>, _event: InboundEvent) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        connector: Arc<FakeConnector>,
        registry: Arc<SessionRegistry>,
        identities: Arc<IdentityResolver>,
        settings: Arc<SettingsStore>,
        pairing: PairingController,
    }

    fn fixture(deadline: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let devices = Arc::new(FakeDevices::default());
        let settings = Arc::new(SettingsStore::new(dir.path().join("settings.json"), "."));
        let identities = Arc::new(IdentityResolver::new(
            dir.path().join("lid_storage.json"),
            devices.clone(),
            Duration::from_millis(200),
        ));
        let registry = Arc::new(SessionRegistry::new(
            settings.clone(),
            identities.clone(),
            devices,
            Notifier::default(),
            Duration::from_secs(3600),
        ));
        let connector = Arc::new(FakeConnector::default());
        let pairing = PairingController::new(
            connector.clone(),
            registry.clone(),
            identities.clone(),
            Arc::new(Noop),
            PairingOptions {
                deadline,
                poll_interval: Duration::from_millis(10),
                min_digits: 8,
            },
        );
        Fixture {
            _dir: dir,
            connector,
            registry,
            identities,
            settings,
            pairing,
        }
    }

    #[tokio::test]
    async fn invalid_number_is_rejected_before_connecting() {
        let f = fixture(Duration::from_secs(5));
        let err = f.pairing.request("+92 abc").await.unwrap_err();
        assert_eq!(err.kind(), "invalid-format");
        assert!(f.connector.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn negotiation_failure_is_reported_synchronously() {
        let f = fixture(Duration::from_secs(5));
        let conn = FakeConnection::failing_pairing();
        f.connector.queue(conn.clone());

        let err = f.pairing.request("923001234567").await.unwrap_err();
        assert!(matches!(err, PairingError::Transport(_)));
        assert!(conn.is_closed());
        assert!(f
            .registry
            .pairing_state(&SessionId("923001234567".into()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn authentication_before_deadline_registers_session() {
        let f = fixture(Duration::from_secs(5));
        let handle = f.pairing.request("+92 300 1234567").await.unwrap();
        assert_eq!(handle.session_id.as_str(), "923001234567");
        assert_eq!(handle.code, "CODE-4567");
        assert_eq!(f.pairing.in_flight(), 1);

        let conn = f.connector.last().unwrap();
        conn.authenticate(
            Address::phone("923001234567").with_device(3),
            Some(Address::lid("8080")),
        );

        assert_eq!(handle.wait().await, PairingState::Authenticated);
        assert_eq!(f.registry.len().await, 1);
        assert_eq!(
            f.identities
                .linked(&SessionId("923001234567".into()))
                .await
                .as_deref(),
            Some("8080")
        );
        assert_eq!(f.pairing.in_flight(), 0);
    }

    #[tokio::test]
    async fn deadline_closes_connection_without_registering() {
        let f = fixture(Duration::from_millis(80));
        let handle = f.pairing.request("923001234567").await.unwrap();
        let conn = f.connector.last().unwrap();

        assert_eq!(handle.wait().await, PairingState::TimedOut);
        assert!(conn.is_closed());
        assert!(f.registry.is_empty().await);
        assert!(f
            .registry
            .pairing_state(&SessionId("923001234567".into()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn expiry_survives_a_failing_close() {
        let f = fixture(Duration::from_millis(80));
        let conn = FakeConnection::fresh();
        conn.fail_close();
        f.connector.queue(conn.clone());

        let handle = f.pairing.request("923001234567").await.unwrap();
        assert_eq!(handle.wait().await, PairingState::TimedOut);
        assert!(conn.is_closed());
        assert!(f
            .registry
            .pairing_state(&SessionId("923001234567".into()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn stalled_connect_is_bounded_by_the_deadline() {
        let f = fixture(Duration::from_millis(80));
        f.connector.stall_connect(true);

        let err = f.pairing.request("923001234567").await.unwrap_err();
        assert_eq!(err.kind(), "transport-failure");
        assert!(f
            .registry
            .pairing_state(&SessionId("923001234567".into()))
            .await
            .is_none());

        f.connector.stall_connect(false);
        assert!(f.pairing.request("923001234567").await.is_ok());
    }

    #[tokio::test]
    async fn abandoned_request_frees_the_number() {
        let f = fixture(Duration::from_secs(5));
        let id = SessionId("923001234567".into());
        f.connector.stall_connect(true);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), f.pairing.request("923001234567"))
                .await;
        assert!(abandoned.is_err());

        for _ in 0..100 {
            if f.registry.pairing_state(&id).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.registry.pairing_state(&id).await.is_none());

        f.connector.stall_connect(false);
        let handle = f.pairing.request("+92 300 1234567").await.unwrap();
        assert_eq!(handle.session_id, id);
    }

    #[tokio::test]
    async fn concurrent_attempt_for_same_number_is_rejected() {
        let f = fixture(Duration::from_secs(5));
        let _first = f.pairing.request("923001234567").await.unwrap();
        let err = f.pairing.request("+923001234567").await.unwrap_err();
        assert_eq!(err.kind(), "already-pairing");

        // Different numbers proceed in parallel.
        assert!(f.pairing.request("14155550100").await.is_ok());
        assert_eq!(f.pairing.in_flight(), 2);
    }

    #[tokio::test]
    async fn repairing_replaces_the_live_session() {
        let f = fixture(Duration::from_secs(5));
        let id = SessionId("923001234567".into());

        let first = f.pairing.request("923001234567").await.unwrap();
        let c1 = f.connector.last().unwrap();
        c1.authenticate(id.primary_address(), None);
        assert_eq!(first.wait().await, PairingState::Authenticated);
        f.settings.update(&id, |s| s.prefix = "#".into()).await;

        let second = f.pairing.request("+92 300 1234567").await.unwrap();
        assert!(c1.is_closed());
        assert_eq!(f.registry.len().await, 0);
        assert!(f.settings.snapshot(&id).await.is_none());

        let c2 = f.connector.last().unwrap();
        c2.authenticate(id.primary_address(), None);
        assert_eq!(second.wait().await, PairingState::Authenticated);
        assert_eq!(f.registry.len().await, 1);
        assert!(!c2.is_closed());
    }

    #[tokio::test]
    async fn shutdown_aborts_waiting_attempts() {
        let f = fixture(Duration::from_secs(5));
        let handle = f.pairing.request("923001234567").await.unwrap();
        let conn = f.connector.last().unwrap();

        f.pairing.shutdown();
        assert_eq!(handle.wait().await, PairingState::Failed);
        assert!(conn.is_closed());
    }
}
