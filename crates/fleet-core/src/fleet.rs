//! Application service: wires stores, registry, router and pairing together
//! and owns the process-wide background loops.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, Mutex},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    domain::{Address, SessionId},
    errors::PairingError,
    identity::IdentityResolver,
    notify::{FleetEvent, Notifier},
    pairing::{PairingController, PairingHandle, PairingOptions},
    registry::{EventHandler, Registration, SessionRegistry},
    router::{CommandHandler, EventRouter},
    settings::{SettingsRecord, SettingsStore},
    tasks::BackgroundTasks,
    transport::port::{Connector, DeviceStore},
    Result,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub struct FleetBuilder {
    cfg: Config,
    commands: Vec<Arc<dyn CommandHandler>>,
}

impl FleetBuilder {
    pub fn command(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands.push(handler);
        self
    }

    /// Load durable state, restore stored devices and start background loops.
    pub async fn start(
        self,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn DeviceStore>,
    ) -> Result<Fleet> {
        let cfg = self.cfg;

        let settings = Arc::new(SettingsStore::new(
            cfg.settings_file.clone(),
            &cfg.default_prefix,
        ));
        settings.load().await;

        let identities = Arc::new(IdentityResolver::new(
            cfg.identity_file.clone(),
            devices.clone(),
            cfg.lid_resolve_timeout,
        ));
        identities.load().await;
        identities.sync_from_devices().await;

        let registry = Arc::new(SessionRegistry::new(
            settings.clone(),
            identities.clone(),
            devices.clone(),
            Notifier::default(),
            cfg.keepalive_interval,
        ));

        let router = self.commands.into_iter().fold(
            EventRouter::new(
                registry.clone(),
                settings.clone(),
                identities.clone(),
                BackgroundTasks::new(),
                cfg.max_message_age,
            ),
            EventRouter::with_command,
        );
        let router = Arc::new(router);

        let pairing = PairingController::new(
            connector.clone(),
            registry.clone(),
            identities.clone(),
            router.clone(),
            PairingOptions::from(&cfg),
        );

        let cancel = CancellationToken::new();
        let flush_task = settings.spawn_flush_loop(cfg.flush_interval, cancel.clone());

        let fleet = Fleet {
            cfg,
            settings,
            identities,
            registry,
            router,
            pairing,
            cancel,
            flush_task: Mutex::new(Some(flush_task)),
        };
        fleet.restore(connector, devices).await;
        Ok(fleet)
    }
}

pub struct Fleet {
    cfg: Config,
    settings: Arc<SettingsStore>,
    identities: Arc<IdentityResolver>,
    registry: Arc<SessionRegistry>,
    router: Arc<EventRouter>,
    pairing: PairingController,
    cancel: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Fleet {
    pub fn builder(cfg: Config) -> FleetBuilder {
        FleetBuilder {
            cfg,
            commands: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn identities(&self) -> &Arc<IdentityResolver> {
        &self.identities
    }

    /// Start pairing a new session for a user-supplied phone number.
    pub async fn pair(
        &self,
        raw_number: &str,
    ) -> std::result::Result<PairingHandle, PairingError> {
        self.pairing.request(raw_number).await
    }

    pub fn pairings_in_flight(&self) -> usize {
        self.pairing.in_flight()
    }

    pub async fn is_owner(&self, id: &SessionId, sender: &Address) -> bool {
        self.identities.check_owner(id, sender).await
    }

    pub async fn get_settings(&self, id: &SessionId) -> SettingsRecord {
        self.settings.get(id).await
    }

    pub async fn sessions(&self) -> Vec<SessionId> {
        self.registry.list().await
    }

    pub async fn remove(&self, id: &SessionId) -> bool {
        self.registry.remove(id).await
    }

    pub async fn subscribe(&self) -> (usize, broadcast::Receiver<FleetEvent>) {
        self.registry.subscribe().await
    }

    /// Stop pairing, close every session, drain side effects and flush settings.
    pub async fn shutdown(&self) {
        info!("fleet shutting down");
        self.pairing.shutdown();
        self.registry.shutdown().await;
        self.router.tasks().drain(SHUTDOWN_GRACE).await;

        self.cancel.cancel();
        if let Some(task) = self.flush_task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "settings flush loop ended abnormally");
            }
        }
        info!("fleet stopped");
    }

    /// Resume every stored device concurrently; one failure never blocks the rest.
    async fn restore(
        &self,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn DeviceStore>,
    ) -> usize {
        let stored = match devices.list_devices().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "could not list stored devices; starting with none");
                return 0;
            }
        };
        if stored.is_empty() {
            info!("no stored devices to restore");
            return 0;
        }

        let handler: Arc<dyn EventHandler> = self.router.clone();
        let mut joins = JoinSet::new();
        for device in stored {
            let connector = connector.clone();
            let registry = self.registry.clone();
            let handler = handler.clone();
            joins.spawn(async move {
                let id = device.session_id();
                match connector.resume(&device).await {
                    Ok(conn) => matches!(
                        registry.register(id, conn, handler).await,
                        Registration::Inserted(_)
                    ),
                    Err(e) => {
                        warn!(%id, error = %e, "failed to resume stored device");
                        false
                    }
                }
            });
        }

        let mut restored = 0;
        while let Some(res) = joins.join_next().await {
            match res {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => error!(error = %e, "device restore task failed"),
            }
        }
        info!(restored, "stored devices restored");
        restored
    }
}
