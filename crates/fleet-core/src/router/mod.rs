//! Inbound event routing: filters, automation toggles, authorization and
//! command dispatch.

mod commands;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    identity::IdentityResolver,
    registry::{EventHandler, Session, SessionRegistry},
    settings::{Mode, SettingsRecord, SettingsStore},
    tasks::BackgroundTasks,
    transport::types::{InboundEvent, IncomingMessage},
    Result,
};

pub use commands::parse_command;

const STATUS_REACTION: &str = "💚";
const AUTO_REACTIONS: [&str; 6] = ["❤️", "👍", "🔥", "😂", "😮", "🙏"];

/// Everything a command needs to act on one message.
pub struct CommandContext {
    pub session: Arc<Session>,
    pub message: IncomingMessage,
    pub settings: SettingsRecord,
    pub is_owner: bool,
}

impl CommandContext {
    /// Reply in the message's chat, quoting it.
    pub async fn reply(&self, text: &str) -> Result<()> {
        self.session
            .connection()
            .send_text(self.message.chat(), text, Some(&self.message.key))
            .await
    }
}

/// A command implemented outside the core (group actions, downloads, menus...).
///
/// Runs only after the mode gate passed; owner-only handlers are skipped for
/// everyone else.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    fn requires_owner(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &CommandContext, args: &str) -> Result<()>;
}

pub struct EventRouter {
    registry: Arc<SessionRegistry>,
    settings: Arc<SettingsStore>,
    identities: Arc<IdentityResolver>,
    tasks: BackgroundTasks,
    external: HashMap<String, Arc<dyn CommandHandler>>,
    max_message_age: Duration,
    started_at: DateTime<Utc>,
}

impl EventRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        settings: Arc<SettingsStore>,
        identities: Arc<IdentityResolver>,
        tasks: BackgroundTasks,
        max_message_age: Duration,
    ) -> Self {
        Self {
            registry,
            settings,
            identities,
            tasks,
            external: HashMap::new(),
            max_message_age,
            started_at: Utc::now(),
        }
    }

    /// Register an external command. Built-in names cannot be shadowed.
    pub fn with_command(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        let name = handler.name().trim().to_lowercase();
        if commands::is_builtin(&name) {
            warn!(command = %name, "external command shadows a built-in; ignored");
            return self;
        }
        self.external.insert(name, handler);
        self
    }

    async fn on_message(&self, session: &Arc<Session>, msg: IncomingMessage) -> Result<()> {
        let age = Utc::now().signed_duration_since(msg.timestamp);
        if matches!(age.to_std(), Ok(age) if age > self.max_message_age) {
            debug!(id = %session.id(), msg = %msg.key.id, "stale message dropped");
            return Ok(());
        }

        if session.is_cancelled() {
            debug!(id = %session.id(), msg = %msg.key.id, "session gone; message dropped");
            return Ok(());
        }
        let settings = self.settings.view(session.id()).await;

        if msg.chat().is_status_broadcast() {
            if settings.auto_status {
                self.submit_read(session, &msg);
            }
            if settings.status_react {
                self.submit_reaction(session, &msg, STATUS_REACTION);
            }
            return Ok(());
        }

        if !msg.from_me {
            if settings.auto_read {
                self.submit_read(session, &msg);
            }
            if settings.auto_react {
                self.submit_reaction(session, &msg, pick_reaction(&msg.key.id));
            }
        }

        let Some(text) = msg.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        let Some((name, args)) = parse_command(text, &settings.prefix) else {
            return Ok(());
        };

        let is_owner =
            msg.from_me || self.identities.check_owner(session.id(), &msg.sender).await;
        if !self.mode_allows(settings.mode, is_owner, session, &msg).await {
            debug!(
                id = %session.id(),
                command = %name,
                sender = %msg.sender,
                mode = %settings.mode,
                "command blocked by mode"
            );
            return Ok(());
        }

        let ctx = CommandContext {
            session: session.clone(),
            message: msg,
            settings,
            is_owner,
        };

        if commands::is_builtin(&name) {
            return self.run_builtin(&name, &ctx, &args).await;
        }

        match self.external.get(&name) {
            Some(handler) if handler.requires_owner() && !is_owner => {
                debug!(command = %name, "owner-only command ignored");
                Ok(())
            }
            Some(handler) => handler.run(&ctx, &args).await,
            None => {
                debug!(command = %name, "unknown command");
                Ok(())
            }
        }
    }

    async fn mode_allows(
        &self,
        mode: Mode,
        is_owner: bool,
        session: &Session,
        msg: &IncomingMessage,
    ) -> bool {
        match mode {
            Mode::Public => true,
            Mode::Private => is_owner,
            Mode::Admin if is_owner => true,
            Mode::Admin if !msg.chat().is_group() => false,
            Mode::Admin => match session
                .connection()
                .is_group_admin(msg.chat(), &msg.sender)
                .await
            {
                Ok(admin) => admin,
                Err(e) => {
                    warn!(id = %session.id(), error = %e, "group admin lookup failed; denying");
                    false
                }
            },
        }
    }

    fn submit_read(&self, session: &Session, msg: &IncomingMessage) {
        let conn = session.connection().clone();
        let key = msg.key.clone();
        let sender = msg.sender.clone();
        self.tasks.submit("mark-read", async move {
            conn.mark_read(&key, &sender).await
        });
    }

    fn submit_reaction(&self, session: &Session, msg: &IncomingMessage, emoji: &'static str) {
        let conn = session.connection().clone();
        let key = msg.key.clone();
        self.tasks.submit("reaction", async move {
            conn.send_reaction(&key, emoji).await
        });
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }
}

#[async_trait]
impl EventHandler for EventRouter {
    async fn handle(&self, session: Arc<Session>, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Message(msg) => self.on_message(&session, msg).await,
            InboundEvent::PairingStatus { address, linked } => {
                debug!(id = %session.id(), %address, "pairing status received");
                self.identities
                    .record_from_pairing(session.id(), linked.as_ref())
                    .await;
                Ok(())
            }
            InboundEvent::LoggedOut { reason } => {
                info!(id = %session.id(), %reason, "logged out remotely; removing session");
                self.registry.remove(session.id()).await;
                Ok(())
            }
        }
    }
}

fn pick_reaction(seed: &str) -> &'static str {
    let n = seed.bytes().fold(0usize, |acc, b| acc.wrapping_add(b as usize));
    AUTO_REACTIONS[n % AUTO_REACTIONS.len()]
}
