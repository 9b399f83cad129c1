//! Per-session settings, authoritative in memory, flushed to a JSON document.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::{
    sync::{Mutex, Notify, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    domain::SessionId,
    persist::{read_document, write_document, Loaded},
    Result,
};

pub const DEFAULT_PREFIX: &str = ".";

/// Who may run commands on a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    #[default]
    Public,
    /// Owner, plus group admins inside groups.
    Admin,
    /// Owner only.
    Private,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Admin => "admin",
            Self::Private => "private",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "public" => Some(Self::Public),
            "admin" => Some(Self::Admin),
            "private" => Some(Self::Private),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    /// Empty or unknown modes read as `public`; older documents stored `""`.
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.as_deref().and_then(Mode::parse).unwrap_or_default())
    }
}

/// Boolean automation switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Toggle {
    AutoRead,
    AutoReact,
    AutoStatus,
    StatusReact,
    AlwaysOnline,
    WelcomeMsg,
}

impl Toggle {
    pub const ALL: [Toggle; 6] = [
        Toggle::AutoRead,
        Toggle::AutoReact,
        Toggle::AutoStatus,
        Toggle::StatusReact,
        Toggle::AlwaysOnline,
        Toggle::WelcomeMsg,
    ];

    /// Command name that flips this toggle.
    pub fn command(&self) -> &'static str {
        match self {
            Self::AutoRead => "autoread",
            Self::AutoReact => "autoreact",
            Self::AutoStatus => "autostatus",
            Self::StatusReact => "statusreact",
            Self::AlwaysOnline => "alwaysonline",
            Self::WelcomeMsg => "welcome",
        }
    }

    pub fn from_command(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.command() == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsRecord {
    pub auto_read: bool,
    pub auto_react: bool,
    pub auto_status: bool,
    pub status_react: bool,
    pub always_online: bool,
    pub prefix: String,
    pub mode: Mode,
    pub welcome_msg: bool,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

impl SettingsRecord {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            auto_read: false,
            auto_react: false,
            auto_status: false,
            status_react: false,
            always_online: false,
            prefix: prefix.to_string(),
            mode: Mode::Public,
            welcome_msg: false,
        }
    }

    pub fn is_on(&self, t: Toggle) -> bool {
        match t {
            Toggle::AutoRead => self.auto_read,
            Toggle::AutoReact => self.auto_react,
            Toggle::AutoStatus => self.auto_status,
            Toggle::StatusReact => self.status_react,
            Toggle::AlwaysOnline => self.always_online,
            Toggle::WelcomeMsg => self.welcome_msg,
        }
    }

    fn toggle_mut(&mut self, t: Toggle) -> &mut bool {
        match t {
            Toggle::AutoRead => &mut self.auto_read,
            Toggle::AutoReact => &mut self.auto_react,
            Toggle::AutoStatus => &mut self.auto_status,
            Toggle::StatusReact => &mut self.status_react,
            Toggle::AlwaysOnline => &mut self.always_online,
            Toggle::WelcomeMsg => &mut self.welcome_msg,
        }
    }

    /// Prefix is never empty.
    fn normalize(&mut self, default_prefix: &str) {
        let trimmed = self.prefix.trim();
        if trimmed.is_empty() {
            self.prefix = default_prefix.to_string();
        } else if trimmed.len() != self.prefix.len() {
            self.prefix = trimmed.to_string();
        }
    }
}

/// Durable per-session settings table.
///
/// Reads take the shared lock and return a snapshot; writes take the exclusive
/// lock, are visible as soon as `update` returns and are persisted by the next
/// flush.
pub struct SettingsStore {
    path: PathBuf,
    default_prefix: String,
    table: RwLock<HashMap<SessionId, SettingsRecord>>,
    // Serializes document writes; always taken before `table`.
    write_lock: Mutex<()>,
    dirty: AtomicBool,
    flush_requested: Notify,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>, default_prefix: &str) -> Self {
        let default_prefix = match default_prefix.trim() {
            "" => DEFAULT_PREFIX.to_string(),
            p => p.to_string(),
        };
        Self {
            path: path.into(),
            default_prefix,
            table: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            flush_requested: Notify::new(),
        }
    }

    /// Replace the in-memory table with the durable document.
    ///
    /// Missing or malformed documents degrade to an empty table.
    pub async fn load(&self) -> usize {
        let loaded: HashMap<SessionId, SettingsRecord> =
            match read_document::<BTreeMap<SessionId, SettingsRecord>>(&self.path).await {
                Loaded::Found(doc) => doc
                    .into_iter()
                    .map(|(id, mut rec)| {
                        rec.normalize(&self.default_prefix);
                        (id, rec)
                    })
                    .collect(),
                Loaded::Missing => {
                    info!(path = %self.path.display(), "no settings document, starting empty");
                    HashMap::new()
                }
                Loaded::Corrupt(e) => {
                    warn!(error = %e, "settings document unreadable, starting empty");
                    HashMap::new()
                }
            };

        let count = loaded.len();
        *self.table.write().await = loaded;
        info!(count, "settings loaded");
        count
    }

    /// Current settings for `id`, materializing defaults on first access.
    pub async fn get(&self, id: &SessionId) -> SettingsRecord {
        if let Some(rec) = self.table.read().await.get(id) {
            return rec.clone();
        }
        let rec = {
            let mut table = self.table.write().await;
            table
                .entry(id.clone())
                .or_insert_with(|| SettingsRecord::with_prefix(&self.default_prefix))
                .clone()
        };
        self.request_flush();
        rec
    }

    /// Read-only lookup; never creates a record.
    pub async fn snapshot(&self, id: &SessionId) -> Option<SettingsRecord> {
        self.table.read().await.get(id).cloned()
    }

    /// Stored record or the defaults, without creating one.
    ///
    /// For readers that may race a removal of `id`.
    pub async fn view(&self, id: &SessionId) -> SettingsRecord {
        self.snapshot(id)
            .await
            .unwrap_or_else(|| SettingsRecord::with_prefix(&self.default_prefix))
    }

    /// Mutate `id`'s record in place under the exclusive lock.
    pub async fn update<R>(&self, id: &SessionId, f: impl FnOnce(&mut SettingsRecord) -> R) -> R {
        let out = {
            let mut table = self.table.write().await;
            let rec = table
                .entry(id.clone())
                .or_insert_with(|| SettingsRecord::with_prefix(&self.default_prefix));
            let out = f(rec);
            rec.normalize(&self.default_prefix);
            out
        };
        self.request_flush();
        out
    }

    /// Flip one toggle; returns its new value.
    pub async fn toggle(&self, id: &SessionId, t: Toggle) -> bool {
        self.update(id, |rec| {
            let v = rec.toggle_mut(t);
            *v = !*v;
            *v
        })
        .await
    }

    pub async fn remove(&self, id: &SessionId) -> bool {
        let removed = self.table.write().await.remove(id).is_some();
        if removed {
            self.request_flush();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }

    /// Write the whole table to the durable document.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.dirty.store(false, Ordering::SeqCst);

        let doc: BTreeMap<SessionId, SettingsRecord> = {
            let table = self.table.read().await;
            table.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        if let Err(e) = write_document(&self.path, &doc).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!(count = doc.len(), path = %self.path.display(), "settings flushed");
        Ok(())
    }

    /// Ask the flush loop to persist soon.
    pub fn request_flush(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.flush_requested.notify_one();
    }

    /// Periodic + on-demand flush loop. Flushes one last time when cancelled.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                    _ = store.flush_requested.notified() => {}
                }
                if !store.dirty.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = store.flush().await {
                    warn!(error = %e, "settings flush failed; will retry next tick");
                }
            }

            match store.flush().await {
                Ok(()) => info!("settings flushed at shutdown"),
                Err(e) => error!(error = %e, "final settings flush failed"),
            }
        })
    }
}
