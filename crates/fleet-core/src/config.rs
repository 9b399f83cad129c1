use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

const MIN_PAIRING_DEADLINE: Duration = Duration::from_secs(60);
const MAX_PAIRING_DEADLINE: Duration = Duration::from_secs(120);

/// Typed configuration for the fleet process.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub data_dir: PathBuf,
    pub settings_file: PathBuf,
    pub identity_file: PathBuf,
    pub device_dir: PathBuf,

    // Background loops
    pub flush_interval: Duration,
    pub keepalive_interval: Duration,

    // Pairing
    pub pairing_deadline: Duration,
    pub pairing_poll_interval: Duration,
    pub pairing_min_digits: usize,

    // Routing / authorization
    pub max_message_age: Duration,
    pub lid_resolve_timeout: Duration,
    pub default_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_data_dir("./data")
    }
}

impl Config {
    /// Defaults rooted at `data_dir`, without consulting the environment.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            settings_file: data_dir.join("settings.json"),
            identity_file: data_dir.join("lid_storage.json"),
            device_dir: data_dir.join("devices"),
            data_dir,
            flush_interval: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            pairing_deadline: MIN_PAIRING_DEADLINE,
            pairing_poll_interval: Duration::from_secs(1),
            pairing_min_digits: 8,
            max_message_age: Duration::from_secs(60),
            lid_resolve_timeout: Duration::from_millis(3000),
            default_prefix: ".".to_string(),
        }
    }

    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let data_dir = env_path("FLEET_DATA_DIR").unwrap_or_else(|| PathBuf::from("./data"));
        let mut cfg = Self::with_data_dir(&data_dir);

        if let Some(p) = env_path("FLEET_SETTINGS_FILE") {
            cfg.settings_file = p;
        }
        if let Some(p) = env_path("FLEET_LID_FILE") {
            cfg.identity_file = p;
        }
        if let Some(p) = env_path("FLEET_DEVICE_DIR") {
            cfg.device_dir = p;
        }

        if let Some(secs) = env_u64("FLUSH_INTERVAL_SECS") {
            cfg.flush_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("KEEPALIVE_INTERVAL_SECS") {
            cfg.keepalive_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(secs) = env_u64("PAIRING_DEADLINE_SECS") {
            cfg.pairing_deadline =
                Duration::from_secs(secs).clamp(MIN_PAIRING_DEADLINE, MAX_PAIRING_DEADLINE);
        }
        if let Some(ms) = env_u64("PAIRING_POLL_MS") {
            cfg.pairing_poll_interval = Duration::from_millis(ms.clamp(100, 5_000));
        }
        if let Some(n) = env_usize("PAIRING_MIN_DIGITS") {
            if n == 0 || n > crate::domain::MAX_PHONE_DIGITS {
                return Err(Error::Config(format!(
                    "PAIRING_MIN_DIGITS must be between 1 and {}",
                    crate::domain::MAX_PHONE_DIGITS
                )));
            }
            cfg.pairing_min_digits = n;
        }

        if let Some(secs) = env_u64("MAX_MESSAGE_AGE_SECS") {
            cfg.max_message_age = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("LID_RESOLVE_TIMEOUT_MS") {
            cfg.lid_resolve_timeout = Duration::from_millis(ms);
        }

        if let Some(prefix) = env_str("DEFAULT_PREFIX") {
            let prefix = prefix.trim().to_string();
            if prefix.is_empty() {
                return Err(Error::Config("DEFAULT_PREFIX must not be empty".to_string()));
            }
            cfg.default_prefix = prefix;
        }

        // Persistent volume must exist before the first flush.
        fs::create_dir_all(&cfg.data_dir)?;
        fs::create_dir_all(&cfg.device_dir)?;

        Ok(cfg)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
