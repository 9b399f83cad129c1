//! Primary address → linked alias (LID) resolution, used for owner checks.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    domain::{normalize_id, Address, SessionId},
    persist::{read_document, write_document, Loaded},
    transport::port::DeviceStore,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub phone: String,
    pub lid: String,
    pub extracted_at: DateTime<Utc>,
}

/// On-disk layout of the identity document.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityDocument {
    last_update: DateTime<Utc>,
    #[serde(default)]
    bots: BTreeMap<SessionId, IdentityRecord>,
}

pub struct IdentityResolver {
    path: PathBuf,
    devices: Arc<dyn DeviceStore>,
    resolve_timeout: Duration,
    cache: RwLock<HashMap<SessionId, IdentityRecord>>,
    write_lock: Mutex<()>,
}

impl IdentityResolver {
    pub fn new(
        path: impl Into<PathBuf>,
        devices: Arc<dyn DeviceStore>,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            devices,
            resolve_timeout,
            cache: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> usize {
        let records = match read_document::<IdentityDocument>(&self.path).await {
            Loaded::Found(doc) => doc
                .bots
                .into_iter()
                .filter(|(_, rec)| !rec.lid.is_empty())
                .collect(),
            Loaded::Missing => HashMap::new(),
            Loaded::Corrupt(e) => {
                warn!(error = %e, "identity document unreadable, starting empty");
                HashMap::new()
            }
        };

        let count = records.len();
        *self.cache.write().await = records;
        info!(count, "identities loaded");
        count
    }

    pub async fn linked(&self, primary: &SessionId) -> Option<String> {
        self.cache
            .read()
            .await
            .get(primary)
            .map(|rec| rec.lid.clone())
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Linked alias for `primary`: cache first, then a scan of stored devices.
    pub async fn resolve(&self, primary: &SessionId) -> Option<String> {
        if let Some(lid) = self.linked(primary).await {
            return Some(lid);
        }

        let devices = match self.devices.list_devices().await {
            Ok(d) => d,
            Err(e) => {
                debug!(%primary, error = %e, "device scan failed");
                return None;
            }
        };

        let lid = devices
            .iter()
            .filter(|d| &d.session_id() == primary)
            .find_map(|d| d.linked.as_ref().filter(|a| a.is_alias()))
            .map(|a| a.bare().to_string())?;

        self.store(primary, &lid, false).await;
        Some(lid)
    }

    /// Scan every stored device once, recording all aliases found.
    pub async fn sync_from_devices(&self) -> usize {
        let devices = match self.devices.list_devices().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "identity sync skipped: device scan failed");
                return 0;
            }
        };

        let mut recorded = 0;
        for device in devices {
            let Some(lid) = device.linked.as_ref().filter(|a| a.is_alias()) else {
                continue;
            };
            if self.store(&device.session_id(), lid.bare(), false).await {
                recorded += 1;
            }
        }
        info!(recorded, "identity sync from stored devices done");
        recorded
    }

    /// Record the alias the connection reported right after authenticating.
    ///
    /// Only alias-namespace addresses are accepted; returns whether the cache changed.
    pub async fn record_from_pairing(&self, primary: &SessionId, linked: Option<&Address>) -> bool {
        match linked.filter(|a| a.is_alias()) {
            Some(lid) => self.store(primary, lid.bare(), true).await,
            None => false,
        }
    }

    /// Cache-only ownership check; never blocks on I/O.
    pub async fn is_owner(&self, primary: &SessionId, sender: &Address) -> bool {
        let sender = normalize_id(sender.bare());
        if sender.is_empty() {
            return false;
        }
        if sender == primary.as_str() {
            return true;
        }
        // Phone and alias senders are compared the same way once normalized.
        matches!(self.linked(primary).await, Some(lid) if lid == sender)
    }

    /// Ownership check that may trigger one bounded resolution on a cache miss.
    pub async fn check_owner(&self, primary: &SessionId, sender: &Address) -> bool {
        if self.is_owner(primary, sender).await {
            return true;
        }
        if self.linked(primary).await.is_some() {
            return false;
        }

        match tokio::time::timeout(self.resolve_timeout, self.resolve(primary)).await {
            Ok(Some(lid)) => lid == normalize_id(sender.bare()),
            Ok(None) => false,
            Err(_) => {
                warn!(%primary, "identity resolution timed out; treating sender as non-owner");
                false
            }
        }
    }

    pub async fn remove(&self, primary: &SessionId) -> bool {
        let removed = self.cache.write().await.remove(primary).is_some();
        if removed {
            if let Err(e) = self.persist().await {
                warn!(%primary, error = %e, "failed to persist identity removal");
            }
        }
        removed
    }

    /// Scans only fill gaps; `overwrite` is reserved for the pairing signal.
    async fn store(&self, primary: &SessionId, lid: &str, overwrite: bool) -> bool {
        let lid = normalize_id(lid);
        if lid.is_empty() {
            return false;
        }

        {
            let mut cache = self.cache.write().await;
            match cache.get(primary) {
                Some(rec) if rec.lid == lid => return false,
                Some(rec) if !overwrite => {
                    debug!(%primary, kept = %rec.lid, scanned = lid, "keeping recorded identity");
                    return false;
                }
                _ => {}
            }
            cache.insert(
                primary.clone(),
                IdentityRecord {
                    phone: primary.to_string(),
                    lid: lid.to_string(),
                    extracted_at: Utc::now(),
                },
            );
        }
        info!(%primary, lid, "linked identity recorded");

        if let Err(e) = self.persist().await {
            warn!(%primary, error = %e, "failed to persist identity document");
        }
        true
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bots = {
            let cache = self.cache.read().await;
            cache
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        let doc = IdentityDocument {
            last_update: Utc::now(),
            bots,
        };
        write_document(&self.path, &doc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevices;

    fn id(s: &str) -> SessionId {
        SessionId(s.to_string())
    }

    fn resolver(dir: &tempfile::TempDir, devices: Arc<FakeDevices>) -> IdentityResolver {
        IdentityResolver::new(
            dir.path().join("lid_storage.json"),
            devices,
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn owner_matches_any_suffix_of_the_primary() {
        let dir = tempfile::tempdir().unwrap();
        let ids = resolver(&dir, Arc::new(FakeDevices::default()));
        let me = id("923001234567");

        for raw in [
            "923001234567@s.whatsapp.net",
            "923001234567:12@s.whatsapp.net",
            "923001234567",
        ] {
            let sender: Address = raw.parse().unwrap();
            assert!(ids.is_owner(&me, &sender).await, "{raw}");
        }
        assert!(!ids.is_owner(&me, &"111111111@s.whatsapp.net".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn pairing_signal_makes_alias_owner_without_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let ids = resolver(&dir, Arc::new(FakeDevices::default()));
        let me = id("923001234567");

        let lid = Address::lid("55501").with_device(4);
        assert!(ids.record_from_pairing(&me, Some(&lid)).await);
        assert!(!ids.record_from_pairing(&me, Some(&lid)).await);

        assert!(ids.is_owner(&me, &"55501:9@lid".parse().unwrap()).await);
        assert!(ids.is_owner(&me, &"55501@lid".parse().unwrap()).await);
        assert!(!ids.is_owner(&me, &"55502@lid".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn device_scan_does_not_replace_pairing_alias() {
        let dir = tempfile::tempdir().unwrap();
        let devices = Arc::new(FakeDevices::default());
        let ids = resolver(&dir, devices.clone());
        let me = id("1001");

        assert!(ids.record_from_pairing(&me, Some(&Address::lid("9001"))).await);
        devices
            .put(Address::phone("1001"), Some(Address::lid("7777")))
            .await;

        assert_eq!(ids.sync_from_devices().await, 0);
        assert_eq!(ids.resolve(&me).await.as_deref(), Some("9001"));
        assert!(ids.is_owner(&me, &"9001@lid".parse().unwrap()).await);
        assert!(!ids.is_owner(&me, &"7777@lid".parse().unwrap()).await);

        // A newer pairing signal still wins.
        assert!(ids.record_from_pairing(&me, Some(&Address::lid("7777"))).await);
        assert_eq!(ids.linked(&me).await.as_deref(), Some("7777"));
    }

    #[tokio::test]
    async fn non_alias_pairing_address_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let ids = resolver(&dir, Arc::new(FakeDevices::default()));
        let me = id("923001234567");

        assert!(!ids.record_from_pairing(&me, Some(&Address::phone("1"))).await);
        assert!(!ids.record_from_pairing(&me, None).await);
        assert!(ids.linked(&me).await.is_none());
    }

    #[tokio::test]
    async fn check_owner_falls_back_to_device_scan() {
        let dir = tempfile::tempdir().unwrap();
        let devices = Arc::new(FakeDevices::default());
        devices
            .put(Address::phone("923001234567").with_device(2), Some(Address::lid("777")))
            .await;
        let ids = resolver(&dir, devices);
        let me = id("923001234567");

        let sender: Address = "777:3@lid".parse().unwrap();
        assert!(!ids.is_owner(&me, &sender).await);
        assert!(ids.check_owner(&me, &sender).await);
        assert_eq!(ids.linked(&me).await.as_deref(), Some("777"));
    }

    #[tokio::test]
    async fn records_survive_reload_and_removal_persists() {
        let dir = tempfile::tempdir().unwrap();
        let ids = resolver(&dir, Arc::new(FakeDevices::default()));
        ids.record_from_pairing(&id("1001"), Some(&Address::lid("9001")))
            .await;
        ids.record_from_pairing(&id("1002"), Some(&Address::lid("9002")))
            .await;

        let fresh = resolver(&dir, Arc::new(FakeDevices::default()));
        assert_eq!(fresh.load().await, 2);
        assert!(fresh.remove(&id("1001")).await);

        let again = resolver(&dir, Arc::new(FakeDevices::default()));
        assert_eq!(again.load().await, 1);
        assert_eq!(again.linked(&id("1002")).await.as_deref(), Some("9002"));
    }

    #[tokio::test]
    async fn sync_records_only_alias_devices() {
        let dir = tempfile::tempdir().unwrap();
        let devices = Arc::new(FakeDevices::default());
        devices
            .put(Address::phone("1001"), Some(Address::lid("9001")))
            .await;
        devices
            .put(Address::phone("1002"), Some(Address::phone("1002")))
            .await;
        devices.put(Address::phone("1003"), None).await;

        let ids = resolver(&dir, devices);
        assert_eq!(ids.sync_from_devices().await, 1);
        assert_eq!(ids.len().await, 1);
    }

    #[tokio::test]
    async fn malformed_document_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lid_storage.json"), "{\"bots\": 12").unwrap();
        let ids = resolver(&dir, Arc::new(FakeDevices::default()));
        assert_eq!(ids.load().await, 0);
    }
}
