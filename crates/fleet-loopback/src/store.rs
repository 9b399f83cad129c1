use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use fleet_core::{
    domain::SessionId,
    persist::{read_document, write_document, Loaded},
    transport::{port::DeviceStore, types::DeviceRecord},
    Result,
};

/// Stored device credentials, one JSON document per session: `<dir>/<id>.json`.
pub struct FileDeviceStore {
    dir: PathBuf,
}

impl FileDeviceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn save(&self, device: &DeviceRecord) -> Result<()> {
        let path = self.path_for(&device.session_id());
        write_document(&path, device).await?;
        debug!(path = %path.display(), "device stored");
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for FileDeviceStore {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_document::<DeviceRecord>(&path).await {
                Loaded::Found(device) => out.push(device),
                Loaded::Missing => {}
                Loaded::Corrupt(e) => warn!(error = %e, "skipping unreadable device file"),
            }
        }
        out.sort_by(|a, b| a.address.user.cmp(&b.address.user));
        Ok(out)
    }

    async fn delete_device(&self, id: &SessionId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use fleet_core::domain::Address;

    use super::*;

    #[tokio::test]
    async fn save_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDeviceStore::new(dir.path().join("devices"));
        assert!(store.list_devices().await.unwrap().is_empty());

        let device = DeviceRecord {
            address: Address::phone("923001234567").with_device(4),
            linked: Some(Address::lid("123456789012345")),
            registered_at: Utc::now(),
        };
        store.save(&device).await.unwrap();
        std::fs::write(dir.path().join("devices/broken.json"), "nope").unwrap();
        std::fs::write(dir.path().join("devices/notes.txt"), "ignored").unwrap();

        assert_eq!(store.list_devices().await.unwrap(), vec![device.clone()]);

        store.delete_device(&device.session_id()).await.unwrap();
        store.delete_device(&device.session_id()).await.unwrap();
        assert!(store.list_devices().await.unwrap().is_empty());
    }
}
