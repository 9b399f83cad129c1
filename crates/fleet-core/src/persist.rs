//! Flat JSON documents on disk.
//!
//! Documents are always rewritten whole: serialized to a sibling temp file and
//! renamed over the target, so a crash mid-write leaves the previous version.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::{errors::Error, Result};

/// Outcome of reading a durable document.
#[derive(Debug)]
pub enum Loaded<T> {
    Found(T),
    Missing,
    /// Present but unreadable or malformed; callers start from an empty table.
    Corrupt(Error),
}

pub async fn read_document<T: DeserializeOwned>(path: &Path) -> Loaded<T> {
    let txt = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Loaded::Missing,
        Err(e) => return Loaded::Corrupt(persistence_err(path, e)),
    };
    if txt.trim().is_empty() {
        return Loaded::Missing;
    }
    match serde_json::from_str(&txt) {
        Ok(v) => Loaded::Found(v),
        Err(e) => Loaded::Corrupt(persistence_err(path, e)),
    }
}

pub async fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let txt = serde_json::to_string_pretty(value)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| persistence_err(path, e))?;
    }

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, txt)
        .await
        .map_err(|e| persistence_err(path, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| persistence_err(path, e))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn persistence_err(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
