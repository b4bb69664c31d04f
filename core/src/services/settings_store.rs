//! Append-only store of settings versions
//!
//! Versions are written to SQLite before they become visible through the
//! in-memory index, so a failed write never leaves a version referenced.
//! Key bundles are sealed field by field with the node-local at-rest key.

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::crypto::{open_bundle, seal_bundle, Cipher, KeyBundle};
use crate::db::{execute_async, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::services::checksum;
use crate::types::{now_ms, SettingsPayload, SettingsRef};

/// One immutable settings version
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsVersion {
    pub serial: i64,
    pub data: Value,
    pub checksum: String,
    pub keys: KeyBundle,
}

impl SettingsVersion {
    pub fn new(serial: i64, data: Value, keys: KeyBundle) -> Self {
        let checksum = checksum::checksum(&data);
        Self {
            serial,
            data,
            checksum,
            keys,
        }
    }

    /// Accept a version received from a peer, verifying its checksum
    pub fn from_payload(payload: SettingsPayload) -> CoreResult<Self> {
        if !checksum::verify(&payload.data, &payload.checksum) {
            return Err(CoreError::ChecksumMismatch {
                serial: payload.serial,
                actual: checksum::checksum(&payload.data),
                expected: payload.checksum,
            });
        }
        Ok(Self {
            serial: payload.serial,
            data: payload.data,
            checksum: payload.checksum,
            keys: payload.keys,
        })
    }

    pub fn to_payload(&self) -> SettingsPayload {
        SettingsPayload {
            serial: self.serial,
            data: self.data.clone(),
            checksum: self.checksum.clone(),
            keys: self.keys.clone(),
        }
    }

    pub fn to_ref(&self) -> SettingsRef {
        SettingsRef {
            serial: self.serial,
            data: self.data.clone(),
        }
    }
}

pub struct SettingsStore {
    db: DbPool,
    rest: Cipher,
    versions: RwLock<BTreeMap<i64, Arc<SettingsVersion>>>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    /// Open the store and load every persisted version
    pub async fn open(db: DbPool, rest: Cipher) -> Result<Self> {
        let cipher = rest.clone();
        let loaded = execute_async(&db, move |conn| load_versions(conn, &cipher)).await?;
        if !loaded.is_empty() {
            info!("Loaded {} settings version(s)", loaded.len());
        }

        let versions = loaded
            .into_iter()
            .map(|v| (v.serial, Arc::new(v)))
            .collect();

        Ok(Self {
            db,
            rest,
            versions: RwLock::new(versions),
            write_lock: Mutex::new(()),
        })
    }

    /// Persist a new version. Appending a serial that is already stored is a
    /// no-op when the content matches and an error otherwise.
    pub async fn append(&self, version: SettingsVersion) -> CoreResult<Arc<SettingsVersion>> {
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.versions.read().await.get(&version.serial) {
            if existing.checksum == version.checksum {
                debug!("Settings version {} already stored", version.serial);
                return Ok(existing.clone());
            }
            return Err(CoreError::SettingsInvalid(format!(
                "settings serial {} already exists with different content",
                version.serial
            )));
        }

        let sealed = seal_bundle(&version.keys, &self.rest)
            .map_err(|e| CoreError::FsWriteFailed(format!("key bundle: {:#}", e)))?;
        let row = version.clone();
        execute_async(&self.db, move |conn| insert_version(conn, &row, &sealed))
            .await
            .map_err(|e| CoreError::FsWriteFailed(format!("settings {}: {:#}", version.serial, e)))?;

        let version = Arc::new(version);
        self.versions
            .write()
            .await
            .insert(version.serial, version.clone());

        info!("Stored settings version {}", version.serial);
        Ok(version)
    }

    pub async fn latest(&self) -> Option<Arc<SettingsVersion>> {
        self.versions.read().await.values().next_back().cloned()
    }

    pub async fn latest_serial(&self) -> i64 {
        self.versions
            .read()
            .await
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    pub async fn get(&self, serial: i64) -> Option<Arc<SettingsVersion>> {
        self.versions.read().await.get(&serial).cloned()
    }

    pub async fn serials(&self) -> Vec<i64> {
        self.versions.read().await.keys().copied().collect()
    }
}

/// Encrypt every plain string under `tokens.secrets`. Values that are
/// already encrypted are left as they are.
pub fn seal_secrets(data: &mut Value, cipher: &Cipher) -> Result<()> {
    let Some(secrets) = data
        .get_mut("tokens")
        .and_then(|t| t.get_mut("secrets"))
        .and_then(Value::as_object_mut)
    else {
        return Ok(());
    };

    for (name, value) in secrets.iter_mut() {
        let plain = match &*value {
            Value::String(s) if Cipher::is_encrypted(s) => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let sealed = cipher
            .encrypt(&plain)
            .with_context(|| format!("Failed to encrypt secret {}", name))?;
        *value = Value::String(sealed);
    }

    Ok(())
}

fn insert_version(
    conn: &Connection,
    version: &SettingsVersion,
    sealed: &BTreeMap<String, String>,
) -> Result<()> {
    let data = serde_json::to_string(&version.data).context("Failed to serialize settings")?;
    let keys = serde_json::to_string(sealed).context("Failed to serialize keys")?;

    conn.execute(
        "INSERT INTO settings_versions (serial, data, checksum, keys, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![version.serial, data, version.checksum, keys, now_ms()],
    )
    .context("Failed to insert settings version")?;

    Ok(())
}

fn load_versions(conn: &Connection, rest: &Cipher) -> Result<Vec<SettingsVersion>> {
    let mut stmt = conn
        .prepare("SELECT serial, data, checksum, keys FROM settings_versions ORDER BY serial")
        .context("Failed to prepare statement")?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .context("Failed to query settings versions")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect settings versions")?;

    rows.into_iter()
        .map(|(serial, data, checksum, keys)| {
            let sealed: BTreeMap<String, String> =
                serde_json::from_str(&keys).context("Failed to parse stored keys")?;
            Ok(SettingsVersion {
                serial,
                data: serde_json::from_str(&data).context("Failed to parse stored settings")?,
                checksum,
                keys: open_bundle(&sealed, rest)
                    .with_context(|| format!("Failed to open keys of settings {}", serial))?,
            })
        })
        .collect()
}
