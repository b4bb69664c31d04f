//! Applies settings versions to the local node
//!
//! Applications are serialized: while one version is being applied, newer
//! submissions wait in a single pending slot and only the newest one is
//! applied next. The driver is the only writer of the applied serial.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::db::{execute_async, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::services::collaborators::{ContainerManager, NodeContext, ServiceConfigRenderer};
use crate::services::identity::{self, LocalNode};
use crate::services::settings_store::{SettingsStore, SettingsVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Apply only when newer than the applied version
    Forward,
    /// Apply whenever the serial differs from the applied version
    Resync,
    /// Render the applied version again after a restart
    Reapply,
}

impl ApplyMode {
    fn wants(&self, serial: i64, applied: i64) -> bool {
        match self {
            ApplyMode::Forward => serial > applied,
            ApplyMode::Resync => serial != applied,
            ApplyMode::Reapply => serial == applied,
        }
    }
}

struct Job {
    version: Arc<SettingsVersion>,
    mode: ApplyMode,
    node: LocalNode,
}

pub struct ReconfigurationDriver {
    db: DbPool,
    store: Arc<SettingsStore>,
    renderers: Vec<Arc<dyn ServiceConfigRenderer>>,
    containers: Arc<dyn ContainerManager>,
    services_dir: Option<PathBuf>,
    applied: AtomicI64,
    reconfigure_count: AtomicU64,
    applying: AtomicBool,
    pending: Mutex<Option<Job>>,
    apply_lock: tokio::sync::Mutex<()>,
    applied_tx: watch::Sender<i64>,
}

impl ReconfigurationDriver {
    pub fn new(
        db: DbPool,
        store: Arc<SettingsStore>,
        renderers: Vec<Arc<dyn ServiceConfigRenderer>>,
        containers: Arc<dyn ContainerManager>,
        services_dir: Option<PathBuf>,
    ) -> Self {
        let (applied_tx, _) = watch::channel(0);
        Self {
            db,
            store,
            renderers,
            containers,
            services_dir,
            applied: AtomicI64::new(0),
            reconfigure_count: AtomicU64::new(0),
            applying: AtomicBool::new(false),
            pending: Mutex::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
            applied_tx,
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<Job>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn applied_serial(&self) -> i64 {
        self.applied.load(Ordering::Acquire)
    }

    pub fn reconfigure_count(&self) -> u64 {
        self.reconfigure_count.load(Ordering::Relaxed)
    }

    /// True while a version is being applied or waiting to be
    pub fn is_reconfiguring(&self) -> bool {
        self.applying.load(Ordering::Acquire) || self.pending().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.applied_tx.subscribe()
    }

    pub fn services(&self) -> Vec<(String, bool)> {
        self.renderers
            .iter()
            .map(|r| (r.service().to_string(), r.critical()))
            .collect()
    }

    pub fn containers(&self) -> &Arc<dyn ContainerManager> {
        &self.containers
    }

    /// Persist a version and queue it for application.
    ///
    /// Returns whether the version was queued. When no other application
    /// is running, the queue is drained before this returns.
    pub async fn submit(
        &self,
        version: SettingsVersion,
        mode: ApplyMode,
        node: LocalNode,
    ) -> CoreResult<bool> {
        if !mode.wants(version.serial, self.applied_serial()) {
            debug!("Settings {} already applied, skipping", version.serial);
            return Ok(false);
        }

        let version = self.store.append(version).await?;
        self.enqueue(Job {
            version,
            mode,
            node,
        });
        self.drain().await;
        Ok(true)
    }

    /// Take over the serial applied before a restart and queue it to be
    /// rendered again. Until then it is what this node serves.
    pub fn restore(&self, version: Arc<SettingsVersion>, node: LocalNode) {
        info!("Restoring applied settings version {}", version.serial);
        self.applied.store(version.serial, Ordering::Release);
        self.applied_tx.send_replace(version.serial);
        self.enqueue(Job {
            version,
            mode: ApplyMode::Reapply,
            node,
        });
    }

    fn enqueue(&self, job: Job) {
        let mut pending = self.pending();
        let replace = match pending.as_ref() {
            None => true,
            Some(current) => job.mode != ApplyMode::Forward || job.version.serial > current.version.serial,
        };
        if replace {
            if let Some(skipped) = pending.as_ref() {
                debug!(
                    "Settings {} superseded by {} before being applied",
                    skipped.version.serial, job.version.serial
                );
            }
            *pending = Some(job);
        }
    }

    /// Apply pending versions unless another task already is
    pub async fn drain(&self) {
        loop {
            let Ok(_guard) = self.apply_lock.try_lock() else {
                return;
            };

            loop {
                let job = self.pending().take();
                let Some(job) = job else {
                    break;
                };
                self.applying.store(true, Ordering::Release);
                if let Err(e) = self.apply(job).await {
                    error!("Failed to apply settings: {}", e);
                }
                self.applying.store(false, Ordering::Release);
            }

            drop(_guard);
            if self.pending().is_none() {
                return;
            }
        }
    }

    async fn apply(&self, job: Job) -> CoreResult<()> {
        let serial = job.version.serial;
        if !job.mode.wants(serial, self.applied_serial()) {
            debug!("Settings {} already applied, skipping", serial);
            return Ok(());
        }

        info!("Applying settings version {} ({:?})", serial, job.mode);
        let ctx = NodeContext {
            node: job.node,
            settings: job.version,
        };

        let mut rendered = Vec::with_capacity(self.renderers.len());
        for renderer in &self.renderers {
            let config = renderer
                .resolve_service_configuration(&ctx)
                .await
                .map_err(|e| CoreError::Internal(format!("render {}: {:#}", renderer.service(), e)))?;
            rendered.push(config);
        }

        if let Some(dir) = &self.services_dir {
            for config in &rendered {
                let service_dir = dir.join(&config.service);
                tokio::fs::create_dir_all(&service_dir)
                    .await
                    .map_err(|e| CoreError::FsWriteFailed(format!("{:?}: {}", service_dir, e)))?;
                for (name, contents) in &config.files {
                    let path = service_dir.join(name);
                    tokio::fs::write(&path, contents)
                        .await
                        .map_err(|e| CoreError::FsWriteFailed(format!("{:?}: {}", path, e)))?;
                }
            }
        }

        for config in &rendered {
            self.containers
                .restart(&config.service)
                .await
                .map_err(|e| CoreError::Internal(format!("restart {}: {:#}", config.service, e)))?;
        }

        self.applied.store(serial, Ordering::Release);
        self.reconfigure_count.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = execute_async(&self.db, move |conn| identity::set_applied_serial(conn, serial)).await {
            error!("Failed to record applied settings serial {}: {:#}", serial, e);
        }
        self.applied_tx.send_replace(serial);

        info!("Settings version {} applied", serial);
        Ok(())
    }
}
