//! The cluster coordinator
//!
//! One `Coordinator` owns every component of a node: settings store, node
//! registry, leader elector and reconfiguration driver. Handlers and
//! background loops share it through an `Arc`. Nothing lives in globals, so
//! several coordinators can run side by side in one process.

use anyhow::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::crypto::{generate_key_bundle, load_or_create_rest_key, Cipher};
use crate::db::{execute_async, init_db, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::peer_client::PeerClient;
use crate::services::collaborators::{
    default_renderers, ContainerManager, LocalContainerManager, ServiceConfigRenderer,
};
use crate::services::election::LeaderElector;
use crate::services::heartbeat::heartbeat_loop;
use crate::services::heartbeat_monitor::heartbeat_monitor;
use crate::services::identity::{self, LocalNode};
use crate::services::node_registry::{self, hostname_of, NodeRegistry};
use crate::services::reconfigure::{ApplyMode, ReconfigurationDriver};
use crate::services::settings_store::{seal_secrets, SettingsStore, SettingsVersion};
use crate::services::status::{HealthCheck, StatusAggregator, StatusInputs};
use crate::types::{
    now_ms, CaCertificateResponse, ClusterRef, InfoBlock, LocalNodeStatus, NodeRef, NodeRole,
    NodeView, ReloadResponse, RootToken, SettingsListResponse, SettingsPayload, SettingsResponse,
    SettingsVersionResponse, SetupResponse, SetupUuids, StatusBlock, StatusResponse, SyncRequest,
};
use crate::validation::{
    broker_nodes, display_name, flanking_nodes, fqdn_from_host, normalize_settings,
};

/// External collaborators a coordinator is built with
pub struct Collaborators {
    pub peers: Arc<dyn PeerClient>,
    pub renderers: Vec<Arc<dyn ServiceConfigRenderer>>,
    pub containers: Arc<dyn ContainerManager>,
}

impl Collaborators {
    /// Default renderers and an in-process container manager
    pub fn with_peers(peers: Arc<dyn PeerClient>) -> Self {
        Self {
            peers,
            renderers: default_renderers(),
            containers: Arc::new(LocalContainerManager::new()),
        }
    }
}

pub struct Coordinator {
    pub(crate) config: CoreConfig,
    pub(crate) db: DbPool,
    pub(crate) store: Arc<SettingsStore>,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) elector: Arc<LeaderElector>,
    pub(crate) driver: Arc<ReconfigurationDriver>,
    pub(crate) peers: Arc<dyn PeerClient>,
    pub(crate) aggregator: StatusAggregator,
    pub(crate) heartbeat_failures: AtomicU32,
    pub(crate) joining: AtomicBool,
    pub(crate) install_lock: Mutex<()>,
    identity: RwLock<Option<LocalNode>>,
    ephemeral_uuid: Uuid,
    started: Instant,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Open the database, restore any persisted identity and build the
    /// components. Background loops are started separately with [`start`].
    ///
    /// [`start`]: Coordinator::start
    pub async fn open(config: CoreConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let db = init_db(config.db_path())?;
        let rest_key = match config.rest_key_path() {
            Some(path) => load_or_create_rest_key(&path)?,
            None => rand::random(),
        };

        let store = Arc::new(SettingsStore::open(db.clone(), Cipher::from_key(rest_key)).await?);
        let registry = Arc::new(NodeRegistry::new());
        let elector = Arc::new(LeaderElector::new(registry.clone(), config.liveness_window()));
        let driver = Arc::new(ReconfigurationDriver::new(
            db.clone(),
            store.clone(),
            collaborators.renderers,
            collaborators.containers,
            config.data_dir.as_ref().map(|dir| dir.join("services")),
        ));

        let stored = execute_async(&db, identity::load_identity).await?;

        let coordinator = Arc::new(Self {
            config,
            db,
            store,
            registry,
            elector,
            driver,
            peers: collaborators.peers,
            aggregator: StatusAggregator::new(),
            heartbeat_failures: AtomicU32::new(0),
            joining: AtomicBool::new(false),
            install_lock: Mutex::new(()),
            identity: RwLock::new(None),
            ephemeral_uuid: Uuid::new_v4(),
            started: Instant::now(),
            cancel: CancellationToken::new(),
        });

        match stored {
            Some((local, applied)) => {
                info!(
                    "Restoring node {} (serial {}) of cluster {}, last applied settings {}",
                    local.fqdn, local.serial, local.cluster, applied
                );
                let rows = execute_async(&coordinator.db, node_registry::load_nodes).await?;
                coordinator.registry.load(rows, local.uuid).await;

                let restored = match coordinator.store.get(applied).await {
                    Some(version) => Some(version),
                    None => coordinator.store.latest().await,
                };
                if let Some(version) = restored {
                    coordinator.driver.restore(version, local.clone());
                    let driver = coordinator.driver.clone();
                    tokio::spawn(async move { driver.drain().await });
                }
                coordinator.install(local).await;
            }
            None => info!(
                "No cluster identity found, starting in ephemeral mode ({})",
                coordinator.ephemeral_uuid
            ),
        }

        Ok(coordinator)
    }

    /// Spawn the background loops
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let cancel = self.cancel.clone();
        let mut handles = vec![tokio::spawn(self.elector.clone().run(cancel.clone()))];

        let me = self.clone();
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            heartbeat_loop(me, token).await;
        }));

        let me = self.clone();
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = heartbeat_monitor(me, token).await {
                error!("Heartbeat monitor failed: {}", e);
            }
        }));

        handles.push(tokio::spawn(self.clone().watch_applied(cancel.clone())));
        handles.push(tokio::spawn(self.clone().watch_leadership(cancel)));
        handles
    }

    /// Stop emitting heartbeats and end the background loops. There is no
    /// leadership handoff; peers notice through the liveness window.
    pub fn shutdown(&self) {
        info!("Shutting down coordinator");
        self.cancel.cancel();
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    pub fn driver(&self) -> &Arc<ReconfigurationDriver> {
        &self.driver
    }

    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    pub async fn local(&self) -> Option<LocalNode> {
        self.identity.read().await.clone()
    }

    pub async fn is_ephemeral(&self) -> bool {
        self.identity.read().await.is_none()
    }

    pub fn is_reloading(&self) -> bool {
        self.driver.is_reconfiguring()
    }

    pub(crate) async fn require_local(&self) -> CoreResult<LocalNode> {
        self.local().await.ok_or(CoreError::EphemeralProhibited)
    }

    pub fn uptime(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub(crate) fn node_ref(local: &LocalNode) -> NodeRef {
        NodeRef {
            fqdn: local.fqdn.clone(),
            uuid: local.uuid,
            serial: local.serial,
        }
    }

    /// Registry entry describing this node right now
    pub(crate) fn local_view(&self, local: &LocalNode) -> NodeView {
        NodeView {
            uuid: local.uuid,
            serial: local.serial,
            fqdn: local.fqdn.clone(),
            hostname: hostname_of(&local.fqdn),
            ip: None,
            role: local.role,
            settings_serial: self.driver.applied_serial(),
            ephemeral: false,
            uptime_seconds: self.uptime(),
            reconfigure_count: self.driver.reconfigure_count(),
            version: self.config.version.clone(),
            last_seen: now_ms(),
            reachable: true,
        }
    }

    pub(crate) async fn refresh_local(&self, local: &LocalNode) {
        self.registry.upsert_local(self.local_view(local)).await;
    }

    /// The version this node runs, and serves when leading. Versions that
    /// were stored but later abandoned through a resync never qualify.
    pub async fn current_settings(&self) -> Option<Arc<SettingsVersion>> {
        match self.driver.applied_serial() {
            0 => self.store.latest().await,
            applied => self.store.get(applied).await,
        }
    }

    /// Adopt an identity and point the elector at it
    async fn install(&self, local: LocalNode) {
        let brokers = self
            .current_settings()
            .await
            .map(|v| broker_nodes(&v.data))
            .unwrap_or_default();

        *self.identity.write().await = Some(local.clone());
        self.refresh_local(&local).await;
        self.heartbeat_failures.store(0, Ordering::Relaxed);
        self.elector.configure(local.as_leader_ref(), brokers);
        self.elector.evaluate().await;
    }

    /// Identity, version and registry are persisted, then the node leaves
    /// ephemeral mode. The caller holds the install lock.
    pub(crate) async fn adopt(&self, local: LocalNode) -> CoreResult<()> {
        let row = local.clone();
        execute_async(&self.db, move |conn| identity::save_identity(conn, &row))
            .await
            .map_err(|e| CoreError::FsWriteFailed(format!("identity: {:#}", e)))?;

        self.registry.register(self.local_view(&local)).await?;
        self.install(local).await;

        if let Err(e) = self.persist_registry().await {
            warn!("Failed to persist node registry: {:#}", e);
        }
        Ok(())
    }

    pub(crate) fn spawn_apply(&self, version: SettingsVersion, mode: ApplyMode, local: LocalNode) {
        let driver = self.driver.clone();
        tokio::spawn(async move {
            let serial = version.serial;
            if let Err(e) = driver.submit(version, mode, local).await {
                error!("Failed to queue settings {}: {}", serial, e);
            }
        });
    }

    pub(crate) async fn persist_registry(&self) -> Result<()> {
        let rows: Vec<NodeView> = self.registry.snapshot().await.into_values().collect();
        execute_async(&self.db, move |conn| node_registry::persist_nodes(conn, &rows)).await
    }

    pub(crate) async fn leader_hint(&self) -> String {
        match self.elector.current_leader() {
            Some(leader) => match self.registry.get(leader.uuid).await {
                Some(node) => format!("the cluster leader is {} (serial {})", node.fqdn, node.serial),
                None => format!("the cluster leader is node serial {}", leader.serial),
            },
            None => "no cluster leader has been elected".to_string(),
        }
    }

    // ========================================================================
    // Setup and settings
    // ========================================================================

    /// Bootstrap the first node of a new cluster
    pub async fn setup(&self, body: Value, host: Option<String>) -> CoreResult<SetupResponse> {
        let _guard = self.install_lock.lock().await;
        if !self.is_ephemeral().await || self.joining.load(Ordering::Acquire) {
            return Err(CoreError::EphemeralRequired);
        }

        let mut body = body;
        let header_host = body
            .as_object_mut()
            .and_then(|o| o.remove("headers"))
            .and_then(|h| {
                h.get("x-forwarded-host")
                    .or_else(|| h.get("host"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

        let mut data = normalize_settings(body)?;

        let fqdn = self
            .config
            .fqdn
            .as_ref()
            .map(|f| f.to_lowercase())
            .or_else(|| host.as_deref().and_then(fqdn_from_host))
            .or_else(|| header_host.as_deref().and_then(fqdn_from_host))
            .ok_or(CoreError::FqdnMismatch)?;

        let index = broker_nodes(&data)
            .iter()
            .position(|n| n == &fqdn)
            .ok_or(CoreError::FqdnMismatch)?;

        let cluster = Uuid::new_v4();
        let name = display_name(&data);
        let keys = generate_key_bundle(cluster, &name)?;
        seal_secrets(&mut data, &Cipher::from_secret(&keys.mrt))?;

        let version = self
            .store
            .append(SettingsVersion::new(now_ms(), data, keys.clone()))
            .await?;

        let local = LocalNode {
            uuid: Uuid::new_v4(),
            serial: (index + 1) as u8,
            fqdn,
            role: NodeRole::BrokerNode,
            cluster,
            cluster_name: name,
        };
        self.adopt(local.clone()).await?;
        self.spawn_apply((*version).clone(), ApplyMode::Forward, local.clone());

        info!(
            "Cluster {} set up on {} (serial {}), settings {}",
            cluster, local.fqdn, local.serial, version.serial
        );

        Ok(SetupResponse {
            result: "success".to_string(),
            uuids: SetupUuids {
                node: local.uuid,
                cluster,
            },
            root_token: RootToken {
                about: "This is the Morio root token. Store it safely, it will not be shown again."
                    .to_string(),
                value: keys.mrt,
            },
        })
    }

    /// Store a new settings version on the leader and queue it
    pub async fn update_settings(&self, body: Value) -> CoreResult<SettingsResponse> {
        let local = self.require_local().await?;
        if !self.elector.is_leading() {
            return Err(CoreError::LeaderRequired(self.leader_hint().await));
        }

        let mut data = normalize_settings(body)?;
        if !broker_nodes(&data).contains(&local.fqdn) && !flanking_nodes(&data).contains(&local.fqdn) {
            return Err(CoreError::FqdnMismatch);
        }

        let current = self
            .current_settings()
            .await
            .ok_or_else(|| CoreError::Internal("no settings version to build on".to_string()))?;
        // Above every stored serial, abandoned ones included
        let serial = now_ms().max(self.store.latest_serial().await + 1);
        seal_secrets(&mut data, &Cipher::from_secret(&current.keys.mrt))?;

        let version = self
            .store
            .append(SettingsVersion::new(serial, data, current.keys.clone()))
            .await?;
        self.spawn_apply((*version).clone(), ApplyMode::Forward, local);

        info!("New settings version {} stored", serial);
        Ok(SettingsResponse {
            result: "success".to_string(),
            serial,
            settings: version.data.clone(),
        })
    }

    /// Every stored version, superseded and abandoned ones included
    pub async fn list_settings(&self) -> CoreResult<SettingsListResponse> {
        self.require_local().await?;
        Ok(SettingsListResponse {
            current: self.driver.applied_serial(),
            serials: self.store.serials().await,
        })
    }

    /// One stored version; `None` asks for the one this node runs
    pub async fn settings_version(&self, serial: Option<i64>) -> CoreResult<SettingsVersionResponse> {
        self.require_local().await?;
        let version = match serial {
            Some(serial) => self.store.get(serial).await,
            None => self.current_settings().await,
        }
        .ok_or(CoreError::SettingsNotFound(serial.unwrap_or_default()))?;

        Ok(SettingsVersionResponse {
            serial: version.serial,
            checksum: version.checksum.clone(),
            current: version.serial == self.driver.applied_serial(),
            settings: version.data.clone(),
        })
    }

    /// Serve the authoritative settings version to a follower
    pub async fn handle_sync(&self, req: SyncRequest) -> CoreResult<SettingsPayload> {
        let local = self.require_local().await?;
        if req.cluster.uuid != local.cluster {
            return Err(CoreError::ClusterMismatch {
                expected: local.cluster.to_string(),
                actual: req.cluster.uuid.to_string(),
            });
        }
        if !self.elector.is_leading() {
            return Err(CoreError::LeaderRequired(self.leader_hint().await));
        }

        let current = self
            .current_settings()
            .await
            .ok_or_else(|| CoreError::Internal("no settings version".to_string()))?;
        info!(
            "Serving settings {} to {} (at {})",
            current.serial, req.from.fqdn, req.settings_serial
        );
        Ok(current.to_payload())
    }

    /// Pull the authoritative version from the leader and apply it
    pub(crate) async fn pull_settings(&self, local: &LocalNode, leader_fqdn: &str) {
        let req = SyncRequest {
            from: Self::node_ref(local),
            cluster: ClusterRef {
                uuid: local.cluster,
            },
            settings_serial: self.driver.applied_serial(),
        };

        let payload = match self.peers.sync(leader_fqdn, &req).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to pull settings from {}: {}", leader_fqdn, e);
                return;
            }
        };

        match SettingsVersion::from_payload(payload) {
            Ok(version) => {
                if let Err(e) = self.driver.submit(version, ApplyMode::Resync, local.clone()).await {
                    error!("Failed to apply pulled settings: {}", e);
                }
            }
            Err(e) => warn!("Dropping settings pulled from {}: {}", leader_fqdn, e),
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn info(&self) -> InfoBlock {
        InfoBlock {
            about: "Morio Core".to_string(),
            name: self.config.name.clone(),
            production: self.config.production,
            version: self.config.version.clone(),
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let local = self.local().await;
        let nodes = self.registry.snapshot().await;
        let applied = self.driver.applied_serial();
        let reconfiguring = self.driver.is_reconfiguring();
        let leader = self.elector.current_leader();

        let (brokers, flanking) = match self.current_settings().await {
            Some(current) => (broker_nodes(&current.data), flanking_nodes(&current.data)),
            None => (Vec::new(), Vec::new()),
        };
        let is_reachable = |fqdn: &String| nodes.values().any(|n| &n.fqdn == fqdn && n.reachable);

        let mut checks = Vec::new();
        if local.is_some() && applied > 0 {
            for (service, critical) in self.driver.services() {
                let ok = self.driver.containers().is_running(&service).await;
                checks.push(HealthCheck {
                    name: service,
                    critical,
                    ok,
                });
            }
        }

        let inputs = StatusInputs {
            ephemeral: local.is_none(),
            reconfiguring,
            leading: self.elector.is_leading(),
            leader,
            elected: self.elector.has_elected(),
            leader_settings_serial: leader
                .and_then(|l| nodes.get(&l.uuid))
                .map(|n| n.settings_serial),
            local_settings_serial: applied,
            expected_brokers: brokers.len(),
            reachable_brokers: brokers.iter().filter(|f| is_reachable(f)).count(),
            unreachable_nodes: brokers
                .iter()
                .chain(flanking.iter())
                .filter(|f| !is_reachable(f))
                .cloned()
                .collect(),
            checks,
        };
        let cluster = self.aggregator.aggregate(&inputs, now_ms());

        StatusResponse {
            info: self.info(),
            status: StatusBlock { cluster },
            node: LocalNodeStatus {
                uptime: self.uptime(),
                ephemeral: local.is_none(),
                ephemeral_uuid: self.ephemeral_uuid,
                reconfigure_count: self.driver.reconfigure_count(),
                config_resolved: applied > 0 && !reconfiguring,
                settings_serial: applied,
                serial: local.as_ref().map(|l| l.serial),
                uuid: local.as_ref().map(|l| l.uuid),
                fqdn: local.as_ref().map(|l| l.fqdn.clone()),
            },
            nodes,
        }
    }

    /// Everything the front-end API needs to bootstrap
    pub async fn reload(&self) -> ReloadResponse {
        let status = self.status().await;
        let version = self.current_settings().await;

        ReloadResponse {
            info: status.info,
            status: status.status,
            nodes: status.nodes,
            node: status.node,
            settings: version.as_ref().map(|v| v.to_ref()),
            keys: version.map(|v| v.keys.clone()),
            presets: self.config.presets(),
        }
    }

    pub async fn ca_certificate(&self) -> CoreResult<CaCertificateResponse> {
        self.require_local().await?;
        let current = self
            .current_settings()
            .await
            .ok_or_else(|| CoreError::Internal("no key material".to_string()))?;

        Ok(CaCertificateResponse {
            certificate: current.keys.rcrt.clone(),
            fingerprint: current.keys.rfpr.clone(),
        })
    }

    // ========================================================================
    // Watchers
    // ========================================================================

    /// Keep the local registry entry and the elector in step with the
    /// applied settings
    async fn watch_applied(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.driver.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let serial = *rx.borrow_and_update();
            let Some(local) = self.local().await else {
                continue;
            };
            self.refresh_local(&local).await;
            if let Some(version) = self.store.get(serial).await {
                self.elector
                    .configure(local.as_leader_ref(), broker_nodes(&version.data));
            }
            self.elector.trigger();
        }
    }

    async fn watch_leadership(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.elector.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let leader = *rx.borrow_and_update();
            self.heartbeat_failures.store(0, Ordering::Relaxed);
            match leader {
                Some(l) if self.elector.is_leading() => {
                    info!("This node (serial {}) is now leading the cluster", l.serial)
                }
                Some(l) => info!("Following cluster leader serial {}", l.serial),
                None => warn!("Cluster has no leader"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_client::HttpPeerClient;
    use crate::types::{FqdnRef, HeartbeatMessage, StatusColor, StatusSummary};
    use serde_json::json;

    async fn coordinator(fqdn: &str) -> Arc<Coordinator> {
        let config = CoreConfig::in_memory(fqdn);
        let peers = Arc::new(HttpPeerClient::new(&config, None).unwrap());
        Coordinator::open(config, Collaborators::with_peers(peers))
            .await
            .unwrap()
    }

    async fn settled(c: &Coordinator) {
        while c.driver().applied_serial() == 0 || c.is_reloading() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// A heartbeat from a member `c` has never heard of
    async fn heartbeat_from(c: &Coordinator, fqdn: &str, serial: u8) -> HeartbeatMessage {
        let local = c.local().await.unwrap();
        let current = c.current_settings().await.unwrap();
        HeartbeatMessage {
            from: NodeRef {
                fqdn: fqdn.into(),
                uuid: Uuid::new_v4(),
                serial,
            },
            to: FqdnRef {
                fqdn: local.fqdn.clone(),
            },
            cluster: ClusterRef {
                uuid: local.cluster,
            },
            cluster_leader: c.elector().current_leader(),
            version: c.config().version.clone(),
            settings_serial: current.serial,
            status: StatusSummary {
                code: 0,
                color: StatusColor::Green,
            },
            nodes: Default::default(),
            broadcast: false,
            uptime: 3,
            checksum: current.checksum.clone(),
            action: None,
            settings: None,
        }
    }

    #[tokio::test]
    async fn test_setup_once() {
        let c = coordinator("a.example.com").await;
        assert!(c.is_ephemeral().await);

        let res = c
            .setup(json!({"nodes": ["a.example.com"]}), None)
            .await
            .unwrap();
        assert_eq!(res.root_token.value.len(), 68);
        assert!(res.root_token.value.starts_with("mrt."));
        assert_ne!(res.uuids.node, res.uuids.cluster);

        let local = c.local().await.unwrap();
        assert_eq!(local.serial, 1);
        assert!(c.elector().is_leading());

        let err = c
            .setup(json!({"nodes": ["a.example.com"]}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "morio.core.ephemeral.required");
    }

    #[tokio::test]
    async fn test_setup_requires_local_fqdn() {
        let c = coordinator("z.example.com").await;
        let err = c
            .setup(json!({"nodes": ["a.example.com"]}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "morio.core.settings.fqdn.mismatch");
        assert!(c.is_ephemeral().await);
        assert!(c.store().latest().await.is_none());
    }

    #[tokio::test]
    async fn test_setup_uses_host_when_unconfigured() {
        let config = CoreConfig {
            fqdn: None,
            ..CoreConfig::in_memory("unused")
        };
        let peers = Arc::new(HttpPeerClient::new(&config, None).unwrap());
        let c = Coordinator::open(config, Collaborators::with_peers(peers)).await.unwrap();

        c.setup(
            json!({"nodes": ["a.example.com", "b.example.com"]}),
            Some("B.example.com:443".into()),
        )
        .await
        .unwrap();
        assert_eq!(c.local().await.unwrap().serial, 2);
    }

    #[tokio::test]
    async fn test_settings_update_bumps_serial() {
        let c = coordinator("a.example.com").await;
        c.setup(
            json!({"nodes": ["a.example.com"], "tokens": {"secrets": {"KEY": "value"}}}),
            None,
        )
        .await
        .unwrap();
        let first = c.store().latest_serial().await;

        let res = c
            .update_settings(json!({"deployment": {"nodes": ["a.example.com"]}, "x": 1}))
            .await
            .unwrap();
        assert!(res.serial > first);

        let latest = c.store().latest().await.unwrap();
        assert_eq!(latest.serial, res.serial);
        let first_version = c.store().get(first).await.unwrap();
        assert_eq!(latest.keys, first_version.keys);
        assert!(Cipher::is_encrypted(
            first_version.data["tokens"]["secrets"]["KEY"].as_str().unwrap()
        ));

        let err = c
            .update_settings(json!({"nodes": ["b.example.com"]}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "morio.core.settings.fqdn.mismatch");
    }

    #[tokio::test]
    async fn test_ephemeral_status() {
        let c = coordinator("a.example.com").await;
        let status = c.status().await;
        assert_eq!(status.status.cluster.code, 1);
        assert!(status.node.ephemeral);
        assert!(status.status.cluster.leading.is_none());

        let err = c.ca_certificate().await.unwrap_err();
        assert_eq!(err.code(), "morio.core.ephemeral.prohibited");
    }

    #[tokio::test]
    async fn test_status_turns_green_after_apply() {
        let c = coordinator("a.example.com").await;
        c.setup(json!({"nodes": ["a.example.com"]}), None).await.unwrap();

        let mut rx = c.driver().subscribe();
        if *rx.borrow_and_update() == 0 {
            rx.changed().await.unwrap();
        }
        while c.is_reloading() {
            tokio::task::yield_now().await;
        }
        // The applied watcher is not running, refresh by hand
        let local = c.local().await.unwrap();
        c.refresh_local(&local).await;

        let status = c.status().await;
        assert_eq!(status.status.cluster.code, 0, "{}", status.status.cluster.msg);
        assert_eq!(status.status.cluster.leading, Some(true));
        assert_eq!(status.status.cluster.leader_serial, Some(1));
        assert!(status.node.config_resolved);

        let reload = c.reload().await;
        assert_eq!(reload.settings.unwrap().serial, status.node.settings_serial);
        assert!(reload.keys.is_some());
        assert!(reload.presets.contains_key("MORIO_CORE_PORT"));
    }

    #[tokio::test]
    async fn test_restart_restores_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..CoreConfig::in_memory("a.example.com")
        };

        let setup = {
            let peers = Arc::new(HttpPeerClient::new(&config, None).unwrap());
            let c = Coordinator::open(config.clone(), Collaborators::with_peers(peers))
                .await
                .unwrap();
            c.setup(json!({"nodes": ["a.example.com"]}), None).await.unwrap()
        };

        let peers = Arc::new(HttpPeerClient::new(&config, None).unwrap());
        let c = Coordinator::open(config, Collaborators::with_peers(peers)).await.unwrap();
        let local = c.local().await.unwrap();
        assert_eq!(local.uuid, setup.uuids.node);
        assert_eq!(local.cluster, setup.uuids.cluster);
        assert_eq!(c.store().latest().await.unwrap().keys.mrt, setup.root_token.value);
        assert!(c.elector().is_leading());
    }

    #[tokio::test]
    async fn test_leader_registers_unknown_member_on_heartbeat() {
        let c = coordinator("a.example.com").await;
        c.setup(json!({"nodes": ["a.example.com", "b.example.com"]}), None)
            .await
            .unwrap();
        settled(&c).await;
        assert!(c.elector().is_leading());

        let msg = heartbeat_from(&c, "b.example.com", 2).await;
        let sender = msg.from.uuid;
        c.handle_heartbeat(msg).await.unwrap();

        let b = c.registry().get(sender).await.unwrap();
        assert_eq!(b.fqdn, "b.example.com");
        assert_eq!(b.serial, 2);
        assert_eq!(b.role, NodeRole::BrokerNode);
        assert!(b.reachable);
        assert!(!b.ephemeral);

        // Not in the deployment, so not a member
        let stranger = heartbeat_from(&c, "z.example.com", 3).await;
        let uuid = stranger.from.uuid;
        c.handle_heartbeat(stranger).await.unwrap();
        assert!(c.registry().get(uuid).await.is_none());
    }

    #[tokio::test]
    async fn test_restart_serves_applied_version_not_newest() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..CoreConfig::in_memory("a.example.com")
        };

        let applied = {
            let peers = Arc::new(HttpPeerClient::new(&config, None).unwrap());
            let c = Coordinator::open(config.clone(), Collaborators::with_peers(peers))
                .await
                .unwrap();
            c.setup(json!({"nodes": ["a.example.com"]}), None).await.unwrap();
            settled(&c).await;

            // Stored, never applied
            let current = c.current_settings().await.unwrap();
            c.store()
                .append(SettingsVersion::new(
                    current.serial + 1000,
                    json!({"deployment": {"nodes": ["a.example.com"]}, "abandoned": true}),
                    current.keys.clone(),
                ))
                .await
                .unwrap();
            current.serial
        };

        let peers = Arc::new(HttpPeerClient::new(&config, None).unwrap());
        let c = Coordinator::open(config, Collaborators::with_peers(peers)).await.unwrap();
        assert_eq!(c.driver().applied_serial(), applied);
        assert_eq!(c.current_settings().await.unwrap().serial, applied);
        assert_eq!(c.store().latest_serial().await, applied + 1000);

        settled(&c).await;
        assert_eq!(c.driver().applied_serial(), applied);
        assert_eq!(c.driver().reconfigure_count(), 1);
        assert_eq!(c.reload().await.settings.unwrap().serial, applied);
    }
}
