//! Table of known cluster nodes
//!
//! The registry is the single point where heartbeats, joins and relayed
//! views meet. Updates to one node are applied in observation order: an
//! observation older than what is recorded is ignored, and a node's
//! `settings_serial` never moves backwards through `touch`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{HeartbeatMessage, NodeRole, NodeView};

pub const MAX_SERIAL: u8 = 9;

/// Fields carried by one heartbeat about its sender
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub settings_serial: i64,
    pub uptime_seconds: u64,
    pub version: String,
    pub ephemeral: bool,
    /// Wall-clock ms at which the node was heard from
    pub observed_at: i64,
}

impl Observation {
    pub fn from_heartbeat(msg: &HeartbeatMessage, observed_at: i64) -> Self {
        Self {
            settings_serial: msg.settings_serial,
            uptime_seconds: msg.uptime,
            version: msg.version.clone(),
            ephemeral: msg.settings_serial == 0,
            observed_at,
        }
    }
}

/// What a `touch` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    Applied {
        /// The node was unreachable before this observation
        revived: bool,
    },
    Stale,
    Unknown,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<Uuid, NodeView>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry from persisted rows. Remote nodes start unreachable.
    pub async fn load(&self, rows: Vec<NodeView>, local: Uuid) {
        let mut nodes = self.nodes.write().await;
        for mut node in rows {
            if node.uuid != local {
                node.reachable = false;
            }
            nodes.insert(node.uuid, node);
        }
    }

    /// Register a node with an already assigned serial.
    ///
    /// A live entry with the same FQDN and another uuid is a conflict; an
    /// unreachable one is replaced.
    pub async fn register(&self, node: NodeView) -> CoreResult<Uuid> {
        let mut nodes = self.nodes.write().await;
        evict_stale_fqdn(&mut nodes, &node.fqdn, node.uuid)?;

        info!(
            "Registered node {} (serial {}, {})",
            node.fqdn, node.serial, node.uuid
        );
        let uuid = node.uuid;
        nodes.insert(uuid, node);
        Ok(uuid)
    }

    /// Admit a new node: allocate the smallest free serial and register it,
    /// all under one write lock so concurrent admissions cannot collide.
    pub async fn admit(
        &self,
        fqdn: &str,
        role: NodeRole,
        ip: Option<String>,
        now: i64,
    ) -> CoreResult<NodeView> {
        let mut nodes = self.nodes.write().await;
        let uuid = Uuid::new_v4();
        evict_stale_fqdn(&mut nodes, fqdn, uuid)?;

        let serial = (1..=MAX_SERIAL)
            .find(|s| !nodes.values().any(|n| n.serial == *s))
            .ok_or_else(|| CoreError::JoinRejected("no free node serial".to_string()))?;

        let node = NodeView {
            uuid,
            serial,
            fqdn: fqdn.to_string(),
            hostname: hostname_of(fqdn),
            ip,
            role,
            settings_serial: 0,
            ephemeral: true,
            uptime_seconds: 0,
            reconfigure_count: 0,
            version: String::new(),
            last_seen: now,
            reachable: true,
        };

        info!("Admitted node {} as serial {} ({})", fqdn, serial, uuid);
        nodes.insert(uuid, node.clone());
        Ok(node)
    }

    /// Record that a node was heard from
    pub async fn touch(&self, uuid: Uuid, obs: &Observation) -> Touch {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(&uuid) else {
            return Touch::Unknown;
        };

        if obs.observed_at < node.last_seen {
            debug!(
                "Ignoring stale observation of {} ({} < {})",
                node.fqdn, obs.observed_at, node.last_seen
            );
            return Touch::Stale;
        }

        let revived = !node.reachable;
        node.last_seen = obs.observed_at;
        node.reachable = true;
        node.settings_serial = node.settings_serial.max(obs.settings_serial);
        node.ephemeral = obs.ephemeral && node.settings_serial == 0;
        node.uptime_seconds = obs.uptime_seconds;
        node.version = obs.version.clone();

        if revived {
            info!("Node {} (serial {}) is reachable", node.fqdn, node.serial);
        }
        Touch::Applied { revived }
    }

    /// Returns true when the node was reachable before
    pub async fn mark_unreachable(&self, uuid: Uuid) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&uuid) {
            Some(node) if node.reachable => {
                node.reachable = false;
                info!("Node {} (serial {}) is unreachable", node.fqdn, node.serial);
                true
            }
            _ => false,
        }
    }

    /// Flip every node not seen within `window_ms` to unreachable, except
    /// `keep` (the local node). Returns the nodes that flipped.
    pub async fn sweep(&self, now: i64, window_ms: i64, keep: Option<Uuid>) -> Vec<NodeView> {
        let mut nodes = self.nodes.write().await;
        let mut flipped = Vec::new();

        for node in nodes.values_mut() {
            if Some(node.uuid) == keep || !node.reachable {
                continue;
            }
            if now - node.last_seen > window_ms {
                node.reachable = false;
                info!(
                    "Node {} (serial {}) missed heartbeats for {}ms, marking unreachable",
                    node.fqdn,
                    node.serial,
                    now - node.last_seen
                );
                flipped.push(node.clone());
            }
        }

        flipped
    }

    /// Merge a view relayed by another node. Entries only overwrite ours
    /// when their observation is newer. Returns the number of changed nodes.
    pub async fn merge_view(&self, view: &BTreeMap<Uuid, NodeView>, local: Option<Uuid>) -> usize {
        let mut nodes = self.nodes.write().await;
        let mut changed = 0;

        for (uuid, theirs) in view {
            if Some(*uuid) == local {
                continue;
            }

            match nodes.get_mut(uuid) {
                None => {
                    if nodes
                        .values()
                        .any(|n| n.fqdn == theirs.fqdn && n.reachable && theirs.last_seen <= n.last_seen)
                    {
                        continue;
                    }
                    nodes.retain(|_, n| n.fqdn != theirs.fqdn);
                    debug!("Learned about node {} from relayed view", theirs.fqdn);
                    nodes.insert(*uuid, theirs.clone());
                    changed += 1;
                }
                Some(ours) => {
                    ours.serial = theirs.serial;
                    ours.fqdn = theirs.fqdn.clone();
                    ours.role = theirs.role;
                    ours.settings_serial = ours.settings_serial.max(theirs.settings_serial);
                    if theirs.last_seen > ours.last_seen {
                        ours.last_seen = theirs.last_seen;
                        ours.reachable = theirs.reachable;
                        ours.ephemeral = theirs.ephemeral;
                        ours.uptime_seconds = theirs.uptime_seconds;
                        ours.reconfigure_count = theirs.reconfigure_count;
                        ours.version = theirs.version.clone();
                        if ours.ip.is_none() {
                            ours.ip = theirs.ip.clone();
                        }
                        changed += 1;
                    }
                }
            }
        }

        changed
    }

    /// Overwrite the entry of the local node
    pub async fn upsert_local(&self, node: NodeView) {
        self.nodes.write().await.insert(node.uuid, node);
    }

    pub async fn get(&self, uuid: Uuid) -> Option<NodeView> {
        self.nodes.read().await.get(&uuid).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<Uuid, NodeView> {
        self.nodes
            .read()
            .await
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}

fn evict_stale_fqdn(nodes: &mut HashMap<Uuid, NodeView>, fqdn: &str, uuid: Uuid) -> CoreResult<()> {
    let existing: Vec<(Uuid, bool)> = nodes
        .values()
        .filter(|n| n.fqdn == fqdn && n.uuid != uuid)
        .map(|n| (n.uuid, n.reachable))
        .collect();

    if existing.iter().any(|(_, reachable)| *reachable) {
        return Err(CoreError::JoinRejected(format!(
            "a reachable node is already registered as {}",
            fqdn
        )));
    }

    for (stale, _) in existing {
        info!("Replacing stale node {} ({})", fqdn, stale);
        nodes.remove(&stale);
    }
    Ok(())
}

pub fn hostname_of(fqdn: &str) -> String {
    fqdn.split('.').next().unwrap_or(fqdn).to_string()
}

// ============================================================================
// Durable mirror
// ============================================================================

/// Upsert node rows; rows are never deleted
pub fn persist_nodes(conn: &Connection, nodes: &[NodeView]) -> Result<()> {
    for node in nodes {
        conn.execute(
            "INSERT INTO nodes (uuid, serial, fqdn, hostname, ip, role, settings_serial, last_seen, reachable)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(uuid) DO UPDATE SET
                serial = excluded.serial,
                fqdn = excluded.fqdn,
                hostname = excluded.hostname,
                ip = excluded.ip,
                role = excluded.role,
                settings_serial = MAX(nodes.settings_serial, excluded.settings_serial),
                last_seen = MAX(nodes.last_seen, excluded.last_seen),
                reachable = excluded.reachable",
            rusqlite::params![
                node.uuid.to_string(),
                node.serial,
                node.fqdn,
                node.hostname,
                node.ip,
                node.role.as_str(),
                node.settings_serial,
                node.last_seen,
                node.reachable
            ],
        )
        .with_context(|| format!("Failed to persist node {}", node.fqdn))?;
    }

    Ok(())
}

/// List all persisted nodes
pub fn load_nodes(conn: &Connection) -> Result<Vec<NodeView>> {
    let mut stmt = conn
        .prepare("SELECT uuid, serial, fqdn, hostname, ip, role, settings_serial, last_seen, reachable FROM nodes ORDER BY serial")
        .context("Failed to prepare statement")?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u8>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, bool>(8)?,
            ))
        })
        .context("Failed to query nodes")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect nodes")?;

    rows.into_iter()
        .map(
            |(uuid, serial, fqdn, hostname, ip, role, settings_serial, last_seen, reachable)| {
                Ok(NodeView {
                    uuid: Uuid::parse_str(&uuid).context("Invalid node uuid")?,
                    serial,
                    fqdn,
                    hostname,
                    ip,
                    role: role.parse().map_err(anyhow::Error::msg)?,
                    settings_serial,
                    ephemeral: settings_serial == 0,
                    uptime_seconds: 0,
                    reconfigure_count: 0,
                    version: String::new(),
                    last_seen,
                    reachable,
                })
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn obs(settings_serial: i64, observed_at: i64) -> Observation {
        Observation {
            settings_serial,
            uptime_seconds: 10,
            version: "0.1.0".into(),
            ephemeral: false,
            observed_at,
        }
    }

    #[tokio::test]
    async fn test_admit_allocates_smallest_free_serial() {
        let registry = NodeRegistry::new();
        let a = registry.admit("a.example.com", NodeRole::BrokerNode, None, 1).await.unwrap();
        let b = registry.admit("b.example.com", NodeRole::BrokerNode, None, 1).await.unwrap();
        assert_eq!((a.serial, b.serial), (1, 2));

        // Stale node is replaced and its serial is reused
        registry.mark_unreachable(a.uuid).await;
        let a2 = registry.admit("a.example.com", NodeRole::BrokerNode, None, 2).await.unwrap();
        assert_eq!(a2.serial, 1);
        assert_ne!(a2.uuid, a.uuid);
        assert!(registry.get(a.uuid).await.is_none());
    }

    #[tokio::test]
    async fn test_admit_rejects_live_duplicate() {
        let registry = NodeRegistry::new();
        registry.admit("a.example.com", NodeRole::BrokerNode, None, 1).await.unwrap();
        let err = registry
            .admit("a.example.com", NodeRole::BrokerNode, None, 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "morio.core.join.rejected");
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_admit_runs_out_of_serials() {
        let registry = NodeRegistry::new();
        for i in 1..=MAX_SERIAL {
            registry
                .admit(&format!("n{}.example.com", i), NodeRole::BrokerNode, None, 1)
                .await
                .unwrap();
        }
        assert!(registry
            .admit("n10.example.com", NodeRole::BrokerNode, None, 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_concurrent_admissions_for_same_fqdn() {
        let registry = Arc::new(NodeRegistry::new());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.admit("b.example.com", NodeRole::BrokerNode, None, 1).await
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let ok = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        assert_eq!(ok, 1);
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_touch_ignores_older_observation() {
        let registry = NodeRegistry::new();
        let node = registry.admit("a.example.com", NodeRole::BrokerNode, None, 100).await.unwrap();

        assert_eq!(
            registry.touch(node.uuid, &obs(50, 200)).await,
            Touch::Applied { revived: false }
        );
        assert_eq!(registry.touch(node.uuid, &obs(70, 150)).await, Touch::Stale);
        assert_eq!(registry.get(node.uuid).await.unwrap().settings_serial, 50);
        assert_eq!(registry.touch(Uuid::new_v4(), &obs(1, 1)).await, Touch::Unknown);
    }

    #[tokio::test]
    async fn test_sweep_and_revive() {
        let registry = NodeRegistry::new();
        let local = registry.admit("a.example.com", NodeRole::BrokerNode, None, 0).await.unwrap();
        let peer = registry.admit("b.example.com", NodeRole::BrokerNode, None, 0).await.unwrap();
        registry.touch(peer.uuid, &obs(1, 1_000)).await;

        let flipped = registry.sweep(1_500, 400, Some(local.uuid)).await;
        assert_eq!(flipped.len(), 1);
        assert_eq!(flipped[0].uuid, peer.uuid);
        assert!(registry.get(local.uuid).await.unwrap().reachable);

        assert_eq!(
            registry.touch(peer.uuid, &obs(1, 1_600)).await,
            Touch::Applied { revived: true }
        );
    }

    #[tokio::test]
    async fn test_merge_view_prefers_newer_observation() {
        let leader = NodeRegistry::new();
        let a = leader.admit("a.example.com", NodeRole::BrokerNode, None, 1_000).await.unwrap();
        let b = leader.admit("b.example.com", NodeRole::BrokerNode, None, 1_000).await.unwrap();
        let view = leader.snapshot().await;

        let follower = NodeRegistry::new();
        assert_eq!(follower.merge_view(&view, Some(b.uuid)).await, 1);
        assert!(follower.get(b.uuid).await.is_none());
        assert_eq!(follower.get(a.uuid).await.unwrap().serial, 1);

        follower.touch(a.uuid, &obs(5, 2_000)).await;
        assert_eq!(follower.merge_view(&view, Some(b.uuid)).await, 0);
        assert_eq!(follower.get(a.uuid).await.unwrap().last_seen, 2_000);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let pool = init_db(None).unwrap();
        let registry = NodeRegistry::new();
        let a = registry.admit("a.example.com", NodeRole::BrokerNode, None, 10).await.unwrap();
        let b = registry.admit("b.example.com", NodeRole::FlankingNode, None, 10).await.unwrap();
        registry.touch(b.uuid, &obs(42, 20)).await;

        let rows: Vec<NodeView> = registry.snapshot().await.into_values().collect();
        let conn = pool.get().unwrap();
        persist_nodes(&conn, &rows).unwrap();
        persist_nodes(&conn, &rows).unwrap();

        let loaded = load_nodes(&conn).unwrap();
        assert_eq!(loaded.len(), 2);

        let restored = NodeRegistry::new();
        restored.load(loaded, a.uuid).await;
        let b2 = restored.get(b.uuid).await.unwrap();
        assert_eq!(b2.settings_serial, 42);
        assert_eq!(b2.role, NodeRole::FlankingNode);
        assert!(!b2.reachable);
        assert!(restored.get(a.uuid).await.unwrap().reachable);
    }

    proptest! {
        #[test]
        fn prop_touch_never_lowers_settings_serial(
            steps in prop::collection::vec((0i64..1_000, 0i64..1_000), 1..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let registry = NodeRegistry::new();
                let node = registry.admit("a.example.com", NodeRole::BrokerNode, None, 0).await.unwrap();
                let mut max_serial = 0;
                let mut max_seen = 0;

                for (serial, at) in steps {
                    registry.touch(node.uuid, &obs(serial, at)).await;
                    if at >= max_seen {
                        max_seen = at;
                        max_serial = max_serial.max(serial);
                    }
                    let current = registry.get(node.uuid).await.unwrap();
                    assert_eq!(current.settings_serial, max_serial);
                    assert_eq!(current.last_seen, max_seen);
                }
            });
        }
    }
}
