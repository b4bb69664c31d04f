//! Heartbeat emission and handling
//!
//! Followers send one heartbeat per interval to the leader. The leader
//! answers with its view of the cluster and, when the follower's settings
//! are behind or diverged, with the version to apply. Without a leader every
//! node heartbeats every known peer until an election settles.

use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::peer_client::PeerError;
use crate::services::election::ElectionState;
use crate::services::identity::LocalNode;
use crate::services::node_registry::{hostname_of, Observation, Touch};
use crate::services::reconfigure::ApplyMode;
use crate::services::settings_store::SettingsVersion;
use crate::types::{
    now_ms, ClusterRef, FqdnRef, HeartbeatMessage, InviteRequest, NodeRole, NodeView,
    StatusSummary, SyncAction,
};
use crate::validation::{broker_nodes, flanking_nodes, validate_heartbeat};

/// Emit heartbeats every interval until cancelled. Each tick runs in its own
/// task so a slow peer never delays the next one.
pub async fn heartbeat_loop(coordinator: Arc<Coordinator>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(coordinator.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Starting heartbeat loop (every {:?})",
        coordinator.config.heartbeat_interval
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let c = coordinator.clone();
        tokio::spawn(async move {
            c.heartbeat_tick().await;
        });
    }

    info!("Heartbeat loop stopped");
}

impl Coordinator {
    /// One round of outgoing heartbeats
    pub async fn heartbeat_tick(&self) {
        let Some(local) = self.local().await else {
            return;
        };
        self.refresh_local(&local).await;

        let failures = self.heartbeat_failures.load(Ordering::Relaxed);
        match self.elector.state() {
            ElectionState::Leading => self.invite_missing(&local).await,
            ElectionState::Following if failures < self.config.leader_failures => {
                match self.leader_node().await {
                    Some(leader) => self.heartbeat_leader(&local, &leader).await,
                    None => self.discover(&local).await,
                }
            }
            _ => self.discover(&local).await,
        }
    }

    async fn leader_node(&self) -> Option<NodeView> {
        let leader = self.elector.current_leader()?;
        self.registry.get(leader.uuid).await
    }

    async fn heartbeat_leader(&self, local: &LocalNode, leader: &NodeView) {
        match self.send_heartbeat(local, &leader.fqdn).await {
            Ok(()) => {
                self.heartbeat_failures.store(0, Ordering::Relaxed);
            }
            // Diverged settings are pulled in send_heartbeat, the leader is alive
            Err(e) if e.code() == Some("morio.core.checksum.mismatch") => {
                self.heartbeat_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.heartbeat_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Heartbeat to leader {} failed ({}/{}): {}",
                    leader.fqdn, failures, self.config.leader_failures, e
                );
                if failures >= self.config.leader_failures {
                    warn!("Leader {} missed too many heartbeats, re-electing", leader.fqdn);
                    self.registry.mark_unreachable(leader.uuid).await;
                    self.elector.begin_election();
                    self.elector.trigger();
                }
            }
        }
    }

    /// Heartbeat every known peer, used while there is no usable leader
    async fn discover(&self, local: &LocalNode) {
        let peers: Vec<String> = self
            .registry
            .snapshot()
            .await
            .into_values()
            .filter(|n| n.uuid != local.uuid)
            .map(|n| n.fqdn)
            .collect();
        if peers.is_empty() {
            self.elector.trigger();
            return;
        }

        debug!("Sending discovery heartbeats to {} peer(s)", peers.len());
        let results = join_all(peers.iter().map(|fqdn| self.send_heartbeat(local, fqdn))).await;
        for (fqdn, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                debug!("Discovery heartbeat to {} failed: {}", fqdn, e);
            }
        }

        if let Some(leader) = self.leader_node().await {
            if leader.reachable {
                self.heartbeat_failures.store(0, Ordering::Relaxed);
            }
        }
        self.elector.trigger();
    }

    /// Reach out to expected nodes that are not live members. Silent members
    /// get a heartbeat so a partitioned node learns about this leader;
    /// nodes without an identity get an invite.
    async fn invite_missing(&self, local: &LocalNode) {
        let Some(current) = self.current_settings().await else {
            return;
        };
        let snapshot = self.registry.snapshot().await;

        let expected = broker_nodes(&current.data)
            .into_iter()
            .map(|fqdn| (fqdn, NodeRole::BrokerNode))
            .chain(
                flanking_nodes(&current.data)
                    .into_iter()
                    .map(|fqdn| (fqdn, NodeRole::FlankingNode)),
            );
        let missing: Vec<(String, NodeRole, bool)> = expected
            .filter(|(fqdn, _)| fqdn != &local.fqdn)
            .filter_map(|(fqdn, role)| {
                let mut members = snapshot.values().filter(|n| n.fqdn == fqdn);
                let known = members.clone().next().is_some();
                if members.any(|n| n.reachable) {
                    None
                } else {
                    Some((fqdn, role, known))
                }
            })
            .collect();
        if missing.is_empty() {
            return;
        }

        let outreach = missing.iter().map(|(fqdn, role, known)| async move {
            if *known {
                match self.send_heartbeat(local, fqdn).await {
                    Ok(()) => return,
                    Err(e) if e.code() == Some("morio.core.ephemeral.prohibited") => {
                        info!("Member {} lost its identity, inviting it again", fqdn);
                    }
                    Err(e) => {
                        debug!("Member {} still silent: {}", fqdn, e);
                        return;
                    }
                }
            }
            match self.invite(local, fqdn, *role).await {
                // Set up already, so a member whose heartbeats have not reached us yet
                Err(e) if !*known && e.code() == Some("morio.core.ephemeral.required") => {
                    info!("{} is already a cluster member, sending it a heartbeat", fqdn);
                    if let Err(e) = self.send_heartbeat(local, fqdn).await {
                        debug!("Heartbeat to member {} failed: {}", fqdn, e);
                    }
                }
                _ => {}
            }
        });
        join_all(outreach).await;
    }

    async fn invite(&self, local: &LocalNode, fqdn: &str, role: NodeRole) -> Result<(), PeerError> {
        let req = InviteRequest {
            you: fqdn.to_string(),
            join: local.fqdn.clone(),
            cluster: ClusterRef {
                uuid: local.cluster,
            },
            role,
        };
        let result = self.peers.invite(fqdn, &req).await;
        match &result {
            Ok(()) => info!("Invited {} to join as {}", fqdn, role.as_str()),
            Err(e) => debug!("Invite to {} not delivered: {}", fqdn, e),
        }
        result
    }

    pub(crate) async fn build_heartbeat(
        &self,
        local: &LocalNode,
        to: &str,
        broadcast: bool,
    ) -> HeartbeatMessage {
        let applied = self.driver.applied_serial();
        let checksum = self
            .store
            .get(applied)
            .await
            .map(|v| v.checksum.clone())
            .unwrap_or_default();
        let status = self.status().await.status.cluster;

        HeartbeatMessage {
            from: Self::node_ref(local),
            to: FqdnRef {
                fqdn: to.to_string(),
            },
            cluster: ClusterRef {
                uuid: local.cluster,
            },
            cluster_leader: self.elector.current_leader(),
            version: self.config.version.clone(),
            settings_serial: applied,
            status: StatusSummary {
                code: status.code,
                color: status.color,
            },
            nodes: self.registry.snapshot().await,
            broadcast,
            uptime: self.uptime(),
            checksum,
            action: None,
            settings: None,
        }
    }

    async fn send_heartbeat(&self, local: &LocalNode, fqdn: &str) -> Result<(), PeerError> {
        let msg = self.build_heartbeat(local, fqdn, false).await;

        let started = Instant::now();
        let result = self.peers.heartbeat(fqdn, &msg).await;
        let rtt = started.elapsed();
        if rtt > self.config.heartbeat_max_rtt {
            warn!("Heartbeat to {} took {:?}", fqdn, rtt);
        }

        match result {
            Ok(resp) => {
                self.ingest_response(local, resp).await;
                Ok(())
            }
            Err(e) => {
                if e.code() == Some("morio.core.checksum.mismatch") {
                    warn!("Settings diverged from {}, pulling its version", fqdn);
                    self.pull_settings(local, fqdn).await;
                }
                Err(e)
            }
        }
    }

    /// Fold a heartbeat response into local state
    pub(crate) async fn ingest_response(&self, local: &LocalNode, resp: HeartbeatMessage) {
        if resp.cluster.uuid != local.cluster {
            warn!(
                "Ignoring heartbeat response from {} of foreign cluster {}",
                resp.from.fqdn, resp.cluster.uuid
            );
            return;
        }

        let touched = self
            .registry
            .touch(resp.from.uuid, &Observation::from_heartbeat(&resp, now_ms()))
            .await;
        let merged = self.registry.merge_view(&resp.nodes, Some(local.uuid)).await;
        if merged > 0
            || touched == (Touch::Applied { revived: true })
            || resp.cluster_leader != self.elector.current_leader()
        {
            self.elector.trigger();
        }

        let Some(payload) = resp.settings else {
            return;
        };
        if !resp.broadcast {
            debug!("Ignoring settings from {}, it is not leading", resp.from.fqdn);
            return;
        }

        let mode = match resp.action {
            Some(SyncAction::Resync) => ApplyMode::Resync,
            _ => ApplyMode::Forward,
        };
        match SettingsVersion::from_payload(payload) {
            Ok(version) => {
                info!(
                    "Leader {} sent settings {} ({:?})",
                    resp.from.fqdn, version.serial, mode
                );
                if let Err(e) = self.driver.submit(version, mode, local.clone()).await {
                    warn!("Failed to apply settings from {}: {}", resp.from.fqdn, e);
                }
            }
            Err(e) => warn!("Dropping settings from {}: {}", resp.from.fqdn, e),
        }
    }

    /// Handle an incoming heartbeat
    pub async fn handle_heartbeat(&self, msg: HeartbeatMessage) -> CoreResult<HeartbeatMessage> {
        validate_heartbeat(&msg)?;
        let local = self.require_local().await?;
        if msg.cluster.uuid != local.cluster {
            return Err(CoreError::ClusterMismatch {
                expected: local.cluster.to_string(),
                actual: msg.cluster.uuid.to_string(),
            });
        }

        let observed_at = now_ms();
        let mut touched = self
            .registry
            .touch(msg.from.uuid, &Observation::from_heartbeat(&msg, observed_at))
            .await;
        if touched == Touch::Unknown {
            touched = self.learn_sender(&msg, observed_at).await;
        }

        let leading = self.elector.is_leading();
        // Followers only relay what they learned from the leader
        let merged = if leading {
            0
        } else {
            self.registry.merge_view(&msg.nodes, Some(local.uuid)).await
        };
        if merged > 0
            || touched == (Touch::Applied { revived: true })
            || msg.cluster_leader != self.elector.current_leader()
        {
            self.elector.trigger();
        }

        let mut resp = self.build_heartbeat(&local, &msg.from.fqdn, leading).await;
        if leading {
            self.reconcile_settings(&msg, &mut resp).await?;
        }
        Ok(resp)
    }

    /// Register a member of this cluster that reached us before any relayed
    /// view mentioned it. Only nodes listed in the deployment qualify.
    async fn learn_sender(&self, msg: &HeartbeatMessage, observed_at: i64) -> Touch {
        let fqdn = msg.from.fqdn.to_lowercase();
        let Some(current) = self.current_settings().await else {
            return Touch::Unknown;
        };
        let role = if broker_nodes(&current.data).contains(&fqdn) {
            NodeRole::BrokerNode
        } else if flanking_nodes(&current.data).contains(&fqdn) {
            NodeRole::FlankingNode
        } else {
            debug!("Heartbeat from {}, which is not in the deployment", fqdn);
            return Touch::Unknown;
        };

        let claimed = msg.nodes.get(&msg.from.uuid);
        let node = NodeView {
            uuid: msg.from.uuid,
            serial: msg.from.serial,
            hostname: hostname_of(&fqdn),
            ip: claimed.and_then(|n| n.ip.clone()),
            role,
            settings_serial: msg.settings_serial,
            ephemeral: msg.settings_serial == 0,
            uptime_seconds: msg.uptime,
            reconfigure_count: claimed.map(|n| n.reconfigure_count).unwrap_or_default(),
            version: msg.version.clone(),
            last_seen: observed_at,
            reachable: true,
            fqdn,
        };

        match self.registry.register(node).await {
            Ok(_) => {
                if let Err(e) = self.persist_registry().await {
                    warn!("Failed to persist node registry: {:#}", e);
                }
                Touch::Applied { revived: true }
            }
            Err(e) => {
                debug!("Not registering heartbeat sender {}: {}", msg.from.fqdn, e);
                Touch::Unknown
            }
        }
    }

    /// Compare the sender's settings with ours and attach what it should do
    async fn reconcile_settings(
        &self,
        msg: &HeartbeatMessage,
        resp: &mut HeartbeatMessage,
    ) -> CoreResult<()> {
        let Some(current) = self.current_settings().await else {
            return Ok(());
        };
        if msg.settings_serial == 0 {
            return Ok(());
        }

        match self.store.get(msg.settings_serial).await {
            Some(claimed) => {
                if claimed.checksum != msg.checksum {
                    warn!(
                        "Node {} runs settings {} with a foreign checksum",
                        msg.from.fqdn, msg.settings_serial
                    );
                    return Err(CoreError::ChecksumMismatch {
                        serial: msg.settings_serial,
                        expected: claimed.checksum.clone(),
                        actual: msg.checksum.clone(),
                    });
                }
                if msg.settings_serial < current.serial {
                    debug!(
                        "Node {} is behind ({} < {}), sending settings",
                        msg.from.fqdn, msg.settings_serial, current.serial
                    );
                    resp.action = Some(SyncAction::Apply);
                    resp.settings = Some(current.to_payload());
                } else if msg.settings_serial > current.serial {
                    info!(
                        "Node {} runs settings {} ahead of ours, asking it to resync to {}",
                        msg.from.fqdn, msg.settings_serial, current.serial
                    );
                    resp.action = Some(SyncAction::Resync);
                    resp.settings = Some(current.to_payload());
                }
            }
            None => {
                info!(
                    "Node {} runs unknown settings {}, asking it to resync to {}",
                    msg.from.fqdn, msg.settings_serial, current.serial
                );
                resp.action = Some(SyncAction::Resync);
                resp.settings = Some(current.to_payload());
            }
        }
        Ok(())
    }
}
