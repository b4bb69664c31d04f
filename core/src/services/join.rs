//! The join protocol
//!
//! The leader invites ephemeral nodes listed in the deployment. An invited
//! node calls back on `/cluster/join`; the leader checks the request, admits
//! the node under the next free serial and hands over settings and keys.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::services::identity::LocalNode;
use crate::services::reconfigure::ApplyMode;
use crate::services::settings_store::SettingsVersion;
use crate::types::{
    now_ms, ClusterInfo, InviteRequest, JoinRequest, JoinResponse, NodeRole,
};
use crate::validation::{
    broker_nodes, flanking_nodes, validate_invite, validate_join, validate_keys,
};

impl Coordinator {
    /// Admit a node into the cluster. Only the leader admits nodes.
    pub async fn handle_join(&self, req: JoinRequest) -> CoreResult<JoinResponse> {
        validate_join(&req)?;
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
        if !req.join.eq_ignore_ascii_case(&local.fqdn) {
            return Err(CoreError::JoinRejected(format!(
                "request is addressed to {}, this is {}",
                req.join, local.fqdn
            )));
        }

        let fqdn = req.you.to_lowercase();
        let current = self
            .current_settings()
            .await
            .ok_or_else(|| CoreError::Internal("no settings version".to_string()))?;
        let listed = match req.role {
            NodeRole::BrokerNode => broker_nodes(&current.data).contains(&fqdn),
            NodeRole::FlankingNode => flanking_nodes(&current.data).contains(&fqdn),
        };
        if !listed {
            return Err(CoreError::JoinRejected(format!(
                "{} is not listed as {} in the deployment",
                fqdn,
                req.role.as_str()
            )));
        }

        let ip = self
            .peers
            .resolve(&fqdn)
            .await
            .map_err(|e| CoreError::JoinRejected(format!("cannot resolve {}: {}", fqdn, e)))?;

        let node = self.registry.admit(&fqdn, req.role, Some(ip), now_ms()).await?;
        if let Err(e) = self.persist_registry().await {
            warn!("Failed to persist node registry: {:#}", e);
        }

        Ok(JoinResponse {
            accepted: true,
            node,
            cluster: ClusterInfo {
                uuid: local.cluster,
                name: local.cluster_name.clone(),
            },
            cluster_leader: self.elector.current_leader(),
            nodes: self.registry.snapshot().await,
            settings: current.to_payload(),
        })
    }

    /// Accept an invite and join in the background
    pub async fn handle_invite(self: &Arc<Self>, req: InviteRequest) -> CoreResult<()> {
        validate_invite(&req)?;
        if !self.is_ephemeral().await {
            return Err(CoreError::EphemeralRequired);
        }
        if let Some(fqdn) = &self.config.fqdn {
            if !fqdn.eq_ignore_ascii_case(&req.you) {
                return Err(CoreError::JoinRejected(format!(
                    "invite is addressed to {}, this is {}",
                    req.you, fqdn
                )));
            }
        }
        if self.joining.swap(true, Ordering::AcqRel) {
            info!("Ignoring invite from {}, already joining", req.join);
            return Ok(());
        }

        let me = self.clone();
        tokio::spawn(async move {
            if let Err(e) = me.join_cluster(req).await {
                warn!("Failed to join cluster: {}", e);
            }
            me.joining.store(false, Ordering::Release);
        });
        Ok(())
    }

    /// Ask the inviting node to admit us and adopt what it hands over
    pub async fn join_cluster(&self, invite: InviteRequest) -> CoreResult<LocalNode> {
        let req = JoinRequest {
            you: invite.you.to_lowercase(),
            join: invite.join.clone(),
            cluster: invite.cluster,
            role: invite.role,
            settings: None,
            keys: None,
            headers: None,
        };
        info!("Joining cluster {} through {}", invite.cluster.uuid, invite.join);

        let resp = self
            .peers
            .join(&invite.join, &req)
            .await
            .map_err(|e| CoreError::JoinRejected(e.to_string()))?;

        if !resp.accepted {
            return Err(CoreError::JoinRejected(format!("{} declined", invite.join)));
        }
        if resp.cluster.uuid != invite.cluster.uuid {
            return Err(CoreError::ClusterMismatch {
                expected: invite.cluster.uuid.to_string(),
                actual: resp.cluster.uuid.to_string(),
            });
        }
        if resp.node.fqdn != req.you {
            return Err(CoreError::JoinRejected(format!(
                "admitted as {}, expected {}",
                resp.node.fqdn, req.you
            )));
        }
        let version = SettingsVersion::from_payload(resp.settings)?;
        validate_keys(&version.keys)?;

        let _guard = self.install_lock.lock().await;
        if !self.is_ephemeral().await {
            return Err(CoreError::EphemeralRequired);
        }

        let version = self.store.append(version).await?;
        let local = LocalNode {
            uuid: resp.node.uuid,
            serial: resp.node.serial,
            fqdn: resp.node.fqdn.clone(),
            role: resp.node.role,
            cluster: resp.cluster.uuid,
            cluster_name: resp.cluster.name,
        };

        self.registry.merge_view(&resp.nodes, Some(local.uuid)).await;
        self.adopt(local.clone()).await?;
        drop(_guard);

        info!(
            "Joined cluster {} as {} (serial {})",
            local.cluster, local.fqdn, local.serial
        );
        self.driver
            .submit((*version).clone(), ApplyMode::Forward, local.clone())
            .await?;
        Ok(local)
    }
}
