use async_trait::async_trait;
use morio_core::types::{
    HeartbeatMessage, InviteRequest, JoinRequest, JoinResponse, LeaderRef, SettingsPayload,
    SetupResponse, SyncRequest,
};
use morio_core::{Collaborators, Coordinator, CoreConfig, CoreError, PeerClient, PeerError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

/// Wait for a TCP port to accept connections
pub async fn wait_for_port(port: u16, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for port {} to be ready", port);
        }
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Configuration with short intervals so scenarios settle quickly
pub fn fast_config(fqdn: &str) -> CoreConfig {
    CoreConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_secs(1),
        heartbeat_max_rtt: Duration::from_secs(1),
        liveness_missed: 3,
        leader_failures: 2,
        ..CoreConfig::in_memory(fqdn)
    }
}

// ============================================================================
// In-memory peer transport
// ============================================================================

/// Routes peer calls straight into other coordinators of the same process.
/// Nodes can be cut off to simulate a network partition.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Weak<Coordinator>>>,
    partitioned: Mutex<HashSet<String>>,
}

fn transport(peer: &str, reason: &str) -> PeerError {
    PeerError::Transport {
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
}

fn rejected(peer: &str, err: CoreError) -> PeerError {
    PeerError::Rejected {
        peer: peer.to_string(),
        status: err.status().as_u16(),
        envelope: err.envelope(),
    }
}

impl MemoryNetwork {
    pub fn attach(&self, fqdn: &str, coordinator: &Arc<Coordinator>) {
        self.nodes
            .write()
            .unwrap()
            .insert(fqdn.to_string(), Arc::downgrade(coordinator));
    }

    pub fn partition(&self, fqdn: &str) {
        self.partitioned.lock().unwrap().insert(fqdn.to_string());
    }

    pub fn heal(&self, fqdn: &str) {
        self.partitioned.lock().unwrap().remove(fqdn);
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<Coordinator>, PeerError> {
        let cut = {
            let partitioned = self.partitioned.lock().unwrap();
            partitioned.contains(from) || partitioned.contains(to)
        };
        if cut {
            return Err(transport(to, "partitioned"));
        }
        self.nodes
            .read()
            .unwrap()
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| transport(to, "no such host"))
    }
}

pub struct MemoryPeerClient {
    from: String,
    net: Arc<MemoryNetwork>,
}

#[async_trait]
impl PeerClient for MemoryPeerClient {
    async fn heartbeat(&self, fqdn: &str, msg: &HeartbeatMessage) -> Result<HeartbeatMessage, PeerError> {
        let target = self.net.route(&self.from, fqdn)?;
        target
            .handle_heartbeat(msg.clone())
            .await
            .map_err(|e| rejected(fqdn, e))
    }

    async fn join(&self, fqdn: &str, req: &JoinRequest) -> Result<JoinResponse, PeerError> {
        let target = self.net.route(&self.from, fqdn)?;
        target
            .handle_join(req.clone())
            .await
            .map_err(|e| rejected(fqdn, e))
    }

    async fn invite(&self, fqdn: &str, req: &InviteRequest) -> Result<(), PeerError> {
        let target = self.net.route(&self.from, fqdn)?;
        target
            .handle_invite(req.clone())
            .await
            .map_err(|e| rejected(fqdn, e))
    }

    async fn sync(&self, fqdn: &str, req: &SyncRequest) -> Result<SettingsPayload, PeerError> {
        let target = self.net.route(&self.from, fqdn)?;
        target
            .handle_sync(req.clone())
            .await
            .map_err(|e| rejected(fqdn, e))
    }

    async fn resolve(&self, fqdn: &str) -> Result<String, PeerError> {
        self.net.route(&self.from, fqdn).map(|_| "127.0.0.1".to_string())
    }
}

// ============================================================================
// Test cluster
// ============================================================================

/// Several coordinators in one process, driven round by round
pub struct TestCluster {
    pub net: Arc<MemoryNetwork>,
    nodes: BTreeMap<String, Arc<Coordinator>>,
}

impl TestCluster {
    /// Start ephemeral coordinators for the given FQDNs
    pub async fn new(fqdns: &[&str]) -> Self {
        let net = Arc::new(MemoryNetwork::default());
        let mut nodes = BTreeMap::new();

        for fqdn in fqdns {
            let peers = Arc::new(MemoryPeerClient {
                from: fqdn.to_string(),
                net: net.clone(),
            });
            let coordinator = Coordinator::open(fast_config(fqdn), Collaborators::with_peers(peers))
                .await
                .expect("Failed to open coordinator");
            net.attach(fqdn, &coordinator);
            nodes.insert(fqdn.to_string(), coordinator);
        }

        Self { net, nodes }
    }

    /// Set up the first node with every FQDN as a broker and run rounds
    /// until all nodes joined, applied, know each other and agree on the
    /// leader
    pub async fn formed(fqdns: &[&str]) -> Self {
        let cluster = Self::new(fqdns).await;
        cluster
            .setup(fqdns[0], serde_json::json!({ "nodes": fqdns }))
            .await;

        let formed = cluster
            .run_until(Duration::from_secs(10), |c| async move {
                c.converged_leader().await.is_some()
                    && c.settings_converged().await
                    && c.registries_converged().await
            })
            .await;
        assert!(formed, "cluster did not form");
        cluster
    }

    pub fn node(&self, fqdn: &str) -> &Arc<Coordinator> {
        self.nodes
            .get(fqdn)
            .unwrap_or_else(|| panic!("no node {}", fqdn))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &Arc<Coordinator>)> {
        self.nodes.iter()
    }

    pub async fn setup(&self, fqdn: &str, settings: Value) -> SetupResponse {
        let node = self.node(fqdn);
        let res = node.setup(settings, None).await.expect("setup failed");
        wait_settled(node).await;
        res
    }

    /// One heartbeat round on every node, followed by a liveness sweep and
    /// an election evaluation
    pub async fn round(&self) {
        for node in self.nodes.values() {
            node.heartbeat_tick().await;
        }
        for node in self.nodes.values() {
            node.mark_stale_nodes().await.expect("sweep failed");
            node.elector().evaluate().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Run rounds until `done` holds or the timeout expires
    pub async fn run_until<'a, F, Fut>(&'a self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&'a TestCluster) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            self.round().await;
            if done(self).await {
                return true;
            }
        }
        false
    }

    /// The leader every reachable node agrees on, if they agree and that
    /// node is leading
    pub async fn converged_leader(&self) -> Option<LeaderRef> {
        let partitioned = self.net.partitioned.lock().unwrap().clone();
        let mut agreed: Option<LeaderRef> = None;

        for (fqdn, node) in &self.nodes {
            if partitioned.contains(fqdn) {
                continue;
            }
            let leader = node.elector().current_leader()?;
            match agreed {
                None => agreed = Some(leader),
                Some(l) if l == leader => {}
                Some(_) => return None,
            }
        }

        let leader = agreed?;
        let (_, leading) = self
            .nodes
            .iter()
            .find(|(fqdn, n)| !partitioned.contains(*fqdn) && n.elector().is_leading())?;
        (leading.local().await?.uuid == leader.uuid).then_some(leader)
    }

    /// True when every reachable node lists every reachable node as a
    /// live member
    pub async fn registries_converged(&self) -> bool {
        let partitioned = self.net.partitioned.lock().unwrap().clone();
        let live: Vec<&String> = self
            .nodes
            .keys()
            .filter(|fqdn| !partitioned.contains(*fqdn))
            .collect();

        for fqdn in &live {
            let members = self.nodes[*fqdn].registry().snapshot().await;
            let all_known = live
                .iter()
                .all(|peer| members.values().any(|n| n.fqdn == **peer && n.reachable));
            if !all_known {
                return false;
            }
        }
        true
    }

    /// True when every reachable node applied the settings the leader runs
    pub async fn settings_converged(&self) -> bool {
        let partitioned = self.net.partitioned.lock().unwrap().clone();
        let Some((_, leader)) = self
            .nodes
            .iter()
            .find(|(fqdn, n)| !partitioned.contains(*fqdn) && n.elector().is_leading())
        else {
            return false;
        };
        let current = leader.driver().applied_serial();
        if current == 0 {
            return false;
        }

        self.nodes
            .iter()
            .filter(|(fqdn, _)| !partitioned.contains(*fqdn))
            .all(|(_, n)| n.driver().applied_serial() == current && !n.is_reloading())
    }
}

/// Wait until a node applied something and is no longer reconfiguring
pub async fn wait_settled(node: &Coordinator) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while node.driver().applied_serial() == 0 || node.is_reloading() {
        if tokio::time::Instant::now() > deadline {
            panic!("node never settled");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
