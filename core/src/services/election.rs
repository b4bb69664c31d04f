//! Deterministic leader election
//!
//! The leader is the eligible node with the lowest serial, ties broken by
//! the lowest uuid. Eligible means reachable, not ephemeral and a broker
//! node. Because the rule is a pure function of the registry contents, nodes
//! with converged registries agree without exchanging election messages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::node_registry::NodeRegistry;
use crate::types::{LeaderRef, NodeRole, NodeView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Unknown,
    Electing,
    Leading,
    Following,
}

pub fn is_eligible(node: &NodeView) -> bool {
    node.reachable && !node.ephemeral && node.role == NodeRole::BrokerNode
}

/// Pick the leader among a set of nodes
pub fn elect<'a, I>(nodes: I) -> Option<LeaderRef>
where
    I: IntoIterator<Item = &'a NodeView>,
{
    nodes
        .into_iter()
        .filter(|n| is_eligible(n))
        .map(|n| LeaderRef {
            serial: n.serial,
            uuid: n.uuid,
        })
        .min()
}

struct ElectorInner {
    state: ElectionState,
    leader: Option<LeaderRef>,
    local: Option<LeaderRef>,
    expected_brokers: Vec<String>,
    started_at: Instant,
    ever_elected: bool,
}

pub struct LeaderElector {
    registry: Arc<NodeRegistry>,
    inner: Mutex<ElectorInner>,
    changes: watch::Sender<Option<LeaderRef>>,
    trigger: Notify,
    pending: AtomicBool,
    readiness_window: Duration,
}

impl LeaderElector {
    pub fn new(registry: Arc<NodeRegistry>, readiness_window: Duration) -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            registry,
            inner: Mutex::new(ElectorInner {
                state: ElectionState::Unknown,
                leader: None,
                local: None,
                expected_brokers: Vec::new(),
                started_at: Instant::now(),
                ever_elected: false,
            }),
            changes,
            trigger: Notify::new(),
            pending: AtomicBool::new(false),
            readiness_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ElectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the local identity and the broker FQDNs listed in the settings
    pub fn configure(&self, local: LeaderRef, expected_brokers: Vec<String>) {
        let mut inner = self.lock();
        if inner.local != Some(local) {
            inner.started_at = Instant::now();
        }
        inner.local = Some(local);
        inner.expected_brokers = expected_brokers;
    }

    pub fn state(&self) -> ElectionState {
        self.lock().state
    }

    pub fn is_leading(&self) -> bool {
        self.lock().state == ElectionState::Leading
    }

    pub fn current_leader(&self) -> Option<LeaderRef> {
        self.lock().leader
    }

    /// True once an election has produced a leader at least once
    pub fn has_elected(&self) -> bool {
        self.lock().ever_elected
    }

    /// Leadership change notifications
    pub fn subscribe(&self) -> watch::Receiver<Option<LeaderRef>> {
        self.changes.subscribe()
    }

    /// Request a re-evaluation. Triggers that arrive before the election
    /// loop wakes up collapse into one evaluation.
    pub fn trigger(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.trigger.notify_one();
        }
    }

    /// Mark the election as open, for instance after the leader was lost
    pub fn begin_election(&self) {
        let mut inner = self.lock();
        if inner.state != ElectionState::Unknown {
            inner.state = ElectionState::Electing;
        }
    }

    /// Run one evaluation against the current registry contents
    pub async fn evaluate(&self) -> Option<LeaderRef> {
        let snapshot = self.registry.snapshot().await;

        let (previous, leader) = {
            let mut inner = self.lock();
            let Some(local) = inner.local else {
                inner.state = ElectionState::Unknown;
                return None;
            };

            if inner.state == ElectionState::Unknown && !self.ready(&inner, &snapshot) {
                debug!("Election postponed: not every broker node has been observed");
                return None;
            }

            inner.state = ElectionState::Electing;
            let previous = inner.leader;
            let leader = elect(snapshot.values());
            inner.leader = leader;

            match leader {
                Some(l) if l == local => inner.state = ElectionState::Leading,
                Some(_) => inner.state = ElectionState::Following,
                None => {}
            }
            if leader.is_some() {
                inner.ever_elected = true;
            }

            (previous, leader)
        };

        if previous != leader {
            match leader {
                Some(l) => info!("Cluster leader is now serial {} ({})", l.serial, l.uuid),
                None => warn!("No eligible leader in the cluster"),
            }
            self.changes.send_replace(leader);
        }

        leader
    }

    fn ready(&self, inner: &ElectorInner, snapshot: &BTreeMap<Uuid, NodeView>) -> bool {
        if inner.expected_brokers.len() <= 1 {
            return true;
        }
        if inner.started_at.elapsed() >= self.readiness_window {
            return true;
        }
        // Entries loaded from disk start unreachable, so reachable here means
        // heard from since this elector was configured. Brokers that never
        // joined have no entry and are invited by whoever leads.
        let local = inner.local.map(|l| l.uuid);
        inner.expected_brokers.iter().all(|fqdn| {
            let mut members = snapshot.values().filter(|n| &n.fqdn == fqdn).peekable();
            members.peek().is_none() || members.any(|n| n.reachable || Some(n.uuid) == local)
        })
    }

    /// Election loop: waits for triggers and evaluates once per wake-up
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting leader election loop");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.trigger.notified() => {}
            }
            if self.pending.swap(false, Ordering::AcqRel) {
                self.evaluate().await;
            }
        }
        info!("Leader election loop stopped");
    }
}
