//! Reduction of node and cluster health into one status code
//!
//! | code | color | condition |
//! |------|-------|-----------|
//! | 0 | green | all good |
//! | 1 | amber | ephemeral (not set up) |
//! | 2 | amber | reconfiguring |
//! | 3 | amber | expected nodes unreachable |
//! | 4 | amber | broker quorum lost |
//! | 5 | amber | settings lag the leader |
//! | 6 | amber | non-critical service check failing |
//! | 7 | red   | no leader |
//! | 8 | red   | critical service check failing |

use std::sync::{Mutex, PoisonError};

use crate::types::{ClusterStatus, LeaderRef, StatusColor};

pub const OK: u8 = 0;
pub const EPHEMERAL: u8 = 1;
pub const RECONFIGURING: u8 = 2;
pub const NODES_UNREACHABLE: u8 = 3;
pub const QUORUM_LOST: u8 = 4;
pub const SETTINGS_LAG: u8 = 5;
pub const CHECK_FAILING: u8 = 6;
pub const NO_LEADER: u8 = 7;
pub const CRITICAL_CHECK_FAILING: u8 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    pub critical: bool,
    pub ok: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatusInputs {
    pub ephemeral: bool,
    pub reconfiguring: bool,
    pub leading: bool,
    pub leader: Option<LeaderRef>,
    /// Only set once an election has produced a leader
    pub elected: bool,
    pub leader_settings_serial: Option<i64>,
    pub local_settings_serial: i64,
    pub expected_brokers: usize,
    pub reachable_brokers: usize,
    pub unreachable_nodes: Vec<String>,
    pub checks: Vec<HealthCheck>,
}

pub fn color_of(code: u8) -> StatusColor {
    match code {
        OK => StatusColor::Green,
        NO_LEADER | CRITICAL_CHECK_FAILING => StatusColor::Red,
        _ => StatusColor::Amber,
    }
}

/// Pick the code of the most severe condition that holds
pub fn evaluate(inputs: &StatusInputs) -> (u8, String) {
    if let Some(check) = inputs.checks.iter().find(|c| c.critical && !c.ok) {
        return (CRITICAL_CHECK_FAILING, format!("Critical service {} is down", check.name));
    }
    if inputs.ephemeral {
        return (EPHEMERAL, "This node is ephemeral and awaits setup or an invite".into());
    }
    if inputs.leader.is_none() {
        return (NO_LEADER, "No cluster leader could be determined".into());
    }
    if inputs.reconfiguring {
        return (RECONFIGURING, "Settings are being applied".into());
    }
    if inputs.expected_brokers > 0 && inputs.reachable_brokers * 2 <= inputs.expected_brokers {
        return (
            QUORUM_LOST,
            format!(
                "Only {} of {} broker nodes are reachable",
                inputs.reachable_brokers, inputs.expected_brokers
            ),
        );
    }
    if !inputs.unreachable_nodes.is_empty() {
        return (
            NODES_UNREACHABLE,
            format!("Unreachable nodes: {}", inputs.unreachable_nodes.join(", ")),
        );
    }
    if let Some(leader_serial) = inputs.leader_settings_serial {
        if inputs.local_settings_serial < leader_serial {
            return (
                SETTINGS_LAG,
                format!(
                    "Settings {} lag the leader's {}",
                    inputs.local_settings_serial, leader_serial
                ),
            );
        }
    }
    if let Some(check) = inputs.checks.iter().find(|c| !c.ok) {
        return (CHECK_FAILING, format!("Service {} is down", check.name));
    }
    (OK, "Everything is ok".into())
}

/// Tracks when the cluster status last changed
#[derive(Default)]
pub struct StatusAggregator {
    last: Mutex<Option<(u8, i64)>>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(&self, inputs: &StatusInputs, now: i64) -> ClusterStatus {
        let (code, msg) = evaluate(inputs);

        let updated = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            match *last {
                Some((previous, since)) if previous == code => since,
                _ => {
                    *last = Some((code, now));
                    now
                }
            }
        };

        let (leading, leader_serial) = if inputs.elected {
            (Some(inputs.leading), inputs.leader.map(|l| l.serial))
        } else {
            (None, None)
        };

        ClusterStatus {
            code,
            color: color_of(code),
            msg,
            leading,
            leader_serial,
            time: now,
            updated,
        }
    }
}
