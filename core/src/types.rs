use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::crypto::KeyBundle;

// ============================================================================
// Time
// ============================================================================

/// Wall-clock milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// ============================================================================
// Node Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    #[serde(alias = "node")]
    BrokerNode,
    FlankingNode,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::BrokerNode => "broker_node",
            NodeRole::FlankingNode => "flanking_node",
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broker_node" | "node" => Ok(NodeRole::BrokerNode),
            "flanking_node" => Ok(NodeRole::FlankingNode),
            other => Err(format!("Unknown node role: {}", other)),
        }
    }
}

/// A cluster member as seen by the registry and exchanged in heartbeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub uuid: Uuid,
    pub serial: u8,
    pub fqdn: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub role: NodeRole,
    pub settings_serial: i64,
    pub ephemeral: bool,
    pub uptime_seconds: u64,
    pub reconfigure_count: u64,
    pub version: String,
    /// Last observation in wall-clock ms, 0 if never observed
    pub last_seen: i64,
    pub reachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaderRef {
    pub serial: u8,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRef {
    pub fqdn: String,
    pub uuid: Uuid,
    pub serial: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FqdnRef {
    pub fqdn: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    pub uuid: Uuid,
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    Green,
    Amber,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub code: u8,
    pub color: StatusColor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub code: u8,
    pub color: StatusColor,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leading: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_serial: Option<u8>,
    pub time: i64,
    pub updated: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBlock {
    pub cluster: ClusterStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoBlock {
    pub about: String,
    pub name: String,
    pub production: bool,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNodeStatus {
    pub uptime: u64,
    pub ephemeral: bool,
    pub ephemeral_uuid: Uuid,
    pub reconfigure_count: u64,
    pub config_resolved: bool,
    pub settings_serial: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub info: InfoBlock,
    pub status: StatusBlock,
    pub nodes: BTreeMap<Uuid, NodeView>,
    pub node: LocalNodeStatus,
}

// ============================================================================
// Settings Types
// ============================================================================

/// A settings version as it travels between nodes, keys included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsPayload {
    pub serial: i64,
    pub data: Value,
    pub checksum: String,
    pub keys: KeyBundle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsRef {
    pub serial: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub result: String,
    pub serial: i64,
    pub settings: Value,
}

/// Stored settings versions, oldest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsListResponse {
    /// The version this node runs
    pub current: i64,
    pub serials: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsVersionResponse {
    pub serial: i64,
    pub checksum: String,
    pub current: bool,
    pub settings: Value,
}

// ============================================================================
// Heartbeat Types
// ============================================================================

/// What a follower should do with its settings after a heartbeat round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Response carries a newer settings version
    Apply,
    /// Follower state diverged; pull the authoritative version
    Resync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub from: NodeRef,
    pub to: FqdnRef,
    pub cluster: ClusterRef,
    pub cluster_leader: Option<LeaderRef>,
    pub version: String,
    pub settings_serial: i64,
    pub status: StatusSummary,
    #[serde(default)]
    pub nodes: BTreeMap<Uuid, NodeView>,
    #[serde(default)]
    pub broadcast: bool,
    pub uptime: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SyncAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from: NodeRef,
    pub cluster: ClusterRef,
    pub settings_serial: i64,
}

// ============================================================================
// Join Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// FQDN of the joining node
    pub you: String,
    /// FQDN of the node asked to admit it
    pub join: String,
    pub cluster: ClusterRef,
    #[serde(rename = "as")]
    pub role: NodeRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<KeyBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub accepted: bool,
    pub node: NodeView,
    pub cluster: ClusterInfo,
    pub cluster_leader: Option<LeaderRef>,
    pub nodes: BTreeMap<Uuid, NodeView>,
    pub settings: SettingsPayload,
}

/// Sent by the leader to an ephemeral node it expects in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRequest {
    pub you: String,
    pub join: String,
    pub cluster: ClusterRef,
    #[serde(rename = "as")]
    pub role: NodeRole,
}

// ============================================================================
// Setup Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupUuids {
    pub node: Uuid,
    pub cluster: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootToken {
    pub about: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupResponse {
    pub result: String,
    pub uuids: SetupUuids,
    pub root_token: RootToken,
}

// ============================================================================
// Reload / CA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub info: InfoBlock,
    pub status: StatusBlock,
    pub nodes: BTreeMap<Uuid, NodeView>,
    pub node: LocalNodeStatus,
    pub settings: Option<SettingsRef>,
    pub keys: Option<KeyBundle>,
    pub presets: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaCertificateResponse {
    pub certificate: String,
    pub fingerprint: String,
}
