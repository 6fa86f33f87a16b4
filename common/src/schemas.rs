use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use crate::states::{ConsistencyState, ReachabilityState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Mgmt,
    Meta,
    Storage,
    Client,
}

impl NodeType {
    pub const ALL: [NodeType; 4] = [
        NodeType::Mgmt,
        NodeType::Meta,
        NodeType::Storage,
        NodeType::Client,
    ];
}

impl Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Mgmt => write!(f, "mgmt"),
            NodeType::Meta => write!(f, "meta"),
            NodeType::Storage => write!(f, "storage"),
            NodeType::Client => write!(f, "client"),
        }
    }
}

impl FromStr for NodeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mgmt" => Ok(NodeType::Mgmt),
            "meta" => Ok(NodeType::Meta),
            "storage" => Ok(NodeType::Storage),
            "client" => Ok(NodeType::Client),
            other => Err(anyhow::anyhow!("unknown node type: {}", other)),
        }
    }
}

/// Sent periodically by every daemon; the first one registers the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_type: NodeType,
    pub num_id: u16,
    pub node_id: String,
    pub interfaces: Vec<String>,
    pub port_udp: u16,
    pub port_tcp: u16,
    #[serde(default)]
    pub feature_flags: Vec<u32>,
    #[serde(default)]
    pub version: Option<String>,
    /// Root metadata node known to the sender, only meaningful for meta nodes.
    #[serde(default)]
    pub root_num_id: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub newly_added: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveNodeRequest {
    pub node_type: NodeType,
    pub num_id: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveNodeResponse {
    pub was_active: bool,
    pub unmapped_targets: Vec<u16>,
}

/// Wire representation of a registered node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub num_id: u16,
    pub node_id: String,
    pub interfaces: Vec<String>,
    pub port_udp: u16,
    pub port_tcp: u16,
    pub feature_flags: Vec<u32>,
    pub version: Option<String>,
    pub last_heartbeat_ms: i128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListResponse {
    pub nodes: Vec<NodeInfo>,
    pub root_num_id: Option<u16>,
}

/// Unconditional consistency report; `set_online` marks the reporting targets as alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStatesReport {
    pub target_ids: Vec<u16>,
    pub consistency_states: Vec<ConsistencyState>,
    #[serde(default = "default_true")]
    pub set_online: bool,
}

fn default_true() -> bool {
    true
}

/// Conditional transition, applied only if every target is currently in its `old_states` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeTargetStatesRequest {
    pub target_ids: Vec<u16>,
    pub old_states: Vec<ConsistencyState>,
    pub new_states: Vec<ConsistencyState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetStatesResponse {
    pub target_ids: Vec<u16>,
    pub reachability_states: Vec<ReachabilityState>,
    pub consistency_states: Vec<ConsistencyState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuddyGroupsResponse {
    pub group_ids: Vec<u16>,
    pub primary_targets: Vec<u16>,
    pub secondary_targets: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapBuddyGroupRequest {
    /// 0 lets the management daemon pick the lowest free group ID.
    #[serde(default)]
    pub group_id: u16,
    pub primary_target: u16,
    pub secondary_target: u16,
    #[serde(default)]
    pub allow_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapBuddyGroupResponse {
    pub group_id: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetMappingsResponse {
    pub target_ids: Vec<u16>,
    pub node_ids: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapTargetRequest {
    pub target_id: u16,
    pub node_id: u16,
}

/// Sent to a storage node to overwrite the consistency state of some of its local targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetConsistencyStatesRequest {
    pub target_ids: Vec<u16>,
    pub states: Vec<ConsistencyState>,
    pub set_online: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpResult {
    Success,
    UnknownTarget,
    Again,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetConsistencyStatesResponse {
    pub result: OpResult,
}
