use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use common::schemas::{HeartbeatRequest, NodeInfo, NodeType};
use common::time_utils::utc_now_ms;
use common::url_utils::endpoint_url;

/// A daemon known to the cluster. The numeric ID and string ID never change after creation;
/// everything else is refreshed from each report.
#[derive(Debug)]
pub struct Node {
    num_id: u16,
    string_id: String,
    node_type: NodeType,
    dynamic: RwLock<NodeDynamic>,
}

#[derive(Debug, Clone)]
struct NodeDynamic {
    interfaces: Vec<String>,
    port_udp: u16,
    port_tcp: u16,
    feature_flags: BTreeSet<u32>,
    version: Option<String>,
    last_heartbeat: Instant,
    last_heartbeat_ms: i128,
}

impl Node {
    pub fn new(
        num_id: u16,
        string_id: impl Into<String>,
        node_type: NodeType,
        interfaces: Vec<String>,
        port_udp: u16,
        port_tcp: u16,
    ) -> Self {
        Self {
            num_id,
            string_id: string_id.into(),
            node_type,
            dynamic: RwLock::new(NodeDynamic {
                interfaces,
                port_udp,
                port_tcp,
                feature_flags: BTreeSet::new(),
                version: None,
                last_heartbeat: Instant::now(),
                last_heartbeat_ms: utc_now_ms(),
            }),
        }
    }

    pub fn with_feature_flags(self, flags: impl IntoIterator<Item = u32>) -> Self {
        self.write_dynamic().feature_flags = flags.into_iter().collect();
        self
    }

    pub fn with_version(self, version: Option<String>) -> Self {
        self.write_dynamic().version = version;
        self
    }

    pub fn from_heartbeat(req: &HeartbeatRequest) -> Self {
        Node::new(
            req.num_id,
            req.node_id.clone(),
            req.node_type,
            req.interfaces.clone(),
            req.port_udp,
            req.port_tcp,
        )
        .with_feature_flags(req.feature_flags.iter().copied())
        .with_version(req.version.clone())
    }

    /// Rebuilds a node from a downloaded node list. The heartbeat time is local to this process.
    pub fn from_info(info: &NodeInfo) -> Self {
        Node::new(
            info.num_id,
            info.node_id.clone(),
            info.node_type,
            info.interfaces.clone(),
            info.port_udp,
            info.port_tcp,
        )
        .with_feature_flags(info.feature_flags.iter().copied())
        .with_version(info.version.clone())
    }

    pub fn num_id(&self) -> u16 {
        self.num_id
    }

    pub fn string_id(&self) -> &str {
        &self.string_id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.read_dynamic().interfaces.clone()
    }

    pub fn port_udp(&self) -> u16 {
        self.read_dynamic().port_udp
    }

    pub fn port_tcp(&self) -> u16 {
        self.read_dynamic().port_tcp
    }

    pub fn has_feature(&self, bit: u32) -> bool {
        self.read_dynamic().feature_flags.contains(&bit)
    }

    pub fn feature_flags(&self) -> Vec<u32> {
        self.read_dynamic().feature_flags.iter().copied().collect()
    }

    pub fn version(&self) -> Option<String> {
        self.read_dynamic().version.clone()
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.read_dynamic().last_heartbeat
    }

    pub fn last_heartbeat_ms(&self) -> i128 {
        self.read_dynamic().last_heartbeat_ms
    }

    /// Base URL for RPCs to this node, built from its first interface that yields a valid URL.
    pub fn endpoint(&self) -> Option<String> {
        let dynamic = self.read_dynamic();
        dynamic
            .interfaces
            .iter()
            .find_map(|nic| endpoint_url(nic, dynamic.port_tcp).ok())
    }

    pub fn update_last_heartbeat(&self) {
        let mut dynamic = self.write_dynamic();
        dynamic.last_heartbeat = dynamic.last_heartbeat.max(Instant::now());
        dynamic.last_heartbeat_ms = dynamic.last_heartbeat_ms.max(utc_now_ms());
    }

    /// Takes over everything a fresh report carries (interfaces, ports, feature flags, version)
    /// and bumps the heartbeat time. Identity fields are kept.
    pub fn refresh_from(&self, report: &Node) {
        let incoming = report.read_dynamic().clone();

        let mut dynamic = self.write_dynamic();
        dynamic.interfaces = incoming.interfaces;
        dynamic.port_udp = incoming.port_udp;
        dynamic.port_tcp = incoming.port_tcp;
        dynamic.feature_flags = incoming.feature_flags;
        dynamic.version = incoming.version;
        dynamic.last_heartbeat = dynamic.last_heartbeat.max(Instant::now());
        dynamic.last_heartbeat_ms = dynamic.last_heartbeat_ms.max(utc_now_ms());
    }

    pub fn info(&self) -> NodeInfo {
        let dynamic = self.read_dynamic();
        NodeInfo {
            node_type: self.node_type,
            num_id: self.num_id,
            node_id: self.string_id.clone(),
            interfaces: dynamic.interfaces.clone(),
            port_udp: dynamic.port_udp,
            port_tcp: dynamic.port_tcp,
            feature_flags: dynamic.feature_flags.iter().copied().collect(),
            version: dynamic.version.clone(),
            last_heartbeat_ms: dynamic.last_heartbeat_ms,
        }
    }

    fn read_dynamic(&self) -> std::sync::RwLockReadGuard<'_, NodeDynamic> {
        self.dynamic.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_dynamic(&self) -> std::sync::RwLockWriteGuard<'_, NodeDynamic> {
        self.dynamic.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} [ID: {}]", self.node_type, self.string_id, self.num_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_keeps_identity_and_advances_heartbeat() {
        let node = Node::new(3, "storage01", NodeType::Storage, vec!["10.0.0.1".into()], 8003, 8003);
        let before = node.last_heartbeat();

        let report = Node::new(3, "storage01-renamed", NodeType::Storage, vec!["10.0.0.2".into()], 9003, 9004)
            .with_feature_flags([1, 4])
            .with_version(Some("7.1".into()));
        node.refresh_from(&report);

        assert_eq!(node.string_id(), "storage01");
        assert_eq!(node.interfaces(), vec!["10.0.0.2".to_string()]);
        assert_eq!(node.port_tcp(), 9004);
        assert!(node.has_feature(4));
        assert!(!node.has_feature(2));
        assert_eq!(node.version().as_deref(), Some("7.1"));
        assert!(node.last_heartbeat() >= before);
    }

    #[test]
    fn endpoint_skips_unusable_interfaces() {
        let node = Node::new(1, "meta01", NodeType::Meta, vec!["".into(), "10.1.0.5".into()], 8005, 8005);
        assert_eq!(node.endpoint().as_deref(), Some("http://10.1.0.5:8005"));

        let node = Node::new(2, "meta02", NodeType::Meta, vec![], 8005, 8005);
        assert!(node.endpoint().is_none());
    }
}
