//! Per-category node registries built on [`ReferencedEntryMap`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use common::schemas::{NodeInfo, NodeType};

use crate::core::entry_map::{CursorItem, EntryCursor, ReferencedEntryMap};
use crate::core::error::StoreError;
use crate::core::node::Node;
use crate::core::target_mapper::TargetMapper;

pub type NodeRef = crate::core::entry_map::EntryRef<Node>;
pub type NodeCursor = EntryCursor<Node>;
pub type CursorStep = CursorItem<Node>;

/// Applies the outcome of a master-list reconciliation. Called without any registry lock held.
pub trait SyncStrategy {
    fn remove(&mut self, registry: &NodeRegistry, num_id: u16);

    fn add(&mut self, registry: &NodeRegistry, node: Node);

    /// A node present in both lists.
    fn update(&mut self, registry: &NodeRegistry, node: Node) {
        self.add(registry, node);
    }
}

/// Plain `mark_removed` / `add_or_update`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSync;

impl SyncStrategy for DefaultSync {
    fn remove(&mut self, registry: &NodeRegistry, num_id: u16) {
        registry.mark_removed(num_id);
    }

    fn add(&mut self, registry: &NodeRegistry, node: Node) {
        registry.add_or_update(node);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub added: Vec<u16>,
    pub removed: Vec<u16>,
}

#[derive(Debug, Default)]
struct Designations {
    root: Option<u16>,
    local: Option<u16>,
}

pub struct NodeRegistry {
    node_type: NodeType,
    nodes: ReferencedEntryMap<Node>,
    designations: Mutex<Designations>,
}

impl NodeRegistry {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            nodes: ReferencedEntryMap::new(format!("{} nodes", node_type)),
            designations: Mutex::new(Designations::default()),
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Registers `node`, or refreshes the active node with the same numeric ID from it.
    /// Returns true if the node was newly added.
    pub fn add_or_update(&self, node: Node) -> bool {
        let num_id = node.num_id();
        if num_id == 0 {
            error!(
                node_type = %self.node_type,
                node_id = node.string_id(),
                "bug: refusing to add a node with numeric id 0"
            );
            return false;
        }

        if node.node_type() != self.node_type {
            warn!(
                registry = %self.node_type,
                node = %node,
                "node reported with a foreign type; storing it anyway"
            );
        }

        let added = self.nodes.add_or_update(num_id, node, |existing, incoming| {
            if existing.string_id() != incoming.string_id() {
                error!(
                    node_type = %self.node_type,
                    num_id,
                    registered = existing.string_id(),
                    incoming = incoming.string_id(),
                    "numeric node id collision; keeping the registered node"
                );
            }
            existing.refresh_from(&incoming);
        });

        if added {
            info!(node_type = %self.node_type, num_id, "new node");
        }
        added
    }

    pub fn reference_by_id(&self, num_id: u16) -> Option<NodeRef> {
        self.nodes.reference(num_id)
    }

    pub fn reference_by_string_id(&self, string_id: &str) -> Option<NodeRef> {
        self.cursor().find_map(|step| match step {
            CursorItem::Active(node) if node.string_id() == string_id => Some(node),
            _ => None,
        })
    }

    pub fn reference_root(&self) -> Option<NodeRef> {
        let root = self.root_id()?;
        self.reference_by_id(root)
    }

    pub fn reference_random(&self) -> Option<NodeRef> {
        let len = self.nodes.len();
        if len == 0 {
            return None;
        }
        let n = rand::rng().random_range(0..len);
        // The map may have shrunk since `len`; fall back to the first entry.
        self.nodes
            .reference_nth(n)
            .or_else(|| self.nodes.reference_first())
    }

    pub fn reference_all(&self) -> Vec<NodeRef> {
        self.nodes.reference_all()
    }

    /// Routes a target to the storage node that owns it.
    pub fn reference_by_target_id(
        &self,
        target_id: u16,
        mapper: &TargetMapper,
    ) -> Result<NodeRef, StoreError> {
        let num_id = mapper
            .node_of(target_id)
            .ok_or(StoreError::UnknownTarget(target_id))?;
        self.reference_by_id(num_id)
            .ok_or(StoreError::UnknownNode(num_id))
    }

    /// Returns true if this release finally destroyed a removed node.
    pub fn release(&self, node: NodeRef) -> bool {
        self.nodes.release(node)
    }

    /// Returns true if the node was active.
    pub fn mark_removed(&self, num_id: u16) -> bool {
        let was_active = self.nodes.remove(num_id);
        if was_active {
            info!(node_type = %self.node_type, num_id, "node removed");
        }
        was_active
    }

    pub fn reference_first(&self) -> Option<NodeRef> {
        self.nodes.reference_first()
    }

    pub fn reference_next(&self, prev_num_id: u16) -> Option<NodeRef> {
        self.nodes.reference_next(prev_num_id)
    }

    pub fn cursor(&self) -> NodeCursor {
        self.nodes.cursor()
    }

    pub fn is_active(&self, num_id: u16) -> bool {
        self.nodes.contains(num_id)
    }

    /// Returns false for an unknown node.
    pub fn update_last_heartbeat(&self, num_id: u16) -> bool {
        match self.reference_by_id(num_id) {
            Some(node) => {
                node.update_last_heartbeat();
                true
            }
            None => false,
        }
    }

    pub fn node_infos(&self) -> Vec<NodeInfo> {
        self.reference_all().iter().map(|node| node.info()).collect()
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn pending_deletion_len(&self) -> usize {
        self.nodes.pending_deletion_len()
    }

    pub fn ref_count(&self, num_id: u16) -> Option<usize> {
        self.nodes.ref_count(num_id)
    }

    pub fn location(&self, node: &NodeRef) -> crate::core::entry_map::EntryLocation {
        self.nodes.location(node)
    }

    /// Id 0 is only accepted with `force`; an existing root is kept unless `force` is set.
    /// Returns true if the root was changed.
    pub fn set_root_id(&self, num_id: u16, force: bool) -> bool {
        let mut designations = self.designations();

        if num_id == 0 && !force {
            return false;
        }
        if designations.root.is_some() && !force {
            return false;
        }

        let root = (num_id != 0).then_some(num_id);
        if designations.root == root {
            return false;
        }

        designations.root = root;
        info!(node_type = %self.node_type, root = num_id, "root node set");
        true
    }

    pub fn root_id(&self) -> Option<u16> {
        self.designations().root
    }

    /// The local daemon's own ID; it is never removed by a master-list sync.
    pub fn set_local_node_id(&self, num_id: u16) {
        self.designations().local = (num_id != 0).then_some(num_id);
    }

    pub fn local_node_id(&self) -> Option<u16> {
        self.designations().local
    }

    /// Blocks until a node exists or `timeout` elapses. Returns whether a node exists.
    pub fn wait_for_first_node(&self, timeout: Duration) -> bool {
        self.nodes.wait_for_first(timeout)
    }

    pub fn interrupt_waiters(&self) {
        self.nodes.interrupt_waiters();
    }

    pub fn sync_from_master_list(&self, master: Vec<Node>) -> SyncOutcome {
        self.sync_from_master_list_with(master, &mut DefaultSync)
    }

    /// Reconciles the registry with an authoritative node list. The diff is computed under
    /// the map lock; `strategy` then applies it, removals first, with the lock released.
    pub fn sync_from_master_list_with<S>(&self, mut master: Vec<Node>, strategy: &mut S) -> SyncOutcome
    where
        S: SyncStrategy + ?Sized,
    {
        master.sort_by_key(Node::num_id);
        master.dedup_by_key(|node| node.num_id());

        let master_ids: Vec<u16> = master.iter().map(Node::num_id).collect();
        let diff = self.nodes.diff_keys(&master_ids);
        let local = self.local_node_id();

        let mut outcome = SyncOutcome::default();

        for num_id in diff.removed {
            if Some(num_id) == local {
                debug!(node_type = %self.node_type, num_id, "keeping local node during sync");
                continue;
            }
            strategy.remove(self, num_id);
            outcome.removed.push(num_id);
        }

        for node in master {
            let num_id = node.num_id();
            if diff.added.binary_search(&num_id).is_ok() {
                strategy.add(self, node);
                outcome.added.push(num_id);
            } else {
                strategy.update(self, node);
            }
        }

        outcome
    }

    fn designations(&self) -> MutexGuard<'_, Designations> {
        self.designations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One registry per node category.
pub struct NodeRegistries {
    pub mgmt: NodeRegistry,
    pub meta: NodeRegistry,
    pub storage: NodeRegistry,
    pub client: NodeRegistry,
}

impl NodeRegistries {
    pub fn new() -> Self {
        Self {
            mgmt: NodeRegistry::new(NodeType::Mgmt),
            meta: NodeRegistry::new(NodeType::Meta),
            storage: NodeRegistry::new(NodeType::Storage),
            client: NodeRegistry::new(NodeType::Client),
        }
    }

    pub fn get(&self, node_type: NodeType) -> &NodeRegistry {
        match node_type {
            NodeType::Mgmt => &self.mgmt,
            NodeType::Meta => &self.meta,
            NodeType::Storage => &self.storage,
            NodeType::Client => &self.client,
        }
    }

    pub fn interrupt_waiters(&self) {
        for node_type in NodeType::ALL {
            self.get(node_type).interrupt_waiters();
        }
    }
}

impl Default for NodeRegistries {
    fn default() -> Self {
        Self::new()
    }
}
