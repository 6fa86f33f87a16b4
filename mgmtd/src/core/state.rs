use std::sync::Arc;

use crate::core::buddy_groups::BuddyGroupMapper;
use crate::core::notify::RefreshSignal;
use crate::core::registry::NodeRegistries;
use crate::core::target_mapper::TargetMapper;
use crate::core::target_states::TargetStateStore;

/// Everything the HTTP handlers and the worker threads share. Built once at startup.
#[derive(Clone)]
pub struct MgmtdContext {
    pub nodes: Arc<NodeRegistries>,
    pub target_states: Arc<TargetStateStore>,
    pub buddy_groups: Arc<BuddyGroupMapper>,
    pub target_mapper: Arc<TargetMapper>,
    pub refresh: Arc<RefreshSignal>,
}

impl MgmtdContext {
    pub fn new() -> Self {
        let refresh = Arc::new(RefreshSignal::new());
        Self {
            nodes: Arc::new(NodeRegistries::new()),
            target_states: Arc::new(TargetStateStore::new(refresh.clone())),
            buddy_groups: Arc::new(BuddyGroupMapper::new()),
            target_mapper: Arc::new(TargetMapper::new()),
            refresh,
        }
    }
}

impl Default for MgmtdContext {
    fn default() -> Self {
        Self::new()
    }
}
