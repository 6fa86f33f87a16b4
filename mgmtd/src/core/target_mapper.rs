use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::file_utils::{read_if_exists, write_atomic};

use crate::core::error::StoreError;

/// Which storage node owns each target.
#[derive(Debug, Default)]
pub struct TargetMapper {
    inner: RwLock<Mappings>,
}

#[derive(Debug, Default)]
struct Mappings {
    targets: BTreeMap<u16, u16>,
    dirty: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingRecord {
    target_id: u16,
    node_id: u16,
}

impl TargetMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the mapping was new or changed.
    pub fn map_target(&self, target_id: u16, node_id: u16) -> Result<bool, StoreError> {
        if target_id == 0 || node_id == 0 {
            return Err(StoreError::MalformedData(format!(
                "cannot map target {} to node {}: zero id",
                target_id, node_id
            )));
        }

        let mut mappings = self.write();
        let previous = mappings.targets.insert(target_id, node_id);
        if previous == Some(node_id) {
            return Ok(false);
        }

        mappings.dirty = true;
        match previous {
            Some(old) => info!(target_id, old_node = old, node_id, "target moved to another node"),
            None => debug!(target_id, node_id, "target mapped"),
        }
        Ok(true)
    }

    pub fn unmap_target(&self, target_id: u16) -> bool {
        let mut mappings = self.write();
        let removed = mappings.targets.remove(&target_id).is_some();
        mappings.dirty |= removed;
        removed
    }

    /// Drops every mapping that points at `node_id` and returns the affected targets.
    pub fn unmap_node(&self, node_id: u16) -> Vec<u16> {
        let mut mappings = self.write();
        let targets: Vec<u16> = mappings
            .targets
            .iter()
            .filter(|&(_, &owner)| owner == node_id)
            .map(|(&target, _)| target)
            .collect();

        for target in &targets {
            mappings.targets.remove(target);
        }
        mappings.dirty |= !targets.is_empty();
        targets
    }

    pub fn node_of(&self, target_id: u16) -> Option<u16> {
        self.read().targets.get(&target_id).copied()
    }

    /// Replaces all mappings with the given parallel lists.
    pub fn sync_from_lists(&self, target_ids: &[u16], node_ids: &[u16]) -> Result<(), StoreError> {
        if target_ids.len() != node_ids.len() {
            return Err(StoreError::MalformedData(format!(
                "target mapping lists differ in length: {} targets, {} nodes",
                target_ids.len(),
                node_ids.len()
            )));
        }

        let targets: BTreeMap<u16, u16> = target_ids
            .iter()
            .copied()
            .zip(node_ids.iter().copied())
            .collect();

        let mut mappings = self.write();
        if mappings.targets != targets {
            mappings.targets = targets;
            mappings.dirty = true;
        }
        Ok(())
    }

    pub fn targets_as_lists(&self) -> (Vec<u16>, Vec<u16>) {
        self.read()
            .targets
            .iter()
            .map(|(&target, &node)| (target, node))
            .unzip()
    }

    pub fn len(&self) -> usize {
        self.read().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), StoreError> {
        let records: Vec<MappingRecord> = {
            let mut mappings = self.write();
            mappings.dirty = false;
            mappings
                .targets
                .iter()
                .map(|(&target_id, &node_id)| MappingRecord { target_id, node_id })
                .collect()
        };

        let result = serde_json::to_vec_pretty(&records)
            .map_err(|e| StoreError::MalformedData(e.to_string()))
            .and_then(|buf| write_atomic(path, &buf).map_err(StoreError::from));

        if result.is_err() {
            self.write().dirty = true;
        }
        result
    }

    /// A missing file leaves the mapper empty.
    pub fn load_from_file(&self, path: &Path) -> Result<usize, StoreError> {
        let Some(buf) = read_if_exists(path)? else {
            return Ok(0);
        };

        let records: Vec<MappingRecord> = serde_json::from_slice(&buf).map_err(|e| {
            StoreError::MalformedData(format!("{}: {}", path.display(), e))
        })?;

        let mut mappings = self.write();
        mappings.targets = records
            .into_iter()
            .map(|r| (r.target_id, r.node_id))
            .collect();
        mappings.dirty = false;
        Ok(mappings.targets.len())
    }

    fn read(&self) -> RwLockReadGuard<'_, Mappings> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Mappings> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
