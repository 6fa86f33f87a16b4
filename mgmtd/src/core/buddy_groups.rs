use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::constants::MAX_BUDDY_GROUP_ID;
use common::file_utils::{read_if_exists, write_atomic};

use crate::core::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyGroup {
    pub primary: u16,
    pub secondary: u16,
}

/// The group table itself. Exposed through guards so the state store can hold it together
/// with its own lock while it switches groups.
#[derive(Debug, Default)]
pub struct BuddyGroupMap {
    groups: BTreeMap<u16, BuddyGroup>,
    dirty: bool,
}

impl BuddyGroupMap {
    pub fn group(&self, group_id: u16) -> Option<BuddyGroup> {
        self.groups.get(&group_id).copied()
    }

    /// The group containing `target_id` and whether it is that group's primary.
    pub fn group_of(&self, target_id: u16) -> Option<(u16, bool)> {
        self.groups.iter().find_map(|(&id, group)| {
            if group.primary == target_id {
                Some((id, true))
            } else if group.secondary == target_id {
                Some((id, false))
            } else {
                None
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, BuddyGroup)> + '_ {
        self.groups.iter().map(|(&id, &group)| (id, group))
    }

    /// Swaps primary and secondary. Returns false for an unknown group.
    pub fn switchover(&mut self, group_id: u16) -> bool {
        let Some(group) = self.groups.get_mut(&group_id) else {
            warn!(group_id, "switchover requested for unknown buddy group");
            return false;
        };

        std::mem::swap(&mut group.primary, &mut group.secondary);
        self.dirty = true;
        info!(
            group_id,
            new_primary = group.primary,
            new_secondary = group.secondary,
            "buddy group switched over"
        );
        true
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupRecord {
    group_id: u16,
    primary: u16,
    secondary: u16,
}

#[derive(Debug, Default)]
pub struct BuddyGroupMapper {
    inner: RwLock<BuddyGroupMap>,
}

impl BuddyGroupMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, BuddyGroupMap> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, BuddyGroupMap> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or, with `allow_update`, replaces a group. A `group_id` of 0 picks the lowest free
    /// ID. Returns the group's ID.
    pub fn map_group(
        &self,
        group_id: u16,
        primary: u16,
        secondary: u16,
        allow_update: bool,
    ) -> Result<u16, StoreError> {
        if primary == 0 || secondary == 0 {
            return Err(StoreError::InvalidBuddyGroup(
                "target id 0 cannot be a group member".into(),
            ));
        }
        if primary == secondary {
            return Err(StoreError::InvalidBuddyGroup(format!(
                "target {} cannot be its own buddy",
                primary
            )));
        }

        let mut map = self.write();

        let group_id = if group_id == 0 {
            (1..=MAX_BUDDY_GROUP_ID)
                .find(|id| !map.groups.contains_key(id))
                .ok_or_else(|| StoreError::InvalidBuddyGroup("no free buddy group id".into()))?
        } else {
            group_id
        };

        if map.groups.contains_key(&group_id) && !allow_update {
            return Err(StoreError::BuddyGroupExists(group_id));
        }

        for target in [primary, secondary] {
            if let Some((other, _)) = map.group_of(target)
                && other != group_id
            {
                return Err(StoreError::InvalidBuddyGroup(format!(
                    "target {} already belongs to group {}",
                    target, other
                )));
            }
        }

        map.groups.insert(group_id, BuddyGroup { primary, secondary });
        map.dirty = true;
        info!(group_id, primary, secondary, "buddy group mapped");
        Ok(group_id)
    }

    pub fn unmap_group(&self, group_id: u16) -> bool {
        let mut map = self.write();
        let removed = map.groups.remove(&group_id).is_some();
        map.dirty |= removed;
        removed
    }

    pub fn group(&self, group_id: u16) -> Option<BuddyGroup> {
        self.read().group(group_id)
    }

    pub fn group_of(&self, target_id: u16) -> Option<(u16, bool)> {
        self.read().group_of(target_id)
    }

    pub fn buddy_of(&self, target_id: u16) -> Option<u16> {
        let map = self.read();
        let (group_id, is_primary) = map.group_of(target_id)?;
        let group = map.group(group_id)?;
        Some(if is_primary { group.secondary } else { group.primary })
    }

    pub fn switchover(&self, group_id: u16) -> bool {
        self.write().switchover(group_id)
    }

    /// Replaces all groups with the given parallel lists.
    pub fn sync_groups_from_lists(
        &self,
        group_ids: &[u16],
        primaries: &[u16],
        secondaries: &[u16],
    ) -> Result<(), StoreError> {
        if group_ids.len() != primaries.len() || group_ids.len() != secondaries.len() {
            return Err(StoreError::MalformedData(format!(
                "buddy group lists differ in length: {} groups, {} primaries, {} secondaries",
                group_ids.len(),
                primaries.len(),
                secondaries.len()
            )));
        }

        let groups: BTreeMap<u16, BuddyGroup> = group_ids
            .iter()
            .zip(primaries.iter().zip(secondaries))
            .map(|(&id, (&primary, &secondary))| (id, BuddyGroup { primary, secondary }))
            .collect();

        let mut map = self.write();
        if map.groups != groups {
            map.groups = groups;
            map.dirty = true;
        }
        Ok(())
    }

    pub fn groups_as_lists(&self) -> (Vec<u16>, Vec<u16>, Vec<u16>) {
        let map = self.read();
        let mut ids = Vec::with_capacity(map.groups.len());
        let mut primaries = Vec::with_capacity(map.groups.len());
        let mut secondaries = Vec::with_capacity(map.groups.len());

        for (id, group) in map.iter() {
            ids.push(id);
            primaries.push(group.primary);
            secondaries.push(group.secondary);
        }
        (ids, primaries, secondaries)
    }

    pub fn len(&self) -> usize {
        self.read().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), StoreError> {
        let records: Vec<GroupRecord> = {
            let mut map = self.write();
            map.dirty = false;
            map.iter()
                .map(|(group_id, g)| GroupRecord {
                    group_id,
                    primary: g.primary,
                    secondary: g.secondary,
                })
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

        let records: Vec<GroupRecord> = serde_json::from_slice(&buf).map_err(|e| {
            StoreError::MalformedData(format!("{}: {}", path.display(), e))
        })?;

        let mut map = self.write();
        map.groups = records
            .into_iter()
            .map(|r| {
                (
                    r.group_id,
                    BuddyGroup {
                        primary: r.primary,
                        secondary: r.secondary,
                    },
                )
            })
            .collect();
        map.dirty = false;
        Ok(map.groups.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_group_id_takes_lowest_free() {
        let mapper = BuddyGroupMapper::new();
        assert_eq!(mapper.map_group(2, 1, 2, false).unwrap(), 2);
        assert_eq!(mapper.map_group(0, 3, 4, false).unwrap(), 1);
        assert_eq!(mapper.map_group(0, 5, 6, false).unwrap(), 3);
    }

    #[test]
    fn target_may_join_only_one_group() {
        let mapper = BuddyGroupMapper::new();
        mapper.map_group(1, 10, 20, false).unwrap();

        assert!(matches!(
            mapper.map_group(2, 20, 30, false),
            Err(StoreError::InvalidBuddyGroup(_))
        ));
        assert!(matches!(
            mapper.map_group(1, 30, 40, false),
            Err(StoreError::BuddyGroupExists(1))
        ));
        assert!(mapper.map_group(1, 20, 10, true).is_ok());
        assert!(mapper.map_group(3, 7, 7, false).is_err());
    }

    #[test]
    fn switchover_swaps_members() {
        let mapper = BuddyGroupMapper::new();
        mapper.map_group(1, 10, 20, false).unwrap();

        assert_eq!(mapper.buddy_of(10), Some(20));
        assert!(mapper.switchover(1));
        assert_eq!(mapper.group(1), Some(BuddyGroup { primary: 20, secondary: 10 }));
        assert_eq!(mapper.group_of(20), Some((1, true)));
        assert!(!mapper.switchover(9));
    }

    #[test]
    fn unmapped_group_frees_its_targets() {
        let mapper = BuddyGroupMapper::new();
        mapper.map_group(1, 10, 20, false).unwrap();
        mapper.save_to_file(&tempfile::tempdir().unwrap().path().join("g")).unwrap();

        assert!(mapper.unmap_group(1));
        assert!(mapper.is_dirty());
        assert!(!mapper.unmap_group(1));
        assert_eq!(mapper.group_of(10), None);
        assert_eq!(mapper.map_group(0, 20, 30, false).unwrap(), 1);
    }

    #[test]
    fn save_and_load_roundtrip_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");

        let mapper = BuddyGroupMapper::new();
        mapper.sync_groups_from_lists(&[1, 2], &[10, 30], &[20, 40]).unwrap();
        mapper.save_to_file(&path).unwrap();
        assert!(!mapper.is_dirty());

        let restored = BuddyGroupMapper::new();
        assert_eq!(restored.load_from_file(&path).unwrap(), 2);
        assert_eq!(restored.groups_as_lists(), (vec![1, 2], vec![10, 30], vec![20, 40]));
    }
}
