//! Reachability and consistency of every target, plus the failover rules that act on them.
//!
//! Lock order: the state map first, then the needs-resync set or the buddy group map. No RPC is
//! sent while any of them is held.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use common::file_utils::{read_if_exists, write_atomic};
use common::schemas::{OpResult, SetConsistencyStatesRequest};
use common::states::{CombinedTargetState, ConsistencyState, ReachabilityState};
use common::time_utils::utc_now_parts;

use crate::core::buddy_groups::BuddyGroupMapper;
use crate::core::error::StoreError;
use crate::core::messenger::NodeMessenger;
use crate::core::notify::StateRefreshNotifier;
use crate::core::registry::NodeRegistries;
use crate::core::state_file::{
    StateRecord, decode_states, encode_states, format_needs_resync_list, parse_needs_resync_list,
};
use crate::core::target_mapper::TargetMapper;

#[derive(Debug, Clone)]
struct TargetStateInfo {
    state: CombinedTargetState,
    /// Drives the timeout sweep.
    last_changed: Instant,
    /// Unix seconds and nanoseconds, only persisted.
    last_changed_wall: (i64, i64),
}

impl TargetStateInfo {
    fn new(state: CombinedTargetState) -> Self {
        Self {
            state,
            last_changed: Instant::now(),
            last_changed_wall: utc_now_parts(),
        }
    }

    fn touch(&mut self) {
        self.last_changed = Instant::now();
        self.last_changed_wall = utc_now_parts();
    }
}

#[derive(Debug, Default)]
struct StateMap {
    targets: BTreeMap<u16, TargetStateInfo>,
    version: u64,
    saved_version: u64,
}

impl StateMap {
    fn state_of(&self, target_id: u16) -> Option<CombinedTargetState> {
        self.targets.get(&target_id).map(|info| info.state)
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}

#[derive(Debug, Default)]
struct NeedsResyncSet {
    targets: BTreeSet<u16>,
    dirty: bool,
}

impl NeedsResyncSet {
    fn track(&mut self, target_id: u16, consistency: ConsistencyState) {
        let changed = if consistency == ConsistencyState::NeedsResync {
            self.targets.insert(target_id)
        } else {
            self.targets.remove(&target_id)
        };
        self.dirty |= changed;
    }
}

pub struct TargetStateStore {
    states: RwLock<StateMap>,
    needs_resync: Mutex<NeedsResyncSet>,
    notifier: Arc<dyn StateRefreshNotifier>,
}

fn check_lengths(what: &str, ids: usize, others: &[usize]) -> Result<(), StoreError> {
    if others.iter().any(|&len| len != ids) {
        return Err(StoreError::MalformedData(format!(
            "{}: list lengths differ ({} targets, {:?})",
            what, ids, others
        )));
    }
    Ok(())
}

impl TargetStateStore {
    pub fn new(notifier: Arc<dyn StateRefreshNotifier>) -> Self {
        Self {
            states: RwLock::new(StateMap::default()),
            needs_resync: Mutex::new(NeedsResyncSet::default()),
            notifier,
        }
    }

    /// Unconditional report. With `set_online` the targets become online and their timestamp is
    /// reset; without it reachability is left alone so the timeout sweep can still demote them.
    pub fn set_states_from_lists(
        &self,
        target_ids: &[u16],
        consistency_states: &[ConsistencyState],
        set_online: bool,
    ) -> Result<bool, StoreError> {
        check_lengths("state report", target_ids.len(), &[consistency_states.len()])?;

        let mut changed = false;
        {
            let mut states = self.write_states();
            let mut resync = self.lock_needs_resync();

            for (&target_id, &consistency) in target_ids.iter().zip(consistency_states) {
                let mut is_new = false;
                let info = states.targets.entry(target_id).or_insert_with(|| {
                    is_new = true;
                    TargetStateInfo::new(CombinedTargetState::default())
                });
                let before = info.state;

                info.state.consistency = consistency;
                if set_online {
                    info.state.reachability = ReachabilityState::Online;
                    info.touch();
                }

                if is_new || info.state != before {
                    changed = true;
                    resync.track(target_id, consistency);
                }
            }

            if changed {
                states.bump();
            }
        }

        if changed {
            self.notifier.notify_state_refresh();
        }
        Ok(changed)
    }

    /// All-or-nothing transition. Every target must currently be in its `old_states` entry
    /// (unknown targets count as offline and good), otherwise nothing is changed. Committed targets
    /// become online. A secondary that comes online good while its primary is offline takes over
    /// the primary role.
    pub fn change_states_from_lists(
        &self,
        target_ids: &[u16],
        old_states: &[ConsistencyState],
        new_states: &[ConsistencyState],
        buddy_groups: Option<&BuddyGroupMapper>,
    ) -> Result<(), StoreError> {
        check_lengths(
            "state change",
            target_ids.len(),
            &[old_states.len(), new_states.len()],
        )?;

        let mut changed = false;
        {
            let mut states = self.write_states();

            for (&target_id, &expected) in target_ids.iter().zip(old_states) {
                let actual = states.state_of(target_id).unwrap_or_default().consistency;
                if actual != expected {
                    warn!(target_id, %expected, %actual, "rejecting state change, target changed meanwhile");
                    return Err(StoreError::Conflict {
                        target_id,
                        expected,
                        actual,
                    });
                }
            }

            let mut came_online_good = Vec::new();
            {
                let mut resync = self.lock_needs_resync();

                for (&target_id, &new_state) in target_ids.iter().zip(new_states) {
                    let mut is_new = false;
                    let info = states.targets.entry(target_id).or_insert_with(|| {
                        is_new = true;
                        TargetStateInfo::new(CombinedTargetState::default())
                    });
                    let before = info.state;
                    let was_online = before.reachability == ReachabilityState::Online;

                    info.state = CombinedTargetState::new(ReachabilityState::Online, new_state);
                    info.touch();

                    if is_new || info.state != before {
                        changed = true;
                        resync.track(target_id, new_state);
                    }

                    if !was_online && new_state == ConsistencyState::Good {
                        came_online_good.push(target_id);
                    }
                }
            }
            if changed {
                states.bump();
            }

            if let Some(mapper) = buddy_groups
                && !came_online_good.is_empty()
            {
                let mut groups = mapper.write();

                for target_id in came_online_good {
                    let Some((group_id, false)) = groups.group_of(target_id) else {
                        continue;
                    };
                    let Some(group) = groups.group(group_id) else {
                        continue;
                    };

                    match states.state_of(group.primary) {
                        Some(primary) if primary.reachability == ReachabilityState::Offline => {
                            info!(
                                group_id,
                                offline_primary = group.primary,
                                new_primary = target_id,
                                "secondary came online while primary is offline, switching over"
                            );
                            groups.switchover(group_id);
                        }
                        Some(_) => {}
                        None => {
                            error!(
                                group_id,
                                primary = group.primary,
                                "failed to get state of primary target, keeping buddy group as is"
                            );
                        }
                    }
                }
            }
        }

        if changed {
            self.notifier.notify_state_refresh();
        }
        Ok(())
    }

    /// Demotes targets whose last report is older than the thresholds, offline first. A primary
    /// that goes offline hands over to its secondary, but only if the secondary is online and
    /// good. Returns whether any reachability changed.
    pub fn auto_offline_targets(
        &self,
        poffline_timeout: Duration,
        offline_timeout: Duration,
        buddy_groups: Option<&BuddyGroupMapper>,
    ) -> bool {
        let mut changed = false;
        {
            let mut states = self.write_states();
            // Held across the whole sweep so that a state change and its switchover are observed
            // together.
            let mut groups = buddy_groups.map(|mapper| mapper.write());

            let now = Instant::now();
            let mut offlined = Vec::new();

            for (&target_id, info) in states.targets.iter_mut() {
                let elapsed = now.saturating_duration_since(info.last_changed);

                if elapsed > offline_timeout {
                    if info.state.reachability != ReachabilityState::Offline {
                        warn!(
                            target_id,
                            silent_secs = elapsed.as_secs(),
                            "no state report received, setting target offline"
                        );
                        info.state.reachability = ReachabilityState::Offline;
                        offlined.push(target_id);
                        changed = true;
                    }
                } else if elapsed > poffline_timeout
                    && info.state.reachability != ReachabilityState::ProbablyOffline
                {
                    warn!(
                        target_id,
                        silent_secs = elapsed.as_secs(),
                        "no state report received, setting target probably-offline"
                    );
                    info.state.reachability = ReachabilityState::ProbablyOffline;
                    changed = true;
                }
            }

            if let Some(groups) = groups.as_mut() {
                for target_id in offlined {
                    let Some((group_id, true)) = groups.group_of(target_id) else {
                        continue;
                    };
                    let Some(group) = groups.group(group_id) else {
                        continue;
                    };

                    match states.state_of(group.secondary) {
                        Some(secondary) if secondary.is_online_and_good() => {
                            groups.switchover(group_id);
                        }
                        Some(secondary) => {
                            warn!(
                                group_id,
                                primary = target_id,
                                secondary = group.secondary,
                                secondary_state = %secondary,
                                "primary is offline but secondary is not online and good, refusing switchover"
                            );
                        }
                        None => {
                            warn!(
                                group_id,
                                primary = target_id,
                                secondary = group.secondary,
                                "primary is offline but secondary state is unknown, refusing switchover"
                            );
                        }
                    }
                }
            }

            if changed {
                states.bump();
            }
        }

        if changed {
            self.notifier.notify_state_refresh();
        }
        changed
    }

    /// Finds groups whose members are both online and need a resync, and declares the primary
    /// good. The primary's storage node is told first; the local state only changes after it
    /// acknowledged. Returns whether any group was resolved.
    pub fn resolve_double_resync(
        &self,
        buddy_groups: &BuddyGroupMapper,
        nodes: &NodeRegistries,
        target_mapper: &TargetMapper,
        messenger: &dyn NodeMessenger,
    ) -> bool {
        let groups: Vec<_> = buddy_groups.read().iter().collect();

        let hazards: Vec<(u16, u16)> = {
            let states = self.read_states();
            let needs_resync_online = |target_id| {
                states.state_of(target_id).is_some_and(|s| {
                    s.reachability == ReachabilityState::Online
                        && s.consistency == ConsistencyState::NeedsResync
                })
            };

            groups
                .iter()
                .filter(|(_, g)| needs_resync_online(g.primary) && needs_resync_online(g.secondary))
                .map(|(group_id, g)| (*group_id, g.primary))
                .collect()
        };

        let mut resolved = false;

        for (group_id, primary) in hazards {
            warn!(
                group_id,
                primary, "both buddies need a resync, declaring the primary good"
            );

            let node = match nodes.storage.reference_by_target_id(primary, target_mapper) {
                Ok(node) => node,
                Err(e) => {
                    error!(group_id, primary, error = %e, "cannot reach owner of primary target");
                    continue;
                }
            };

            let req = SetConsistencyStatesRequest {
                target_ids: vec![primary],
                states: vec![ConsistencyState::Good],
                set_online: false,
            };

            match messenger.set_consistency_states(&node, &req) {
                Ok(resp) if resp.result == OpResult::Success => {
                    if self.set_consistency_state(primary, ConsistencyState::Good) {
                        info!(group_id, primary, node = node.string_id(), "double resync resolved");
                        resolved = true;
                    }
                }
                Ok(resp) => {
                    error!(group_id, primary, node = node.string_id(), result = ?resp.result, "storage node refused to mark target good");
                }
                Err(e) => {
                    error!(group_id, primary, node = node.string_id(), error = %e, "failed to mark target good on storage node");
                }
            }
        }

        resolved
    }

    pub fn get_state(&self, target_id: u16) -> Option<CombinedTargetState> {
        self.read_states().state_of(target_id)
    }

    /// Overrides the reachability of every known target, e.g. when the authority is unreachable.
    pub fn set_all_states(&self, reachability: ReachabilityState) {
        let changed = {
            let mut states = self.write_states();
            let mut changed = false;
            for info in states.targets.values_mut() {
                if info.state.reachability != reachability {
                    info.state.reachability = reachability;
                    info.touch();
                    changed = true;
                }
            }
            if changed {
                states.bump();
            }
            changed
        };

        if changed {
            self.notifier.notify_state_refresh();
        }
    }

    pub fn add_or_update(&self, target_id: u16, state: CombinedTargetState) {
        {
            let mut states = self.write_states();
            states.targets.insert(target_id, TargetStateInfo::new(state));
            self.lock_needs_resync().track(target_id, state.consistency);
            states.bump();
        }
        self.notifier.notify_state_refresh();
    }

    pub fn remove_target(&self, target_id: u16) -> bool {
        let mut states = self.write_states();
        let removed = states.targets.remove(&target_id).is_some();
        if removed {
            self.lock_needs_resync().track(target_id, ConsistencyState::Good);
            states.bump();
        }
        removed
    }

    /// Returns false for an unknown target.
    pub fn set_consistency_state(&self, target_id: u16, consistency: ConsistencyState) -> bool {
        {
            let mut states = self.write_states();
            let Some(info) = states.targets.get_mut(&target_id) else {
                return false;
            };
            if info.state.consistency == consistency {
                return true;
            }
            info.state.consistency = consistency;
            self.lock_needs_resync().track(target_id, consistency);
            states.bump();
        }

        self.notifier.notify_state_refresh();
        true
    }

    pub fn get_states_as_lists(&self) -> (Vec<u16>, Vec<ReachabilityState>, Vec<ConsistencyState>) {
        let states = self.read_states();
        let mut ids = Vec::with_capacity(states.targets.len());
        let mut reachability = Vec::with_capacity(states.targets.len());
        let mut consistency = Vec::with_capacity(states.targets.len());

        for (&target_id, info) in &states.targets {
            ids.push(target_id);
            reachability.push(info.state.reachability);
            consistency.push(info.state.consistency);
        }
        (ids, reachability, consistency)
    }

    /// Mirrors a complete state table downloaded from the authority. Listed targets take both
    /// axes as given, all others are dropped.
    pub fn sync_states_from_lists(
        &self,
        target_ids: &[u16],
        reachability: &[ReachabilityState],
        consistency: &[ConsistencyState],
    ) -> Result<bool, StoreError> {
        check_lengths(
            "state download",
            target_ids.len(),
            &[reachability.len(), consistency.len()],
        )?;

        let changed = {
            let mut states = self.write_states();
            let mut resync = self.lock_needs_resync();
            let mut changed = false;

            let listed: BTreeSet<u16> = target_ids.iter().copied().collect();
            let dropped: Vec<u16> = states
                .targets
                .keys()
                .filter(|id| !listed.contains(*id))
                .copied()
                .collect();
            for target_id in dropped {
                states.targets.remove(&target_id);
                resync.track(target_id, ConsistencyState::Good);
                changed = true;
            }

            for ((&target_id, &r), &c) in target_ids.iter().zip(reachability).zip(consistency) {
                let state = CombinedTargetState::new(r, c);
                match states.targets.get_mut(&target_id) {
                    Some(info) if info.state == state => continue,
                    Some(info) => {
                        info.state = state;
                        info.touch();
                    }
                    None => {
                        states.targets.insert(target_id, TargetStateInfo::new(state));
                    }
                }
                resync.track(target_id, c);
                changed = true;
            }

            if changed {
                states.bump();
            }
            changed
        };

        if changed {
            self.notifier.notify_state_refresh();
        }
        Ok(changed)
    }

    pub fn len(&self) -> usize {
        self.read_states().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the state map changed since it was last saved or loaded.
    pub fn is_dirty(&self) -> bool {
        let states = self.read_states();
        states.version != states.saved_version
    }

    pub fn needs_resync_targets(&self) -> Vec<u16> {
        self.lock_needs_resync().targets.iter().copied().collect()
    }

    pub fn save_states(&self, path: &Path) -> Result<(), StoreError> {
        let (records, version) = {
            let states = self.read_states();
            let records: Vec<StateRecord> = states
                .targets
                .iter()
                .map(|(&target_id, info)| StateRecord {
                    target_id,
                    state: info.state,
                    changed_secs: info.last_changed_wall.0,
                    changed_nanos: info.last_changed_wall.1,
                })
                .collect();
            (records, states.version)
        };

        write_atomic(path, &encode_states(&records)?)?;

        let mut states = self.write_states();
        states.saved_version = states.saved_version.max(version);
        Ok(())
    }

    /// Restores a saved state map. Reachability always comes back as probably-offline since it
    /// cannot be trusted across a restart; consistency is taken as saved. A missing file loads
    /// nothing.
    pub fn load_states(&self, path: &Path) -> Result<usize, StoreError> {
        let Some(buf) = read_if_exists(path)? else {
            info!(path = %path.display(), "no saved target states");
            return Ok(0);
        };
        let records = decode_states(&buf)?;

        let mut states = self.write_states();
        let mut resync = self.lock_needs_resync();

        for record in &records {
            let state = CombinedTargetState::new(
                ReachabilityState::ProbablyOffline,
                record.state.consistency,
            );
            states.targets.insert(
                record.target_id,
                TargetStateInfo {
                    state,
                    last_changed: Instant::now(),
                    last_changed_wall: (record.changed_secs, record.changed_nanos),
                },
            );
            if record.state.consistency == ConsistencyState::NeedsResync {
                let inserted = resync.targets.insert(record.target_id);
                resync.dirty |= inserted;
            }
        }

        states.saved_version = states.version;
        info!(path = %path.display(), targets = records.len(), "target states loaded");
        Ok(records.len())
    }

    /// Seeds the needs-resync set. Every listed target is marked probably-offline and in need of
    /// a resync. A missing file loads nothing.
    pub fn load_needs_resync_list(&self, path: &Path) -> Result<usize, StoreError> {
        let Some(buf) = read_if_exists(path)? else {
            return Ok(0);
        };
        let text = String::from_utf8_lossy(&buf);
        let targets = parse_needs_resync_list(&text);

        if !targets.is_empty() {
            let mut states = self.write_states();
            let mut resync = self.lock_needs_resync();
            let state = CombinedTargetState::new(
                ReachabilityState::ProbablyOffline,
                ConsistencyState::NeedsResync,
            );

            for &target_id in &targets {
                states
                    .targets
                    .entry(target_id)
                    .and_modify(|info| {
                        info.state = state;
                        info.touch();
                    })
                    .or_insert_with(|| TargetStateInfo::new(state));
                resync.targets.insert(target_id);
            }
            resync.dirty = true;
            states.bump();
        }

        info!(path = %path.display(), targets = targets.len(), "needs-resync list loaded");
        Ok(targets.len())
    }

    /// Writes the needs-resync set if it changed since the last save. Returns whether a file
    /// was written.
    pub fn save_needs_resync_list(&self, path: &Path) -> Result<bool, StoreError> {
        let targets = {
            let mut resync = self.lock_needs_resync();
            if !resync.dirty {
                return Ok(false);
            }
            resync.dirty = false;
            resync.targets.clone()
        };

        let text = format_needs_resync_list(targets);
        if let Err(e) = write_atomic(path, text.as_bytes()) {
            self.lock_needs_resync().dirty = true;
            return Err(e.into());
        }
        Ok(true)
    }

    fn read_states(&self) -> RwLockReadGuard<'_, StateMap> {
        self.states.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_states(&self) -> RwLockWriteGuard<'_, StateMap> {
        self.states.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_needs_resync(&self) -> MutexGuard<'_, NeedsResyncSet> {
        self.needs_resync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::notify::RefreshSignal;

    fn store() -> (TargetStateStore, Arc<RefreshSignal>) {
        let signal = Arc::new(RefreshSignal::new());
        (TargetStateStore::new(signal.clone()), signal)
    }

    #[test]
    fn report_without_online_keeps_reachability() {
        let (store, _) = store();
        store.add_or_update(
            1,
            CombinedTargetState::new(ReachabilityState::ProbablyOffline, ConsistencyState::Good),
        );

        store
            .set_states_from_lists(&[1], &[ConsistencyState::Bad], false)
            .unwrap();
        assert_eq!(
            store.get_state(1),
            Some(CombinedTargetState::new(
                ReachabilityState::ProbablyOffline,
                ConsistencyState::Bad
            ))
        );

        store
            .set_states_from_lists(&[1], &[ConsistencyState::Good], true)
            .unwrap();
        assert_eq!(store.get_state(1).unwrap().reachability, ReachabilityState::Online);
    }

    #[test]
    fn changes_notify_and_bump_version() {
        let (store, signal) = store();
        let before = signal.generation();

        assert!(
            store
                .set_states_from_lists(&[4], &[ConsistencyState::NeedsResync], true)
                .unwrap()
        );
        assert!(signal.generation() > before);
        assert!(store.is_dirty());
        assert_eq!(store.needs_resync_targets(), vec![4]);

        let seen = signal.generation();
        assert!(
            !store
                .set_states_from_lists(&[4], &[ConsistencyState::NeedsResync], true)
                .unwrap()
        );
        assert_eq!(signal.generation(), seen);
    }

    #[test]
    fn mismatched_lists_are_malformed() {
        let (store, _) = store();
        assert!(matches!(
            store.set_states_from_lists(&[1, 2], &[ConsistencyState::Good], true),
            Err(StoreError::MalformedData(_))
        ));
        assert!(matches!(
            store.change_states_from_lists(&[1], &[ConsistencyState::Good], &[], None),
            Err(StoreError::MalformedData(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_target_compares_as_good() {
        let (store, _) = store();
        store
            .change_states_from_lists(
                &[9],
                &[ConsistencyState::Good],
                &[ConsistencyState::NeedsResync],
                None,
            )
            .unwrap();
        assert_eq!(
            store.get_state(9),
            Some(CombinedTargetState::new(
                ReachabilityState::Online,
                ConsistencyState::NeedsResync
            ))
        );
    }

    #[test]
    fn set_all_states_overrides_reachability() {
        let (store, _) = store();
        store
            .set_states_from_lists(&[1, 2], &[ConsistencyState::Good, ConsistencyState::Bad], true)
            .unwrap();

        store.set_all_states(ReachabilityState::ProbablyOffline);
        let (ids, reach, cons) = store.get_states_as_lists();
        assert_eq!(ids, vec![1, 2]);
        assert!(reach.iter().all(|r| *r == ReachabilityState::ProbablyOffline));
        assert_eq!(cons, vec![ConsistencyState::Good, ConsistencyState::Bad]);
    }

    #[test]
    fn sync_mirrors_downloaded_table() {
        let (store, _) = store();
        store
            .set_states_from_lists(&[1, 2], &[ConsistencyState::Good, ConsistencyState::NeedsResync], true)
            .unwrap();

        store
            .sync_states_from_lists(
                &[2, 3],
                &[ReachabilityState::Offline, ReachabilityState::Online],
                &[ConsistencyState::Good, ConsistencyState::NeedsResync],
            )
            .unwrap();

        assert_eq!(store.get_state(1), None);
        assert_eq!(
            store.get_state(2),
            Some(CombinedTargetState::new(ReachabilityState::Offline, ConsistencyState::Good))
        );
        assert_eq!(store.needs_resync_targets(), vec![3]);
    }
}
