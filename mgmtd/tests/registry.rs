mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ::common::schemas::NodeType;
use mgmtd::core::entry_map::EntryLocation;
use mgmtd::core::node::Node;
use mgmtd::core::registry::{CursorStep, NodeRegistry, SyncOutcome, SyncStrategy};

use crate::common::mk_node;

fn storage_registry(ids: &[u16]) -> NodeRegistry {
    let registry = NodeRegistry::new(NodeType::Storage);
    for &id in ids {
        assert!(registry.add_or_update(mk_node(id, &format!("storage{:02}", id), NodeType::Storage)));
    }
    registry
}

#[test]
fn reference_release_returns_refcount_to_zero() {
    let registry = storage_registry(&[5]);

    let handles: Vec<_> = (0..10).map(|_| registry.reference_by_id(5).unwrap()).collect();
    assert_eq!(registry.ref_count(5), Some(10));

    for handle in handles {
        assert!(!registry.release(handle));
    }
    assert_eq!(registry.ref_count(5), Some(0));
}

#[test]
fn repeated_add_only_advances_heartbeat() {
    let registry = storage_registry(&[3]);
    let held = registry.reference_by_id(3).unwrap();
    let first_beat = held.last_heartbeat();

    thread::sleep(Duration::from_millis(5));
    assert!(!registry.add_or_update(mk_node(3, "storage03", NodeType::Storage)));

    assert_eq!(registry.ref_count(3), Some(1));
    assert!(held.last_heartbeat() >= first_beat);
    assert_eq!(registry.size(), 1);
}

#[test]
fn removed_node_lives_until_last_release() {
    let registry = storage_registry(&[8]);
    let a = registry.reference_by_id(8).unwrap();
    let b = registry.reference_by_id(8).unwrap();

    assert!(registry.mark_removed(8));
    assert!(!registry.is_active(8));
    assert_eq!(registry.pending_deletion_len(), 1);
    assert_eq!(registry.location(&a), EntryLocation::PendingDeletion);

    assert!(!registry.release(a));
    assert_eq!(b.string_id(), "storage08");
    assert!(registry.release(b));
    assert_eq!(registry.pending_deletion_len(), 0);
    assert!(!registry.mark_removed(8));
}

#[test]
fn reregistered_id_is_a_distinct_entry() {
    let registry = storage_registry(&[2]);
    let old = registry.reference_by_id(2).unwrap();
    registry.mark_removed(2);

    assert!(registry.add_or_update(mk_node(2, "storage02-new", NodeType::Storage)));
    let new = registry.reference_by_id(2).unwrap();
    assert_eq!(new.string_id(), "storage02-new");
    assert_eq!(old.string_id(), "storage02");

    assert!(registry.release(old));
    assert_eq!(registry.location(&new), EntryLocation::Active);
    assert_eq!(registry.ref_count(2), Some(1));
}

#[test]
fn iteration_tolerates_removal_of_current_node() {
    let registry = storage_registry(&[1, 2, 3, 4]);
    let mut seen = Vec::new();

    let mut current = registry.reference_first();
    while let Some(node) = current {
        let id = node.num_id();
        seen.push(id);
        if id == 2 {
            registry.mark_removed(2);
            registry.mark_removed(3);
        }
        registry.release(node);
        current = registry.reference_next(id);
    }

    assert_eq!(seen, vec![1, 2, 4]);
    assert_eq!(registry.pending_deletion_len(), 0);
}

#[test]
fn cursor_walks_snapshot_and_reports_removed() {
    let registry = storage_registry(&[10, 20, 30]);
    let mut cursor = registry.cursor();

    let Some(CursorStep::Active(first)) = cursor.next() else {
        panic!("expected node 10");
    };
    assert_eq!(first.num_id(), 10);

    registry.mark_removed(20);
    registry.add_or_update(mk_node(25, "storage25", NodeType::Storage));

    assert!(matches!(cursor.next(), Some(CursorStep::Removed(20))));
    assert!(matches!(cursor.next(), Some(CursorStep::Active(n)) if n.num_id() == 30));
    assert!(cursor.next().is_none());

    // Held handle keeps the entry alive even though it was iterated past.
    assert_eq!(registry.location(&first), EntryLocation::Active);
}

#[test]
fn root_is_kept_unless_forced() {
    let registry = NodeRegistry::new(NodeType::Meta);
    registry.add_or_update(mk_node(1, "meta01", NodeType::Meta));
    registry.add_or_update(mk_node(2, "meta02", NodeType::Meta));

    assert!(registry.reference_root().is_none());
    assert!(registry.set_root_id(1, false));
    assert!(!registry.set_root_id(2, false));
    assert_eq!(registry.reference_root().unwrap().num_id(), 1);

    assert!(registry.set_root_id(2, true));
    assert_eq!(registry.root_id(), Some(2));
}

#[test]
fn wait_for_first_node_wakes_on_insert() {
    let registry = Arc::new(NodeRegistry::new(NodeType::Mgmt));

    let adder = Arc::clone(&registry);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        adder.add_or_update(mk_node(1, "mgmt01", NodeType::Mgmt));
    });

    let started = Instant::now();
    assert!(registry.wait_for_first_node(Duration::from_secs(10)));
    assert!(started.elapsed() < Duration::from_secs(5));
    handle.join().unwrap();
}

#[test]
fn interrupted_wait_returns_early() {
    let registry = Arc::new(NodeRegistry::new(NodeType::Mgmt));

    let waiter = Arc::clone(&registry);
    let handle = thread::spawn(move || waiter.wait_for_first_node(Duration::from_secs(30)));

    thread::sleep(Duration::from_millis(20));
    registry.interrupt_waiters();
    assert!(!handle.join().unwrap());
}

#[test]
fn sync_from_master_list_adds_and_removes() {
    let registry = storage_registry(&[1, 3, 5]);
    let held = registry.reference_by_id(3).unwrap();

    let outcome = registry.sync_from_master_list(vec![
        mk_node(5, "storage05", NodeType::Storage),
        mk_node(2, "storage02", NodeType::Storage),
        mk_node(1, "storage01", NodeType::Storage),
    ]);

    assert_eq!(
        outcome,
        SyncOutcome {
            added: vec![2],
            removed: vec![3],
        }
    );
    let mut ids: Vec<u16> = registry.node_infos().iter().map(|n| n.num_id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 5]);
    assert_eq!(registry.location(&held), EntryLocation::PendingDeletion);
}

#[test]
fn sync_keeps_local_node() {
    let registry = storage_registry(&[1, 7]);
    registry.set_local_node_id(7);

    let outcome = registry.sync_from_master_list(vec![mk_node(1, "storage01", NodeType::Storage)]);
    assert!(outcome.removed.is_empty());
    assert!(registry.is_active(7));
}

#[derive(Default)]
struct Recording {
    ops: Vec<String>,
}

impl SyncStrategy for Recording {
    fn remove(&mut self, registry: &NodeRegistry, num_id: u16) {
        // The registry lock is free here, so calling back into it must not deadlock.
        assert!(registry.reference_by_id(num_id).is_some());
        registry.mark_removed(num_id);
        self.ops.push(format!("remove {}", num_id));
    }

    fn add(&mut self, registry: &NodeRegistry, node: Node) {
        self.ops.push(format!("add {}", node.num_id()));
        registry.add_or_update(node);
    }

    fn update(&mut self, _registry: &NodeRegistry, node: Node) {
        self.ops.push(format!("update {}", node.num_id()));
    }
}

#[test]
fn sync_strategy_runs_removals_first_without_lock() {
    let registry = storage_registry(&[2, 4]);
    let mut strategy = Recording::default();

    registry.sync_from_master_list_with(
        vec![
            mk_node(4, "storage04", NodeType::Storage),
            mk_node(1, "storage01", NodeType::Storage),
        ],
        &mut strategy,
    );

    assert_eq!(strategy.ops, vec!["remove 2", "add 1", "update 4"]);
}

#[test]
fn handles_are_always_active_or_pending() {
    let registry = Arc::new(NodeRegistry::new(NodeType::Storage));
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for round in 0..500u16 {
                    let id = 1 + (round % 8);
                    match worker % 2 {
                        0 => {
                            registry.add_or_update(mk_node(id, &format!("s{}", id), NodeType::Storage));
                        }
                        _ => {
                            registry.mark_removed(id);
                        }
                    }

                    if let Some(node) = registry.reference_by_id(id) {
                        let location = registry.location(&node);
                        assert_ne!(location, EntryLocation::Gone, "held node {} vanished", id);
                        drop(node);
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(registry.pending_deletion_len(), 0);
    for id in 1..=8 {
        if let Some(refs) = registry.ref_count(id) {
            assert_eq!(refs, 0);
        }
    }
}
