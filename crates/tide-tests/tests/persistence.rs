//! Multi-run scenarios: each run reopens the ledger from RocksDB, as the CLI does.

use tide_core::constants::WEEK;
use tide_core::types::Caller;
use tide_node::{LedgerConfig, LedgerNode};
use tide_tests::helpers::*;

fn run(dir: &std::path::Path, at: u64) -> LedgerNode {
    let config = LedgerConfig {
        data_dir: dir.to_path_buf(),
        ..LedgerConfig::default()
    };
    LedgerNode::open(config, Some(at), None).unwrap()
}

#[test]
fn history_survives_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let alice = addr("alice");
    let bob = addr("bob");

    {
        let node = run(dir.path(), T0);
        node.mint(&alice, 1_000 * UNIT).unwrap();
        node.mint(&bob, 1_000 * UNIT).unwrap();
        node.create_lock(Caller::direct(alice), 400 * UNIT, T0 + 52 * WEEK).unwrap();
    }

    let weight_at_t0 = {
        let node = run(dir.path(), T0 + 3 * WEEK);
        node.create_lock(Caller::direct(bob), 100 * UNIT, T0 + 20 * WEEK).unwrap();
        node.escrow().balance_of_at_time(&alice, T0)
    };

    {
        let node = run(dir.path(), T0 + 10 * WEEK);
        node.increase_amount(Caller::direct(alice), 50 * UNIT).unwrap();
        assert_eq!(node.escrow().balance_of_at_time(&alice, T0), weight_at_t0);
    }

    let node = run(dir.path(), T0 + 21 * WEEK);
    node.withdraw(Caller::direct(bob)).unwrap();
    let escrow = node.escrow();

    assert_eq!(node.ledger().balance_of(&bob), 1_000 * UNIT);
    assert_eq!(escrow.total_locked(), 450 * UNIT);
    assert_eq!(escrow.user_point_epoch(&alice), 2);
    assert_eq!(escrow.user_point_epoch(&bob), 2);
    for t in (T0..T0 + 60 * WEEK).step_by(86_400 * 5) {
        assert_eq!(
            escrow.total_supply_at_time(t),
            escrow.balance_of_at_time(&alice, t) + escrow.balance_of_at_time(&bob, t)
        );
    }
    assert_monotonic(&global_history(escrow));
}

#[test]
fn block_heights_extrapolate_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    {
        let config = LedgerConfig {
            data_dir: dir.path().to_path_buf(),
            ..LedgerConfig::default()
        };
        let node = LedgerNode::open(config, Some(T0), Some(H0)).unwrap();
        node.checkpoint().unwrap();
    }
    let node = run(dir.path(), T0 + 1_200);
    assert_eq!(node.context().height, H0 + 100);
    assert_eq!(node.escrow().total_supply_at_block(H0 + 50).unwrap(), 0);
}

#[test]
fn future_query_does_not_block_earlier_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let alice = addr("alice");
    {
        let node = run(dir.path(), T0);
        node.mint(&alice, 100 * UNIT).unwrap();
        node.create_lock(Caller::direct(alice), 10 * UNIT, T0 + 20 * WEEK).unwrap();
    }

    let projected = {
        let node = run(dir.path(), T0 + 10 * WEEK);
        node.escrow().total_supply()
    };

    let node = run(dir.path(), T0 + WEEK);
    node.increase_amount(Caller::direct(alice), 5 * UNIT).unwrap();
    assert_eq!(node.escrow().total_locked(), 15 * UNIT);
    assert!(node.escrow().total_supply_at_time(T0 + 10 * WEEK) > projected);
}
