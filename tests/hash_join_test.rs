// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Integration tests for the partitioned hash join operator.

mod common;

use common::{
    JoinSetup, counter, expect_cancelled, reference_join, row, sorted, spill_files_under,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use shalerocks::ExecError;
use shalerocks::common::config::JoinTunables;
use shalerocks::exec::expr::{ExprArena, ExprId, ExprNode};
use shalerocks::exec::operators::hashjoin::{CancelToken, JoinOp};

fn small_spill_tunables() -> JoinTunables {
    JoinTunables {
        fanout: 16,
        num_partitioning_bits: 4,
        page_size_bytes: 4096,
        ..JoinTunables::default()
    }
}

#[test]
fn inner_join_all_in_memory() {
    let temp = tempdir().unwrap();
    let setup = JoinSetup::new(
        JoinOp::Inner,
        vec![row(1, "a"), row(2, "b"), row(3, "c")],
        vec![row(2, "x"), row(4, "y"), row(2, "z")],
    );
    let (rows, node) = setup.run(temp.path()).unwrap();
    let expected = vec![
        vec![Some("2".into()), Some("x".into()), Some("2".into()), Some("b".into())],
        vec![Some("2".into()), Some("z".into()), Some("2".into()), Some("b".into())],
    ];
    assert_eq!(sorted(rows), sorted(expected));
    assert_eq!(counter(&node, "NumSpilledPartitions"), 0);
    assert_eq!(counter(&node, "NumRepartitions"), 0);
    assert_eq!(counter(&node, "NumBuildRowsPartitioned"), 3);
}

#[test]
fn left_outer_with_empty_build() {
    let temp = tempdir().unwrap();
    let setup = JoinSetup::new(
        JoinOp::LeftOuter,
        vec![],
        vec![row(1, "p"), row(2, "q")],
    );
    let (rows, _node) = setup.run(temp.path()).unwrap();
    let expected = vec![
        vec![Some("1".into()), Some("p".into()), None, None],
        vec![Some("2".into()), Some("q".into()), None, None],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn right_anti_emits_unmatched_build_after_probe_drains() {
    let temp = tempdir().unwrap();
    let setup = JoinSetup::new(
        JoinOp::RightAnti,
        vec![row(1, "b1"), row(2, "b2"), row(3, "b3"), row(4, "b4")],
        vec![row(2, "p2"), row(4, "p4")],
    );
    let (rows, _node) = setup.run(temp.path()).unwrap();
    let expected = vec![
        vec![Some("1".into()), Some("b1".into())],
        vec![Some("3".into()), Some("b3".into())],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn full_outer_with_forced_spilling() {
    let temp = tempdir().unwrap();
    let build: Vec<_> = (0..20_000).map(|k| row(k, &format!("b{k}"))).collect();
    let probe: Vec<_> = (10_000..30_000).map(|k| row(k, &format!("p{k}"))).collect();
    let mut setup = JoinSetup::new(JoinOp::FullOuter, build, probe);
    setup.tunables = small_spill_tunables();
    setup.rows_per_chunk = 512;
    setup.mem_limit = 192 << 10;
    let (rows, node) = setup.run(temp.path()).unwrap();

    assert_eq!(rows.len(), 30_000);
    let matched = rows
        .iter()
        .filter(|r| r[0].is_some() && r[2].is_some())
        .count();
    let probe_only = rows.iter().filter(|r| r[2].is_none()).count();
    let build_only = rows.iter().filter(|r| r[0].is_none()).count();
    assert_eq!(matched, 10_000);
    assert_eq!(probe_only, 10_000);
    assert_eq!(build_only, 10_000);

    assert!(
        counter(&node, "NumSpilledPartitions") >= 8,
        "expected at least fanout/2 spilled partitions, got {}",
        counter(&node, "NumSpilledPartitions")
    );
    assert!(node.peak_reserved_bytes() <= 192 << 10);
    // Every spill block file is reclaimed by close().
    assert_eq!(spill_files_under(temp.path()), 0);
}

#[test]
fn skewed_build_reports_partition_skew() {
    let temp = tempdir().unwrap();
    let mut build: Vec<_> = (0..900).map(|i| row(777, &format!("hot{i}"))).collect();
    build.extend((0..100).map(|k| row(k, &format!("cold{k}"))));
    let probe: Vec<_> = (700..800).map(|k| row(k, &format!("p{k}"))).collect();
    let mut setup = JoinSetup::new(JoinOp::Inner, build.clone(), probe.clone());
    setup.tunables = small_spill_tunables();
    let (rows, node) = setup.run(temp.path()).unwrap();

    assert_eq!(
        sorted(rows),
        sorted(reference_join(JoinOp::Inner, &build, &probe))
    );
    // 90% of the build shares one key, so the dominant partition holds far
    // more than 1/fanout of the rows.
    assert!(counter(&node, "LargestPartitionPercent") > 100 / 16);
}

#[test]
fn extreme_skew_hits_repartition_limit() {
    let temp = tempdir().unwrap();
    let build: Vec<_> = (0..4_000)
        .map(|i| row(777, &format!("hot-payload-{i:05}")))
        .collect();
    let probe = vec![row(777, "p")];
    let mut setup = JoinSetup::new(JoinOp::Inner, build, probe);
    setup.tunables = small_spill_tunables();
    setup.rows_per_chunk = 256;
    setup.mem_limit = 48 << 10;
    let mut node = setup.build_node(temp.path(), CancelToken::new());

    let result: shalerocks::ExecResult<()> = (|| {
        node.open()?;
        while node.next_batch()?.is_some() {}
        Ok(())
    })();
    match result {
        Err(ExecError::RepartitionLimit(_)) => {}
        other => panic!("expected RepartitionLimit, got {other:?}"),
    }
    assert!(counter(&node, "MaxPartitionLevel") >= 1);
    node.close();
    assert_eq!(spill_files_under(temp.path()), 0);
}

#[test]
fn cancellation_mid_probe_releases_resources() {
    let temp = tempdir().unwrap();
    let build: Vec<_> = (0..4_000).map(|k| row(k, &format!("b{k}"))).collect();
    let probe: Vec<_> = (0..4_000).map(|k| row(k, &format!("p{k}"))).collect();
    let mut setup = JoinSetup::new(JoinOp::Inner, build, probe);
    setup.tunables = small_spill_tunables();
    setup.rows_per_chunk = 256;
    setup.mem_limit = 96 << 10;
    let cancel = CancelToken::new();
    let mut node = setup.build_node(temp.path(), cancel.clone());

    node.open().unwrap();
    let first = node.next_batch().unwrap();
    assert!(first.is_some(), "expected output before cancellation");

    cancel.cancel();
    expect_cancelled(node.next_batch());
    expect_cancelled(node.next_batch());
    assert_eq!(spill_files_under(temp.path()), 0);
}

#[test]
fn conservation_across_variants_with_spilling() {
    let variants = [
        JoinOp::Inner,
        JoinOp::LeftOuter,
        JoinOp::RightOuter,
        JoinOp::FullOuter,
        JoinOp::LeftSemi,
        JoinOp::RightSemi,
        JoinOp::LeftAnti,
        JoinOp::RightAnti,
    ];
    let mut rng = StdRng::seed_from_u64(42);
    let build: Vec<_> = (0..2_000)
        .map(|i| {
            let key = if rng.random_ratio(1, 20) {
                None
            } else {
                Some(rng.random_range(0..300))
            };
            (key, format!("b{i}"))
        })
        .collect();
    let probe: Vec<_> = (0..2_000)
        .map(|i| {
            let key = if rng.random_ratio(1, 20) {
                None
            } else {
                Some(rng.random_range(0..300))
            };
            (key, format!("p{i}"))
        })
        .collect();

    for op in variants {
        let temp = tempdir().unwrap();
        let mut setup = JoinSetup::new(op, build.clone(), probe.clone());
        setup.tunables = JoinTunables {
            fanout: 4,
            num_partitioning_bits: 2,
            page_size_bytes: 2048,
            ..JoinTunables::default()
        };
        setup.rows_per_chunk = 256;
        setup.mem_limit = 48 << 10;
        let (rows, node) = setup.run(temp.path()).unwrap();
        assert!(
            counter(&node, "NumSpilledPartitions") > 0,
            "{op:?}: memory setting did not force spilling"
        );
        assert_eq!(
            sorted(rows),
            sorted(reference_join(op, &build, &probe)),
            "join variant {op:?} lost or invented rows under spilling"
        );
    }
}

#[test]
fn replay_is_deterministic() {
    let build: Vec<_> = (0..3_000).map(|k| row(k % 500, &format!("b{k}"))).collect();
    let probe: Vec<_> = (0..3_000).map(|k| row(k % 700, &format!("p{k}"))).collect();
    let mut setup = JoinSetup::new(JoinOp::Inner, build, probe);
    setup.tunables = small_spill_tunables();
    setup.rows_per_chunk = 512;
    setup.mem_limit = 128 << 10;

    let temp_a = tempdir().unwrap();
    let (rows_a, node_a) = setup.run(temp_a.path()).unwrap();
    let temp_b = tempdir().unwrap();
    let (rows_b, node_b) = setup.run(temp_b.path()).unwrap();

    // Identical inputs and seeds: identical output order and counters.
    assert_eq!(rows_a, rows_b);
    for name in [
        "PartitionsCreated",
        "NumSpilledPartitions",
        "NumRepartitions",
        "MaxPartitionLevel",
        "NumBuildRowsPartitioned",
        "NumProbeRowsPartitioned",
        "LargestPartitionPercent",
        "NumHashBuckets",
    ] {
        assert_eq!(counter(&node_a, name), counter(&node_b, name), "{name}");
    }
}

#[test]
fn max_in_mem_build_tables_hook_forces_spilling() {
    let temp = tempdir().unwrap();
    let build: Vec<_> = (0..1_000).map(|k| row(k, &format!("b{k}"))).collect();
    let probe: Vec<_> = (0..1_000).map(|k| row(k, &format!("p{k}"))).collect();
    let mut setup = JoinSetup::new(JoinOp::Inner, build.clone(), probe.clone());
    setup.tunables = JoinTunables {
        max_in_mem_build_tables: 2,
        ..JoinTunables::default()
    };
    let (rows, node) = setup.run(temp.path()).unwrap();
    assert_eq!(
        sorted(rows),
        sorted(reference_join(JoinOp::Inner, &build, &probe))
    );
    assert!(counter(&node, "NumSpilledPartitions") >= 14);
}

#[test]
fn null_safe_equality_matches_null_keys() {
    let temp = tempdir().unwrap();
    let mut setup = JoinSetup::new(
        JoinOp::Inner,
        vec![row(None, "bn"), row(1, "b1")],
        vec![row(None, "pn"), row(2, "p2")],
    );
    setup.null_safe = true;
    let (rows, _node) = setup.run(temp.path()).unwrap();
    let expected = vec![vec![None, Some("pn".into()), None, Some("bn".into())]];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn null_keys_do_not_match_without_null_safe() {
    let temp = tempdir().unwrap();
    let setup = JoinSetup::new(
        JoinOp::LeftOuter,
        vec![row(None, "bn"), row(1, "b1")],
        vec![row(None, "pn"), row(1, "p1")],
    );
    let (rows, _node) = setup.run(temp.path()).unwrap();
    let expected = vec![
        vec![None, Some("pn".into()), None, None],
        vec![Some("1".into()), Some("p1".into()), Some("1".into()), Some("b1".into())],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

fn payload_conjunct(arena: &mut ExprArena) -> Vec<ExprId> {
    // probe payload < build payload over the join scope
    // (probe k, probe v, build k, build v).
    let probe_v = arena.column(1);
    let build_v = arena.column(3);
    vec![arena.add(ExprNode::Lt(probe_v, build_v))]
}

#[test]
fn residual_conjunct_filters_matches() {
    let temp = tempdir().unwrap();
    let mut setup = JoinSetup::new(
        JoinOp::LeftOuter,
        vec![row(1, "m"), row(1, "a"), row(2, "m")],
        vec![row(1, "g"), row(2, "z")],
    );
    setup.conjuncts = payload_conjunct;
    let (rows, _node) = setup.run(temp.path()).unwrap();
    // probe (1,"g") joins only build (1,"m") because "g" < "m" but not < "a";
    // probe (2,"z") has an equi match that fails the conjunct, so it is
    // emitted with a null build side.
    let expected = vec![
        vec![Some("1".into()), Some("g".into()), Some("1".into()), Some("m".into())],
        vec![Some("2".into()), Some("z".into()), None, None],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn right_semi_emits_each_build_row_once() {
    let temp = tempdir().unwrap();
    let setup = JoinSetup::new(
        JoinOp::RightSemi,
        vec![row(1, "b1"), row(2, "b2"), row(2, "b2bis"), row(3, "b3")],
        vec![row(2, "x"), row(2, "y"), row(3, "z")],
    );
    let (rows, _node) = setup.run(temp.path()).unwrap();
    let expected = vec![
        vec![Some("2".into()), Some("b2".into())],
        vec![Some("2".into()), Some("b2bis".into())],
        vec![Some("3".into()), Some("b3".into())],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn mem_limit_exceeded_when_nothing_left_to_spill() {
    let temp = tempdir().unwrap();
    let build: Vec<_> = (0..2_000).map(|k| row(k, &format!("b{k}"))).collect();
    let mut setup = JoinSetup::new(JoinOp::Inner, build, vec![row(1, "p")]);
    setup.tunables = small_spill_tunables();
    setup.rows_per_chunk = 2_000;
    // Too small for even one input chunk's partition writes.
    setup.mem_limit = 512;
    let mut node = setup.build_node(temp.path(), CancelToken::new());
    match node.open() {
        Err(ExecError::MemLimitExceeded(_)) => {}
        other => panic!("expected MemLimitExceeded, got {other:?}"),
    }
    node.close();
}
