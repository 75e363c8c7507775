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
//! Common utilities and helpers for hash-join integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use shalerocks::common::config::JoinTunables;
use shalerocks::exec::chunk::Chunk;
use shalerocks::exec::expr::{ExprArena, ExprId};
use shalerocks::exec::operators::hashjoin::{
    CancelToken, ChunkSource, EquiJoinPredicate, JoinOp, PartitionedHashJoinConfig,
    PartitionedHashJoinNode,
};
use shalerocks::exec::spill::SpillStorageConfig;
use shalerocks::{ExecError, ExecResult, shalerocks_logging};

/// A row used by test inputs: key (None = SQL NULL) and a string payload.
pub type TestRow = (Option<i64>, String);

/// Output rows flattened to printable cells for multiset comparison.
pub type OutRow = Vec<Option<String>>;

pub fn row(key: impl Into<Option<i64>>, payload: &str) -> TestRow {
    (key.into(), payload.to_string())
}

pub fn test_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Utf8, true),
    ]))
}

pub fn chunk_from_rows(rows: &[TestRow]) -> Chunk {
    let keys: Vec<Option<i64>> = rows.iter().map(|(k, _)| *k).collect();
    let payloads: Vec<Option<&str>> = rows.iter().map(|(_, v)| Some(v.as_str())).collect();
    let batch = RecordBatch::try_new(
        test_schema(),
        vec![
            Arc::new(Int64Array::from(keys)),
            Arc::new(StringArray::from(payloads)),
        ],
    )
    .unwrap();
    Chunk::new(batch)
}

pub fn chunks_from_rows(rows: &[TestRow], rows_per_chunk: usize) -> Vec<Chunk> {
    rows.chunks(rows_per_chunk.max(1))
        .map(chunk_from_rows)
        .collect()
}

/// A chunk source backed by a queue of chunks.
pub struct TestSource {
    chunks: VecDeque<Chunk>,
}

impl TestSource {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }

    pub fn from_rows(rows: &[TestRow], rows_per_chunk: usize) -> Self {
        Self::new(chunks_from_rows(rows, rows_per_chunk))
    }
}

impl ChunkSource for TestSource {
    fn get_next(&mut self) -> ExecResult<Option<Chunk>> {
        Ok(self.chunks.pop_front())
    }
}

pub struct JoinSetup {
    pub op: JoinOp,
    pub build: Vec<TestRow>,
    pub probe: Vec<TestRow>,
    pub rows_per_chunk: usize,
    pub mem_limit: i64,
    pub tunables: JoinTunables,
    pub null_safe: bool,
    /// Residual conjuncts built against the join scope
    /// (probe k, probe v, build k, build v) = columns 0..4.
    pub conjuncts: fn(&mut ExprArena) -> Vec<ExprId>,
}

impl JoinSetup {
    pub fn new(op: JoinOp, build: Vec<TestRow>, probe: Vec<TestRow>) -> Self {
        Self {
            op,
            build,
            probe,
            rows_per_chunk: 1024,
            mem_limit: 64 << 20,
            tunables: JoinTunables::default(),
            null_safe: false,
            conjuncts: |_| Vec::new(),
        }
    }

    pub fn build_node(&self, spill_dir: &Path, cancel: CancelToken) -> PartitionedHashJoinNode {
        shalerocks_logging::init_with_level("warn");
        let mut arena = ExprArena::default();
        let key = arena.column(0);
        let other_conjuncts = (self.conjuncts)(&mut arena);
        let config = PartitionedHashJoinConfig {
            join_op: self.op,
            equi_predicates: vec![EquiJoinPredicate {
                build_expr: key,
                probe_expr: key,
                null_safe: self.null_safe,
            }],
            other_conjuncts,
            tunables: self.tunables.clone(),
        };
        let storage = SpillStorageConfig::new(vec![spill_dir.to_path_buf()]);
        PartitionedHashJoinNode::try_new(
            config,
            Arc::new(arena),
            Box::new(TestSource::from_rows(&self.build, self.rows_per_chunk)),
            Box::new(TestSource::from_rows(&self.probe, self.rows_per_chunk)),
            test_schema(),
            test_schema(),
            self.mem_limit,
            &storage,
            cancel,
        )
        .expect("construct join node")
    }

    pub fn run(&self, spill_dir: &Path) -> ExecResult<(Vec<OutRow>, PartitionedHashJoinNode)> {
        let mut node = self.build_node(spill_dir, CancelToken::new());
        node.open()?;
        let mut rows = Vec::new();
        while let Some(chunk) = node.next_batch()? {
            rows.extend(rows_from_chunk(&chunk));
        }
        node.close();
        Ok((rows, node))
    }
}

pub fn rows_from_chunk(chunk: &Chunk) -> Vec<OutRow> {
    let mut rows = Vec::with_capacity(chunk.len());
    for row in 0..chunk.len() {
        rows.push(chunk.columns().iter().map(|col| cell(col, row)).collect());
    }
    rows
}

fn cell(col: &ArrayRef, row: usize) -> Option<String> {
    if col.is_null(row) {
        return None;
    }
    match col.data_type() {
        DataType::Int64 => {
            let arr = col.as_any().downcast_ref::<Int64Array>().unwrap();
            Some(arr.value(row).to_string())
        }
        DataType::Utf8 => {
            let arr = col.as_any().downcast_ref::<StringArray>().unwrap();
            Some(arr.value(row).to_string())
        }
        other => panic!("unsupported test column type {other:?}"),
    }
}

pub fn sorted(mut rows: Vec<OutRow>) -> Vec<OutRow> {
    rows.sort();
    rows
}

fn out_cells(row: &TestRow) -> (Option<String>, Option<String>) {
    (row.0.map(|k| k.to_string()), Some(row.1.clone()))
}

/// Reference non-spilling hash join over the test inputs, with NULL keys
/// matching nothing (null_safe = false).
pub fn reference_join(op: JoinOp, build: &[TestRow], probe: &[TestRow]) -> Vec<OutRow> {
    let matches_of = |pk: Option<i64>| -> Vec<usize> {
        match pk {
            None => Vec::new(),
            Some(k) => build
                .iter()
                .enumerate()
                .filter(|(_, (bk, _))| *bk == Some(k))
                .map(|(idx, _)| idx)
                .collect(),
        }
    };
    let mut build_matched = vec![false; build.len()];
    let mut out = Vec::new();

    for probe_row in probe {
        let matched = matches_of(probe_row.0);
        let (pk, pv) = out_cells(probe_row);
        match op {
            JoinOp::Inner | JoinOp::LeftOuter | JoinOp::RightOuter | JoinOp::FullOuter => {
                for &idx in &matched {
                    let (bk, bv) = out_cells(&build[idx]);
                    out.push(vec![pk.clone(), pv.clone(), bk, bv]);
                    build_matched[idx] = true;
                }
                if matched.is_empty()
                    && matches!(op, JoinOp::LeftOuter | JoinOp::FullOuter)
                {
                    out.push(vec![pk.clone(), pv.clone(), None, None]);
                }
            }
            JoinOp::LeftSemi => {
                if !matched.is_empty() {
                    out.push(vec![pk.clone(), pv.clone()]);
                }
            }
            JoinOp::LeftAnti => {
                if matched.is_empty() {
                    out.push(vec![pk.clone(), pv.clone()]);
                }
            }
            JoinOp::RightSemi | JoinOp::RightAnti => {
                for &idx in &matched {
                    build_matched[idx] = true;
                }
            }
        }
    }

    match op {
        JoinOp::RightOuter | JoinOp::FullOuter => {
            for (idx, build_row) in build.iter().enumerate() {
                if !build_matched[idx] {
                    let (bk, bv) = out_cells(build_row);
                    out.push(vec![None, None, bk, bv]);
                }
            }
        }
        JoinOp::RightSemi => {
            for (idx, build_row) in build.iter().enumerate() {
                if build_matched[idx] {
                    let (bk, bv) = out_cells(build_row);
                    out.push(vec![bk, bv]);
                }
            }
        }
        JoinOp::RightAnti => {
            for (idx, build_row) in build.iter().enumerate() {
                if !build_matched[idx] {
                    let (bk, bv) = out_cells(build_row);
                    out.push(vec![bk, bv]);
                }
            }
        }
        _ => {}
    }
    out
}

pub fn counter(node: &PartitionedHashJoinNode, name: &str) -> i64 {
    node.profile().counter_value(name)
}

pub fn spill_files_under(dir: &Path) -> usize {
    let mut count = 0;
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += spill_files_under(&path);
        } else {
            count += 1;
        }
    }
    count
}

pub fn expect_cancelled(result: ExecResult<Option<Chunk>>) {
    match result {
        Err(ExecError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
}
