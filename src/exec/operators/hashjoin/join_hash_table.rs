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
//! Hash table over build rows of one in-memory partition.
//!
//! Buckets hold chains of entry ids; an entry references a build row by
//! (chunk index, row index) into the partition's pinned stream, stores the
//! row's 32-bit hash for cheap chain filtering, and carries the matched flag
//! that drives right/full outer and right semi/anti emission. Keys are the
//! serialized key rows kept per chunk; equality is one byte comparison.

use arrow::row::Rows;

use super::hash_context::KeyedRows;

const ENTRY_NONE: u32 = u32::MAX;
const LOAD_FACTOR_NUM: usize = 3;
const LOAD_FACTOR_DEN: usize = 4;
const MIN_BUCKETS: usize = 16;
// Rough per-row footprint used for partition size estimates: entry fields,
// bucket share, and encoded key bytes.
const ESTIMATED_BYTES_PER_ROW: usize = 48;

pub(crate) struct JoinHashTable {
    bucket_head: Vec<u32>,
    bucket_mask: u32,
    next: Vec<u32>,
    row_chunk: Vec<u32>,
    row_in_chunk: Vec<u32>,
    hashes: Vec<u32>,
    /// False for forbidden-null entries, which are kept for unmatched-build
    /// output but never reachable from a bucket.
    chained: Vec<bool>,
    chained_count: usize,
    matched: Vec<bool>,
    keys: Vec<Rows>,
}

impl JoinHashTable {
    pub(crate) fn with_capacity(expected_rows: usize) -> Self {
        let buckets = bucket_count_for(expected_rows);
        Self {
            bucket_head: vec![ENTRY_NONE; buckets],
            bucket_mask: (buckets - 1) as u32,
            next: Vec::with_capacity(expected_rows),
            row_chunk: Vec::with_capacity(expected_rows),
            row_in_chunk: Vec::with_capacity(expected_rows),
            hashes: Vec::with_capacity(expected_rows),
            chained: Vec::with_capacity(expected_rows),
            chained_count: 0,
            matched: Vec::with_capacity(expected_rows),
            keys: Vec::new(),
        }
    }

    /// Estimated bytes for a table over `num_rows` build rows, used to decide
    /// whether a partition can be built in memory.
    pub(crate) fn estimate_size(num_rows: usize) -> usize {
        num_rows.saturating_mul(ESTIMATED_BYTES_PER_ROW)
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.next.len()
    }

    pub(crate) fn num_buckets(&self) -> usize {
        self.bucket_head.len()
    }

    /// Insert the rows of one build chunk. Chunks must be inserted in stream
    /// order; `keep_nulls` retains forbidden-null rows as unmatchable entries
    /// (needed when unmatched build rows are emitted later).
    pub(crate) fn insert_chunk(
        &mut self,
        chunk_idx: u32,
        keyed: KeyedRows,
        keep_nulls: bool,
    ) -> Result<(), String> {
        if chunk_idx as usize != self.keys.len() {
            return Err(format!(
                "join build chunk inserted out of order: got {chunk_idx}, expected {}",
                self.keys.len()
            ));
        }
        for row in 0..keyed.len() {
            let forbidden = keyed.forbidden_null[row];
            if forbidden && !keep_nulls {
                continue;
            }
            let entry = u32::try_from(self.next.len())
                .map_err(|_| "join build row count overflow".to_string())?;
            if entry == ENTRY_NONE {
                return Err("join build row count overflow".to_string());
            }
            self.row_chunk.push(chunk_idx);
            self.row_in_chunk.push(row as u32);
            self.hashes.push(keyed.hashes[row]);
            self.matched.push(false);
            if forbidden {
                self.next.push(ENTRY_NONE);
                self.chained.push(false);
                continue;
            }
            self.chained.push(true);
            self.chained_count += 1;
            self.grow_if_needed();
            let bucket = (keyed.hashes[row] & self.bucket_mask) as usize;
            self.next.push(self.bucket_head[bucket]);
            self.bucket_head[bucket] = entry;
        }
        self.keys.push(keyed.into_rows());
        Ok(())
    }

    /// Iterate entries whose stored hash equals `hash`; the caller filters the
    /// survivors with `key_equals`.
    pub(crate) fn probe(&self, hash: u32) -> ProbeIter<'_> {
        let entry = self.bucket_head[(hash & self.bucket_mask) as usize];
        ProbeIter {
            table: self,
            entry,
            hash,
        }
    }

    pub(crate) fn key_equals(&self, entry: u32, probe_key: &[u8]) -> bool {
        let (chunk_idx, row_idx) = self.entry_row(entry);
        self.keys[chunk_idx as usize].row(row_idx as usize).data() == probe_key
    }

    pub(crate) fn entry_row(&self, entry: u32) -> (u32, u32) {
        (
            self.row_chunk[entry as usize],
            self.row_in_chunk[entry as usize],
        )
    }

    pub(crate) fn is_matched(&self, entry: u32) -> bool {
        self.matched[entry as usize]
    }

    pub(crate) fn set_matched(&mut self, entry: u32) {
        self.matched[entry as usize] = true;
    }

    fn grow_if_needed(&mut self) {
        if self.chained_count * LOAD_FACTOR_DEN <= self.bucket_head.len() * LOAD_FACTOR_NUM {
            return;
        }
        let new_buckets = self.bucket_head.len() * 2;
        self.bucket_head = vec![ENTRY_NONE; new_buckets];
        self.bucket_mask = (new_buckets - 1) as u32;
        // Re-chain in insertion order so iteration stays deterministic.
        for entry in 0..self.next.len() {
            if !self.chained[entry] {
                continue;
            }
            let bucket = (self.hashes[entry] & self.bucket_mask) as usize;
            self.next[entry] = self.bucket_head[bucket];
            self.bucket_head[bucket] = entry as u32;
        }
    }
}

pub(crate) struct ProbeIter<'a> {
    table: &'a JoinHashTable,
    entry: u32,
    hash: u32,
}

impl Iterator for ProbeIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        while self.entry != ENTRY_NONE {
            let current = self.entry;
            self.entry = self.table.next[current as usize];
            if self.table.hashes[current as usize] == self.hash {
                return Some(current);
            }
        }
        None
    }
}

fn bucket_count_for(expected_rows: usize) -> usize {
    let needed = expected_rows * LOAD_FACTOR_DEN / LOAD_FACTOR_NUM;
    needed.max(MIN_BUCKETS).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::Chunk;
    use crate::exec::expr::ExprArena;
    use crate::exec::operators::hashjoin::hash_context::{HashContext, KeyedRows};
    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use std::sync::Arc;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]))
    }

    fn context() -> HashContext {
        let mut arena = ExprArena::default();
        let key = arena.column(0);
        let schema = schema();
        HashContext::try_new(Arc::new(arena), vec![key], vec![key], vec![false], &schema, &schema)
            .unwrap()
    }

    fn keyed(ctx: &HashContext, keys: Vec<Option<i64>>) -> KeyedRows {
        let batch =
            RecordBatch::try_new(schema(), vec![Arc::new(Int64Array::from(keys))]).unwrap();
        ctx.eval_build(&Chunk::new(batch)).unwrap()
    }

    #[test]
    fn probe_finds_all_duplicates_after_resize() {
        let ctx = context();
        let mut table = JoinHashTable::with_capacity(0);
        // Enough distinct keys to force several doublings, plus duplicates.
        let keys: Vec<Option<i64>> = (0..200).map(|v| Some(v % 50)).collect();
        let keyed_rows = keyed(&ctx, keys);
        let probe_keyed = keyed(&ctx, vec![Some(7)]);
        table.insert_chunk(0, keyed_rows, false).unwrap();
        assert!(table.num_buckets() > MIN_BUCKETS);

        let hash = probe_keyed.hashes[0];
        let matches: Vec<u32> = table
            .probe(hash)
            .filter(|e| table.key_equals(*e, probe_keyed.row_bytes(0)))
            .collect();
        assert_eq!(matches.len(), 4);
        for entry in matches {
            let (chunk_idx, row_idx) = table.entry_row(entry);
            assert_eq!(chunk_idx, 0);
            assert_eq!(row_idx % 50, 7);
        }
    }

    #[test]
    fn forbidden_null_entries_are_kept_but_unreachable() {
        let ctx = context();
        let mut table = JoinHashTable::with_capacity(4);
        let keyed_rows = keyed(&ctx, vec![Some(1), None, Some(2)]);
        let null_probe = keyed(&ctx, vec![None]);
        table.insert_chunk(0, keyed_rows, true).unwrap();
        assert_eq!(table.entry_count(), 3);
        let found: Vec<u32> = table
            .probe(null_probe.hashes[0])
            .filter(|e| table.key_equals(*e, null_probe.row_bytes(0)))
            .collect();
        assert!(found.is_empty());
    }

    #[test]
    fn matched_flags_survive() {
        let ctx = context();
        let mut table = JoinHashTable::with_capacity(4);
        table.insert_chunk(0, keyed(&ctx, vec![Some(1), Some(2)]), false).unwrap();
        assert!(!table.is_matched(0));
        table.set_matched(0);
        assert!(table.is_matched(0));
        assert!(!table.is_matched(1));
    }
}
