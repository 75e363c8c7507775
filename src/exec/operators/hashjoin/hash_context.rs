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
//! Join key evaluation and hashing.
//!
//! Responsibilities:
//! - Evaluates equi-join key expressions on build/probe chunks and normalizes
//!   them through the Arrow row encoding, so multi-column equality (including
//!   null-safe columns) is one byte comparison.
//! - Produces level-salted 32-bit hashes; each repartitioning level rehashes
//!   with an independent seed.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::SchemaRef;
use arrow::row::{RowConverter, Rows, SortField};

use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};

const HASH_SEED: u64 = 0x517cc1b727220a95;

/// Serialized join keys for one chunk: one row-encoded key plus one hash per
/// row. `forbidden_null` marks rows whose non-null-safe key is NULL; such rows
/// never participate in a match.
pub(crate) struct KeyedRows {
    rows: Rows,
    pub hashes: Vec<u32>,
    pub forbidden_null: Vec<bool>,
}

impl KeyedRows {
    pub(crate) fn len(&self) -> usize {
        self.hashes.len()
    }

    pub(crate) fn row_bytes(&self, row: usize) -> &[u8] {
        self.rows.row(row).data()
    }

    pub(crate) fn into_rows(self) -> Rows {
        self.rows
    }
}

pub(crate) struct HashContext {
    arena: Arc<ExprArena>,
    build_keys: Vec<ExprId>,
    probe_keys: Vec<ExprId>,
    null_safe_eq: Vec<bool>,
    converter: RowConverter,
    level: usize,
    seed: u64,
}

impl HashContext {
    pub(crate) fn try_new(
        arena: Arc<ExprArena>,
        build_keys: Vec<ExprId>,
        probe_keys: Vec<ExprId>,
        null_safe_eq: Vec<bool>,
        build_schema: &SchemaRef,
        probe_schema: &SchemaRef,
    ) -> Result<Self, String> {
        if build_keys.is_empty() {
            return Err("hash join requires at least one equi-join predicate".to_string());
        }
        if build_keys.len() != probe_keys.len() || build_keys.len() != null_safe_eq.len() {
            return Err(format!(
                "equi-join predicate arity mismatch: build={} probe={} null_safe={}",
                build_keys.len(),
                probe_keys.len(),
                null_safe_eq.len()
            ));
        }
        let mut fields = Vec::with_capacity(build_keys.len());
        for (build_expr, probe_expr) in build_keys.iter().zip(probe_keys.iter()) {
            let build_type = arena.data_type(*build_expr, build_schema)?;
            let probe_type = arena.data_type(*probe_expr, probe_schema)?;
            if build_type != probe_type {
                return Err(format!(
                    "equi-join key type mismatch: build={build_type:?} probe={probe_type:?}"
                ));
            }
            fields.push(SortField::new(build_type));
        }
        let converter = RowConverter::new(fields)
            .map_err(|e| format!("join key row converter init failed: {e}"))?;
        Ok(Self {
            arena,
            build_keys,
            probe_keys,
            null_safe_eq,
            converter,
            level: 0,
            seed: seed_for_level(0),
        })
    }

    pub(crate) fn level(&self) -> usize {
        self.level
    }

    /// Reconfigure hashing so that `level` produces bucket assignments
    /// statistically independent from every other level.
    pub(crate) fn rehash_for_level(&mut self, level: usize) {
        self.level = level;
        self.seed = seed_for_level(level);
    }

    pub(crate) fn eval_build(&self, chunk: &Chunk) -> Result<KeyedRows, String> {
        self.eval_keys(&self.build_keys, chunk)
    }

    pub(crate) fn eval_probe(&self, chunk: &Chunk) -> Result<KeyedRows, String> {
        self.eval_keys(&self.probe_keys, chunk)
    }

    fn eval_keys(&self, keys: &[ExprId], chunk: &Chunk) -> Result<KeyedRows, String> {
        let num_rows = chunk.len();
        let mut key_arrays: Vec<ArrayRef> = Vec::with_capacity(keys.len());
        for expr in keys {
            key_arrays.push(self.arena.eval(*expr, chunk)?);
        }
        let rows = self
            .converter
            .convert_columns(&key_arrays)
            .map_err(|e| format!("join key row encoding failed: {e}"))?;

        let mut forbidden_null = vec![false; num_rows];
        for (key_idx, array) in key_arrays.iter().enumerate() {
            if self.null_safe_eq[key_idx] || array.null_count() == 0 {
                continue;
            }
            for row in 0..num_rows {
                if array.is_null(row) {
                    forbidden_null[row] = true;
                }
            }
        }

        let mut hashes = Vec::with_capacity(num_rows);
        for row in 0..num_rows {
            hashes.push(hash32_with_seed(self.seed, rows.row(row).data()));
        }
        Ok(KeyedRows {
            rows,
            hashes,
            forbidden_null,
        })
    }
}

/// Seeds for distinct levels must decorrelate bucket assignments of rows that
/// collided at the previous level.
pub(crate) fn seed_for_level(level: usize) -> u64 {
    mix_u64(HASH_SEED ^ (level as u64))
}

fn hash32_with_seed(seed: u64, bytes: &[u8]) -> u32 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    // FNV concentrates entropy in the low bits; finalize so the router's
    // high-bit slices are usable.
    (mix_u64(hash) >> 32) as u32
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}
