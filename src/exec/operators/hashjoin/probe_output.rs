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
//! Row assembly helpers for hash-join output construction.
//!
//! Responsibilities:
//! - Splits a hashed chunk into per-partition sub-chunks.
//! - Gathers probe rows, build rows (across pinned chunks), and null-filled
//!   sides into output batches for the join variants.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch, UInt32Array, new_null_array};
use arrow::compute::{interleave, take, take_record_batch};
use arrow::datatypes::{Schema, SchemaRef};

use super::partition::route_hash;
use crate::exec::chunk::Chunk;

/// Joined output schema: left (probe) columns followed by right (build)
/// columns.
pub fn concat_schemas(left: SchemaRef, right: SchemaRef) -> SchemaRef {
    let mut fields = left.fields().to_vec();
    fields.extend(right.fields().to_vec());
    Arc::new(Schema::new(fields))
}

/// The same fields with nullability forced on, for the side of an outer join
/// that gets null-extended.
pub fn nullable_schema(schema: &SchemaRef) -> SchemaRef {
    let fields: Vec<_> = schema
        .fields()
        .iter()
        .map(|field| field.as_ref().clone().with_nullable(true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Split `chunk` into per-partition sub-chunks by routing each row's hash.
/// Entry `i` is None when no row landed in partition `i`.
pub(crate) fn split_chunk(
    chunk: &Chunk,
    hashes: &[u32],
    level: u32,
    bits: u32,
    fanout: usize,
) -> Result<Vec<Option<(Chunk, Vec<u32>)>>, String> {
    let mut indices_by_partition: Vec<Vec<u32>> = vec![Vec::new(); fanout];
    for (row, hash) in hashes.iter().enumerate() {
        let idx = if fanout == 1 {
            0
        } else {
            route_hash(*hash, level, bits, fanout)
        };
        indices_by_partition[idx].push(row as u32);
    }
    let mut out = Vec::with_capacity(fanout);
    for indices in indices_by_partition {
        if indices.is_empty() {
            out.push(None);
            continue;
        }
        if indices.len() == chunk.len() {
            out.push(Some((chunk.clone(), indices)));
            continue;
        }
        let idx_array = UInt32Array::from(indices.clone());
        let sub = take_record_batch(&chunk.batch, &idx_array)
            .map_err(|e| format!("partition chunk split failed: {e}"))?;
        out.push(Some((Chunk::new(sub), indices)));
    }
    Ok(out)
}

/// Probe-side columns for the given row indices.
pub(crate) fn take_columns(chunk: &Chunk, indices: &[u32]) -> Result<Vec<ArrayRef>, String> {
    let idx_array: ArrayRef = Arc::new(UInt32Array::from(indices.to_vec()));
    let mut columns = Vec::with_capacity(chunk.columns().len());
    for col in chunk.columns() {
        let taken =
            take(col.as_ref(), &idx_array, None).map_err(|e| format!("take rows failed: {e}"))?;
        columns.push(taken);
    }
    Ok(columns)
}

/// Build-side columns gathered across the partition's pinned chunks by
/// (chunk index, row index) references.
pub(crate) fn gather_columns(
    pages: &[Chunk],
    refs: &[(usize, usize)],
) -> Result<Vec<ArrayRef>, String> {
    let Some(first) = pages.first() else {
        return Err("gather from partition with no pinned pages".to_string());
    };
    let num_columns = first.columns().len();
    let mut columns = Vec::with_capacity(num_columns);
    for col_idx in 0..num_columns {
        let arrays: Vec<&dyn Array> = pages
            .iter()
            .map(|page| page.columns()[col_idx].as_ref())
            .collect();
        let gathered =
            interleave(&arrays, refs).map_err(|e| format!("gather build rows failed: {e}"))?;
        columns.push(gathered);
    }
    Ok(columns)
}

pub(crate) fn null_columns(schema: &SchemaRef, len: usize) -> Vec<ArrayRef> {
    schema
        .fields()
        .iter()
        .map(|field| new_null_array(field.data_type(), len))
        .collect()
}

pub(crate) fn assemble(schema: &SchemaRef, columns: Vec<ArrayRef>) -> Result<RecordBatch, String> {
    RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| format!("assemble join output failed: {e}"))
}
