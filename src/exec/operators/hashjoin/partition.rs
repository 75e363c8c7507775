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
//! One bucket of a hash-partitioned join input.
//!
//! A partition owns a build stream and a lazily created probe stream at a
//! given repartitioning level, and optionally an in-memory hash table built
//! from the build stream. It is spilled exactly when it has no hash table and
//! its build stream is unpinned.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use super::hash_context::HashContext;
use super::join_hash_table::JoinHashTable;
use super::tuple_stream::{AppendStatus, BufferedTupleStream};
use crate::exec::chunk::Chunk;
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::SpillCodec;
use crate::runtime::mem_tracker::MemTracker;

/// Read-only context shared by partition operations; partitions hold no
/// reference back to the operator.
pub(crate) struct JoinContext {
    pub tracker: Arc<MemTracker>,
    pub dir_manager: Arc<DirManager>,
    pub codec: SpillCodec,
    pub page_size: usize,
    pub build_schema: SchemaRef,
    pub probe_schema: SchemaRef,
    /// Keep forbidden-null build rows in hash tables so they can be emitted
    /// as unmatched build rows (right outer, full outer, right anti).
    pub keep_null_build_rows: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BuildTableResult {
    Built,
    DidNotFit,
}

/// Route a 32-bit hash to a partition index at the given level. Each level
/// consumes a fresh `bits`-wide slice from the high end of the hash, so rows
/// that collided at level L stay independent at level L+1.
pub(crate) fn route_hash(hash: u32, level: u32, bits: u32, fanout: usize) -> usize {
    debug_assert!(fanout.is_power_of_two());
    let shift = 32 - bits - level * bits;
    ((hash >> shift) as usize) & (fanout - 1)
}

pub(crate) struct JoinPartition {
    level: usize,
    build_stream: BufferedTupleStream,
    probe_stream: Option<BufferedTupleStream>,
    hash_table: Option<JoinHashTable>,
    /// Reservation held for the hash table, released on close.
    table_reserved: i64,
    ever_spilled: bool,
    is_closed: bool,
}

impl JoinPartition {
    pub(crate) fn new(ctx: &JoinContext, level: usize) -> Self {
        Self {
            level,
            build_stream: BufferedTupleStream::new(
                ctx.build_schema.clone(),
                Arc::clone(&ctx.tracker),
                Arc::clone(&ctx.dir_manager),
                ctx.codec,
                ctx.page_size,
            ),
            probe_stream: None,
            hash_table: None,
            table_reserved: 0,
            ever_spilled: false,
            is_closed: false,
        }
    }

    pub(crate) fn level(&self) -> usize {
        self.level
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub(crate) fn is_spilled(&self) -> bool {
        self.hash_table.is_none() && !self.build_stream.is_pinned()
    }

    pub(crate) fn ever_spilled(&self) -> bool {
        self.ever_spilled
    }

    pub(crate) fn hash_table(&self) -> Option<&JoinHashTable> {
        self.hash_table.as_ref()
    }

    pub(crate) fn hash_table_mut(&mut self) -> Option<&mut JoinHashTable> {
        self.hash_table.as_mut()
    }

    pub(crate) fn build_rows(&self) -> usize {
        self.build_stream.num_rows()
    }

    pub(crate) fn probe_rows(&self) -> usize {
        self.probe_stream.as_ref().map(|s| s.num_rows()).unwrap_or(0)
    }

    /// Pinned build-side chunks backing the hash table's row references.
    pub(crate) fn build_pages(&self) -> &[Chunk] {
        self.build_stream.pages()
    }

    pub(crate) fn build_stream_mut(&mut self) -> &mut BufferedTupleStream {
        &mut self.build_stream
    }

    pub(crate) fn take_probe_stream(&mut self) -> Option<BufferedTupleStream> {
        self.probe_stream.take()
    }

    pub(crate) fn append_build(&mut self, chunk: Chunk) -> Result<AppendStatus, String> {
        self.build_stream.add_chunk(chunk)
    }

    pub(crate) fn append_probe(&mut self, ctx: &JoinContext, chunk: Chunk) -> Result<AppendStatus, String> {
        if self.probe_stream.is_none() {
            self.probe_stream = Some(BufferedTupleStream::new(
                ctx.probe_schema.clone(),
                Arc::clone(&ctx.tracker),
                Arc::clone(&ctx.dir_manager),
                ctx.codec,
                ctx.page_size,
            ));
        }
        self.probe_stream
            .as_mut()
            .expect("probe stream")
            .add_chunk(chunk)
    }

    /// Reservation currently pinned by this partition's streams.
    pub(crate) fn pinned_bytes(&self) -> usize {
        self.build_stream.pinned_bytes()
            + self
                .probe_stream
                .as_ref()
                .map(|s| s.pinned_bytes())
                .unwrap_or(0)
    }

    /// Estimated bytes to hold all build rows pinned plus the hash table.
    pub(crate) fn estimated_in_mem_size(&self) -> usize {
        self.build_stream.total_bytes() + JoinHashTable::estimate_size(self.build_stream.num_rows())
    }

    /// Unpin both streams, releasing their reservation down to the write
    /// buffers. The partition is spilled afterwards.
    pub(crate) fn spill(&mut self) -> Result<(), String> {
        self.ever_spilled = true;
        self.build_stream.unpin()?;
        if let Some(probe) = self.probe_stream.as_mut() {
            probe.unpin()?;
        }
        Ok(())
    }

    /// Pin the build stream and construct the hash table from it. On memory
    /// pressure the partition is left spilled and `DidNotFit` is returned.
    pub(crate) fn build_hash_table(
        &mut self,
        ctx: &JoinContext,
        hash_ctx: &HashContext,
    ) -> Result<BuildTableResult, String> {
        if self.hash_table.is_some() {
            return Ok(BuildTableResult::Built);
        }
        if hash_ctx.level() != self.level {
            return Err(format!(
                "hash context level {} does not match partition level {}",
                hash_ctx.level(),
                self.level
            ));
        }
        if !self.build_stream.pin_for_read()? {
            self.ever_spilled = true;
            return Ok(BuildTableResult::DidNotFit);
        }

        let num_rows = self.build_stream.num_rows();
        let table_bytes = i64::try_from(JoinHashTable::estimate_size(num_rows)).unwrap_or(i64::MAX);
        if !ctx.tracker.try_consume(table_bytes) {
            self.build_stream.unpin()?;
            self.ever_spilled = true;
            return Ok(BuildTableResult::DidNotFit);
        }
        self.table_reserved = table_bytes;

        let mut table = JoinHashTable::with_capacity(num_rows);
        for (chunk_idx, chunk) in self.build_stream.pages().iter().enumerate() {
            let keyed = hash_ctx.eval_build(chunk)?;
            table.insert_chunk(chunk_idx as u32, keyed, ctx.keep_null_build_rows)?;
        }
        self.hash_table = Some(table);
        Ok(BuildTableResult::Built)
    }

    /// Flush buffered writes of both spilled streams so a drained partition
    /// holds no reservation while it waits in the spilled queue.
    pub(crate) fn flush_spilled_streams(&mut self) -> Result<(), String> {
        self.build_stream.flush()?;
        if let Some(probe) = self.probe_stream.as_mut() {
            probe.flush()?;
        }
        Ok(())
    }

    /// Drop an in-memory hash table, returning its reservation. Used when a
    /// built partition is picked as a spill victim during probe processing.
    pub(crate) fn drop_hash_table(&mut self, ctx: &JoinContext) {
        if self.hash_table.take().is_some() {
            ctx.tracker.release(self.table_reserved);
            self.table_reserved = 0;
        }
    }

    /// Release the hash table and both streams. Safe to call once; later
    /// calls are no-ops.
    pub(crate) fn close(&mut self, ctx: &JoinContext) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        if self.hash_table.take().is_some() {
            ctx.tracker.release(self.table_reserved);
            self.table_reserved = 0;
        }
        self.build_stream.close();
        if let Some(probe) = self.probe_stream.as_mut() {
            probe.close();
        }
    }
}
