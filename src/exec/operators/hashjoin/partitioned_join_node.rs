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
//! Partitioned hash join operator.
//!
//! The operator runs in distinct phases:
//!  1. Consume all build input and partition it. No hash tables yet.
//!  2. Construct hash tables for as many partitions as fit in memory.
//!  3. Consume the probe rows. Rows belonging to spilled partitions are
//!     spilled as well.
//!  4. Walk the spilled partitions: build the hash table from the spilled
//!     build rows and process the spilled probe rows. A partition that is
//!     still too big is repartitioned with a rehashed level and runs through
//!     phases 1-3 again from its own streams.
//!
//! Responsibilities:
//! - Owns the partition collections and the spill policy.
//! - Implements per-variant probe emission and unmatched-build output.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;

use super::hash_context::{HashContext, KeyedRows};
use super::partition::{BuildTableResult, JoinContext, JoinPartition};
use super::probe_output::{
    assemble, concat_schemas, gather_columns, null_columns, nullable_schema, split_chunk,
    take_columns,
};
use super::tuple_stream::{AppendStatus, BufferedTupleStream};
use crate::common::config::JoinTunables;
use crate::common::error::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprArena, ExprId};
use crate::exec::spill::SpillStorageConfig;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterRef, RuntimeProfile, TUnit};
use crate::shalerocks_logging::debug;

/// Produces input chunks for one side of the join. `None` signals end of
/// stream.
pub trait ChunkSource {
    fn get_next(&mut self) -> ExecResult<Option<Chunk>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOp {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    RightSemi,
    LeftAnti,
    RightAnti,
}

impl JoinOp {
    /// Unmatched build rows are emitted after the probe side drains.
    fn needs_unmatched_build_output(self) -> bool {
        matches!(self, JoinOp::RightOuter | JoinOp::FullOuter | JoinOp::RightAnti)
    }

    /// Matched flags must survive until the partition is fully probed.
    fn needs_matched_flags(self) -> bool {
        matches!(
            self,
            JoinOp::RightOuter | JoinOp::FullOuter | JoinOp::RightSemi | JoinOp::RightAnti
        )
    }

    /// Output carries only one side's columns.
    fn emits_probe_side_only(self) -> bool {
        matches!(self, JoinOp::LeftSemi | JoinOp::LeftAnti)
    }

    fn emits_build_side_only(self) -> bool {
        matches!(self, JoinOp::RightSemi | JoinOp::RightAnti)
    }

    fn as_str(self) -> &'static str {
        match self {
            JoinOp::Inner => "INNER",
            JoinOp::LeftOuter => "LEFT_OUTER",
            JoinOp::RightOuter => "RIGHT_OUTER",
            JoinOp::FullOuter => "FULL_OUTER",
            JoinOp::LeftSemi => "LEFT_SEMI",
            JoinOp::RightSemi => "RIGHT_SEMI",
            JoinOp::LeftAnti => "LEFT_ANTI",
            JoinOp::RightAnti => "RIGHT_ANTI",
        }
    }
}

/// One `<build_expr> = <probe_expr>` pair; `null_safe` makes NULL = NULL
/// match.
#[derive(Clone, Debug)]
pub struct EquiJoinPredicate {
    pub build_expr: ExprId,
    pub probe_expr: ExprId,
    pub null_safe: bool,
}

#[derive(Clone, Debug)]
pub struct PartitionedHashJoinConfig {
    pub join_op: JoinOp,
    pub equi_predicates: Vec<EquiJoinPredicate>,
    /// Residual conjuncts over the concatenated probe+build row.
    pub other_conjuncts: Vec<ExprId>,
    pub tunables: JoinTunables,
}

/// Externally settable cancellation flag, checked at batch boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinNodeState {
    /// Partitioning the build child's input.
    PartitioningBuild,
    /// Processing the probe child's input.
    ProcessingProbe,
    /// Probing a spilled partition whose hash table fit in memory.
    ProbingSpilledPartition,
    /// Repartitioning one spilled partition into a fresh fan-out.
    Repartitioning,
}

impl JoinNodeState {
    fn as_str(self) -> &'static str {
        match self {
            JoinNodeState::PartitioningBuild => "PARTITIONING_BUILD",
            JoinNodeState::ProcessingProbe => "PROCESSING_PROBE",
            JoinNodeState::ProbingSpilledPartition => "PROBING_SPILLED_PARTITION",
            JoinNodeState::Repartitioning => "REPARTITIONING",
        }
    }
}

pub struct PartitionedHashJoinNode {
    config: PartitionedHashJoinConfig,
    arena: Arc<ExprArena>,
    ctx: JoinContext,
    hash_ctx: HashContext,
    build_child: Box<dyn ChunkSource>,
    probe_child: Box<dyn ChunkSource>,
    cancel: CancelToken,
    profile: RuntimeProfile,

    /// Concatenated probe+build schema, the scope of residual conjuncts.
    join_scope_schema: SchemaRef,
    output_schema: SchemaRef,

    state: JoinNodeState,
    opened: bool,
    closed: bool,
    probe_eos: bool,

    hash_partitions: Vec<JoinPartition>,
    spilled_partitions: VecDeque<JoinPartition>,
    /// Probe rows of the spilled partition currently being drained.
    input_probe_stream: Option<BufferedTupleStream>,
    output_build_partitions: VecDeque<JoinPartition>,
    output_build_cursor: usize,

    partition_build_timer: CounterRef,
    partitions_created: CounterRef,
    max_partition_level: CounterRef,
    num_build_rows_partitioned: CounterRef,
    num_probe_rows_partitioned: CounterRef,
    num_repartitions: CounterRef,
    num_spilled_partitions: CounterRef,
    largest_partition_percent: CounterRef,
    num_hash_buckets: CounterRef,
}

impl PartitionedHashJoinNode {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        config: PartitionedHashJoinConfig,
        arena: Arc<ExprArena>,
        build_child: Box<dyn ChunkSource>,
        probe_child: Box<dyn ChunkSource>,
        build_schema: SchemaRef,
        probe_schema: SchemaRef,
        mem_limit_bytes: i64,
        spill_storage: &SpillStorageConfig,
        cancel: CancelToken,
    ) -> ExecResult<Self> {
        config.tunables.validate().map_err(ExecError::Internal)?;
        let build_keys: Vec<ExprId> = config.equi_predicates.iter().map(|p| p.build_expr).collect();
        let probe_keys: Vec<ExprId> = config.equi_predicates.iter().map(|p| p.probe_expr).collect();
        let null_safe: Vec<bool> = config.equi_predicates.iter().map(|p| p.null_safe).collect();
        let hash_ctx = HashContext::try_new(
            Arc::clone(&arena),
            build_keys,
            probe_keys,
            null_safe,
            &build_schema,
            &probe_schema,
        )
        .map_err(ExecError::Internal)?;

        let dir_manager = spill_storage.open().map_err(ExecError::Io)?;
        let tracker = MemTracker::new_limited_root("HASH_JOIN", mem_limit_bytes);
        let ctx = JoinContext {
            tracker,
            dir_manager,
            codec: spill_storage.ipc_compression,
            page_size: config.tunables.page_size_bytes,
            build_schema: build_schema.clone(),
            probe_schema: probe_schema.clone(),
            keep_null_build_rows: config.join_op.needs_unmatched_build_output(),
        };

        let join_scope_schema = concat_schemas(probe_schema.clone(), build_schema.clone());
        // The null-extended side of an outer join must read as nullable in the
        // output even when the input fields are not.
        let output_schema = match config.join_op {
            JoinOp::LeftSemi | JoinOp::LeftAnti => probe_schema,
            JoinOp::RightSemi | JoinOp::RightAnti => build_schema,
            JoinOp::Inner => join_scope_schema.clone(),
            JoinOp::LeftOuter => concat_schemas(probe_schema, nullable_schema(&build_schema)),
            JoinOp::RightOuter => concat_schemas(nullable_schema(&probe_schema), build_schema),
            JoinOp::FullOuter => concat_schemas(
                nullable_schema(&probe_schema),
                nullable_schema(&build_schema),
            ),
        };

        let profile = RuntimeProfile::new("HASH_JOIN");
        profile.add_info_string("JoinType", config.join_op.as_str());
        let partition_build_timer = profile.add_timer("PartitionBuildTime");
        let partitions_created = profile.add_counter("PartitionsCreated", TUnit::Unit);
        let max_partition_level = profile.add_counter("MaxPartitionLevel", TUnit::Unit);
        let num_build_rows_partitioned =
            profile.add_counter("NumBuildRowsPartitioned", TUnit::Unit);
        let num_probe_rows_partitioned =
            profile.add_counter("NumProbeRowsPartitioned", TUnit::Unit);
        let num_repartitions = profile.add_counter("NumRepartitions", TUnit::Unit);
        let num_spilled_partitions = profile.add_counter("NumSpilledPartitions", TUnit::Unit);
        let largest_partition_percent =
            profile.add_counter("LargestPartitionPercent", TUnit::Percent);
        let num_hash_buckets = profile.add_counter("NumHashBuckets", TUnit::Unit);

        Ok(Self {
            config,
            arena,
            ctx,
            hash_ctx,
            build_child,
            probe_child,
            cancel,
            profile,
            join_scope_schema,
            output_schema,
            state: JoinNodeState::PartitioningBuild,
            opened: false,
            closed: false,
            probe_eos: false,
            hash_partitions: Vec::new(),
            spilled_partitions: VecDeque::new(),
            input_probe_stream: None,
            output_build_partitions: VecDeque::new(),
            output_build_cursor: 0,
            partition_build_timer,
            partitions_created,
            max_partition_level,
            num_build_rows_partitioned,
            num_probe_rows_partitioned,
            num_repartitions,
            num_spilled_partitions,
            largest_partition_percent,
            num_hash_buckets,
        })
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn state(&self) -> JoinNodeState {
        self.state
    }

    pub fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    /// Highwater mark of the reservation this join has held.
    pub fn peak_reserved_bytes(&self) -> i64 {
        self.ctx.tracker.peak()
    }

    /// Consume the whole build side: partition it, then construct as many
    /// hash tables as memory allows.
    pub fn open(&mut self) -> ExecResult<()> {
        if self.opened {
            return Err(ExecError::Internal("join node opened twice".to_string()));
        }
        self.opened = true;
        self.check_cancelled()?;
        {
            let _timer = crate::runtime::profile::ScopedTimer::new(Arc::clone(
                &self.partition_build_timer,
            ));
            self.process_build_input(None, 0)?;
        }
        self.build_hash_tables()?;
        self.update_state(JoinNodeState::ProcessingProbe);
        Ok(())
    }

    /// Produce the next output batch, or None when the join is complete.
    pub fn next_batch(&mut self) -> ExecResult<Option<Chunk>> {
        self.check_cancelled()?;
        if !self.opened {
            return Err(ExecError::Internal(
                "next_batch called before open".to_string(),
            ));
        }
        if self.closed {
            return Err(ExecError::Internal(
                "next_batch called after close".to_string(),
            ));
        }
        loop {
            self.check_cancelled()?;

            if !self.output_build_partitions.is_empty() {
                if let Some(chunk) = self.emit_unmatched_build()? {
                    return Ok(Some(chunk));
                }
                continue;
            }

            if !self.probe_eos {
                match self.probe_child.get_next()? {
                    Some(chunk) => {
                        if let Some(out) = self.process_probe_chunk(&chunk)? {
                            return Ok(Some(out));
                        }
                        continue;
                    }
                    None => {
                        self.probe_eos = true;
                        self.clean_up_hash_partitions()?;
                        continue;
                    }
                }
            }

            if self.input_probe_stream.is_some() {
                let next = {
                    let stream = self.input_probe_stream.as_mut().expect("input probe stream");
                    stream.get_next().map_err(ExecError::Io)?
                };
                match next {
                    Some(chunk) => {
                        if let Some(out) = self.process_probe_chunk(&chunk)? {
                            return Ok(Some(out));
                        }
                        continue;
                    }
                    None => {
                        if let Some(mut stream) = self.input_probe_stream.take() {
                            stream.close();
                        }
                        self.clean_up_hash_partitions()?;
                        continue;
                    }
                }
            }

            if let Some(part) = self.spilled_partitions.pop_front() {
                self.prepare_next_partition(part)?;
                continue;
            }

            return Ok(None);
        }
    }

    /// Release every partition and stream. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for part in self.hash_partitions.iter_mut() {
            part.close(&self.ctx);
        }
        self.hash_partitions.clear();
        while let Some(mut part) = self.spilled_partitions.pop_front() {
            part.close(&self.ctx);
        }
        while let Some(mut part) = self.output_build_partitions.pop_front() {
            part.close(&self.ctx);
        }
        if let Some(mut stream) = self.input_probe_stream.take() {
            stream.close();
        }
        debug!(
            "hash join closed: peak_bytes={} spilled_partitions={} repartitions={}",
            self.ctx.tracker.peak(),
            self.num_spilled_partitions.value(),
            self.num_repartitions.value()
        );
    }

    fn check_cancelled(&mut self) -> ExecResult<()> {
        if self.cancel.is_cancelled() {
            self.close();
            return Err(ExecError::Cancelled);
        }
        Ok(())
    }

    fn update_state(&mut self, next: JoinNodeState) {
        debug!(
            "hash join state transition: {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
    }

    // ---- Phase 1 ----------------------------------------------------------

    /// Partition the build input (from the build child, or from a spilled
    /// partition being repartitioned) into a fresh fan-out at `level`.
    fn process_build_input(
        &mut self,
        mut repartition_source: Option<&mut JoinPartition>,
        level: usize,
    ) -> ExecResult<()> {
        let fanout = self.config.tunables.fanout;
        self.hash_ctx.rehash_for_level(level);
        self.hash_partitions = (0..fanout)
            .map(|_| JoinPartition::new(&self.ctx, level))
            .collect();
        self.partitions_created.add(fanout as i64);
        self.max_partition_level.set_max(level as i64);

        loop {
            let chunk = match repartition_source.as_mut() {
                None => self.build_child.get_next()?,
                Some(parent) => parent
                    .build_stream_mut()
                    .get_next()
                    .map_err(ExecError::Io)?,
            };
            let Some(chunk) = chunk else {
                break;
            };
            self.route_and_append_build(&chunk)?;
        }

        let total: usize = self.hash_partitions.iter().map(|p| p.build_rows()).sum();
        if total > 0 {
            let largest = self
                .hash_partitions
                .iter()
                .map(|p| p.build_rows())
                .max()
                .unwrap_or(0);
            self.largest_partition_percent
                .set_max((largest * 100 / total) as i64);
        }
        debug!(
            "build input partitioned: level={} rows={} fanout={}",
            level, total, fanout
        );
        Ok(())
    }

    fn route_and_append_build(&mut self, chunk: &Chunk) -> ExecResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let keyed = self
            .hash_ctx
            .eval_build(chunk)
            .map_err(ExecError::Expression)?;
        let tunables = &self.config.tunables;
        let split = split_chunk(
            chunk,
            &keyed.hashes,
            self.hash_ctx.level() as u32,
            tunables.num_partitioning_bits,
            tunables.fanout,
        )
        .map_err(ExecError::Internal)?;
        for (idx, entry) in split.into_iter().enumerate() {
            let Some((sub, _indices)) = entry else {
                continue;
            };
            loop {
                match self.hash_partitions[idx]
                    .append_build(sub.clone())
                    .map_err(ExecError::Io)?
                {
                    AppendStatus::Appended => break,
                    AppendStatus::NeedsSpill => self.spill_partition()?,
                }
            }
        }
        self.num_build_rows_partitioned.add(chunk.len() as i64);
        Ok(())
    }

    // ---- Spill policy -----------------------------------------------------

    /// Free memory by unpinning one victim: the partition with the largest
    /// pinned footprint that is not already spilled. Partitions that already
    /// built a hash table are only eligible when the variant does not track
    /// matched flags (dropping the table would forget them).
    fn spill_partition(&mut self) -> ExecResult<()> {
        let allow_built_victims = !self.config.join_op.needs_matched_flags();
        let mut victim: Option<(usize, usize)> = None;
        let mut victim_has_table = false;
        for (idx, part) in self.hash_partitions.iter().enumerate() {
            if part.is_spilled() || part.is_closed() {
                continue;
            }
            let has_table = part.hash_table().is_some();
            if has_table && !allow_built_victims {
                continue;
            }
            let pinned = part.pinned_bytes();
            // Prefer table-less victims; among peers take the largest footprint.
            let better = match victim {
                None => true,
                Some((_, best)) => {
                    (victim_has_table && !has_table) || (victim_has_table == has_table && pinned > best)
                }
            };
            if better {
                victim = Some((idx, pinned));
                victim_has_table = has_table;
            }
        }
        let Some((idx, pinned)) = victim else {
            return Err(ExecError::MemLimitExceeded(format!(
                "no partition left to spill ({} partitions, reservation {} bytes)",
                self.hash_partitions.len(),
                self.ctx.tracker.limit()
            )));
        };
        let part = &mut self.hash_partitions[idx];
        let was_spilled = part.ever_spilled();
        if part.hash_table().is_some() {
            part.drop_hash_table(&self.ctx);
        }
        part.spill().map_err(ExecError::Io)?;
        if !was_spilled {
            self.num_spilled_partitions.add(1);
        }
        debug!(
            "spilled partition: index={} level={} pinned_bytes={} build_rows={}",
            idx,
            part.level(),
            pinned,
            part.build_rows()
        );
        Ok(())
    }

    // ---- Phase 2 ----------------------------------------------------------

    /// Construct hash tables, smallest estimated partition first, so the
    /// largest possible number of partitions stays in memory. Partitions past
    /// the in-memory cap (or out of reservation) are left spilled with their
    /// probe streams' write-buffer headroom kept free for phase 3.
    fn build_hash_tables(&mut self) -> ExecResult<()> {
        let mut order: Vec<(usize, usize)> = self
            .hash_partitions
            .iter()
            .enumerate()
            .map(|(idx, p)| (idx, p.estimated_in_mem_size()))
            .collect();
        order.sort_by_key(|(idx, est)| (*est, *idx));

        // Spilled partitions buffer probe appends, up to a page plus one
        // in-flight chunk each. Tables must not consume that reservation.
        let probe_headroom =
            (self.config.tunables.fanout * 2 * self.config.tunables.page_size_bytes) as i64;

        let mut built = 0usize;
        for (idx, est) in order {
            let part = &mut self.hash_partitions[idx];
            let was_spilled = part.ever_spilled();
            if built >= self.config.tunables.max_in_mem_build_tables {
                if !part.is_spilled() {
                    part.spill().map_err(ExecError::Io)?;
                }
            } else {
                let fits = self
                    .ctx
                    .tracker
                    .available()
                    .saturating_sub(i64::try_from(est).unwrap_or(i64::MAX))
                    >= probe_headroom;
                if fits {
                    match part
                        .build_hash_table(&self.ctx, &self.hash_ctx)
                        .map_err(ExecError::Io)?
                    {
                        BuildTableResult::Built => {
                            built += 1;
                            let buckets = part
                                .hash_table()
                                .map(|t| t.num_buckets())
                                .unwrap_or(0);
                            self.num_hash_buckets.add(buckets as i64);
                            continue;
                        }
                        BuildTableResult::DidNotFit => {}
                    }
                } else if !part.is_spilled() {
                    part.spill().map_err(ExecError::Io)?;
                }
            }
            if part.ever_spilled() && !was_spilled {
                self.num_spilled_partitions.add(1);
            }
        }
        debug!(
            "hash tables built: in_memory={} spilled={}",
            built,
            self.hash_partitions.iter().filter(|p| p.is_spilled()).count()
        );
        Ok(())
    }

    // ---- Phase 3 ----------------------------------------------------------

    fn process_probe_chunk(&mut self, chunk: &Chunk) -> ExecResult<Option<Chunk>> {
        if chunk.is_empty() {
            return Ok(None);
        }
        let keyed = self
            .hash_ctx
            .eval_probe(chunk)
            .map_err(ExecError::Expression)?;
        let fanout = self.hash_partitions.len();
        let tunables = &self.config.tunables;
        let bits = if fanout == 1 {
            0
        } else {
            tunables.num_partitioning_bits
        };
        let split = split_chunk(chunk, &keyed.hashes, self.hash_ctx.level() as u32, bits, fanout)
            .map_err(ExecError::Internal)?;

        let mut outputs = Vec::new();
        for (idx, entry) in split.into_iter().enumerate() {
            let Some((sub, indices)) = entry else {
                continue;
            };
            if self.hash_partitions[idx].hash_table().is_some() {
                self.probe_in_memory(idx, chunk, &keyed, &indices, &mut outputs)?;
            } else {
                let rows = sub.len();
                loop {
                    match self.hash_partitions[idx]
                        .append_probe(&self.ctx, sub.clone())
                        .map_err(ExecError::Io)?
                    {
                        AppendStatus::Appended => break,
                        AppendStatus::NeedsSpill => self.spill_partition()?,
                    }
                }
                self.num_probe_rows_partitioned.add(rows as i64);
            }
        }

        if outputs.is_empty() {
            return Ok(None);
        }
        let schema = self.output_schema.clone();
        let merged = if outputs.len() == 1 {
            outputs.pop().expect("single output batch")
        } else {
            concat_batches(&schema, &outputs)
                .map_err(|e| ExecError::Internal(format!("concat join outputs failed: {e}")))?
        };
        Ok(Some(Chunk::new(merged)))
    }

    /// Probe one in-memory partition with the chunk rows routed to it and
    /// append the variant's output batches to `outputs`.
    fn probe_in_memory(
        &mut self,
        part_idx: usize,
        chunk: &Chunk,
        keyed: &KeyedRows,
        rows: &[u32],
        outputs: &mut Vec<arrow::array::RecordBatch>,
    ) -> ExecResult<()> {
        let join_op = self.config.join_op;
        let early_stop = join_op == JoinOp::LeftSemi && self.config.other_conjuncts.is_empty();

        // Pass 1: equi-key candidates.
        let mut pairs: Vec<(u32, u32)> = Vec::new();
        {
            let part = &self.hash_partitions[part_idx];
            let table = part.hash_table().expect("probed partition has hash table");
            for &row in rows {
                let row_idx = row as usize;
                if keyed.forbidden_null[row_idx] {
                    continue;
                }
                let key = keyed.row_bytes(row_idx);
                for entry in table.probe(keyed.hashes[row_idx]) {
                    if table.key_equals(entry, key) {
                        pairs.push((row, entry));
                        if early_stop {
                            break;
                        }
                    }
                }
            }
        }

        // Pass 2: residual conjuncts over the concatenated candidate rows.
        if !self.config.other_conjuncts.is_empty() && !pairs.is_empty() {
            let part = &self.hash_partitions[part_idx];
            let probe_rows: Vec<u32> = pairs.iter().map(|(row, _)| *row).collect();
            let build_refs: Vec<(usize, usize)> = pairs
                .iter()
                .map(|(_, entry)| {
                    let (chunk_idx, row_idx) = part
                        .hash_table()
                        .expect("probed partition has hash table")
                        .entry_row(*entry);
                    (chunk_idx as usize, row_idx as usize)
                })
                .collect();
            let mut columns = take_columns(chunk, &probe_rows).map_err(ExecError::Internal)?;
            columns.extend(
                gather_columns(part.build_pages(), &build_refs).map_err(ExecError::Internal)?,
            );
            let candidate = assemble(&self.join_scope_schema, columns).map_err(ExecError::Internal)?;
            let candidate = Chunk::new(candidate);
            let mut mask = vec![true; pairs.len()];
            for conjunct in &self.config.other_conjuncts {
                let conjunct_mask = self
                    .arena
                    .eval_predicate(*conjunct, &candidate)
                    .map_err(ExecError::Expression)?;
                for (keep, passed) in mask.iter_mut().zip(conjunct_mask) {
                    *keep &= passed;
                }
            }
            pairs = pairs
                .into_iter()
                .zip(mask)
                .filter_map(|(pair, keep)| keep.then_some(pair))
                .collect();
        }

        // Pass 3: per-variant emission.
        let mut probe_matched = vec![false; chunk.len()];
        for (row, _) in &pairs {
            probe_matched[*row as usize] = true;
        }

        match join_op {
            JoinOp::Inner => {
                self.emit_joined(part_idx, chunk, &pairs, outputs)?;
            }
            JoinOp::LeftOuter => {
                self.emit_joined(part_idx, chunk, &pairs, outputs)?;
                let unmatched: Vec<u32> = rows
                    .iter()
                    .copied()
                    .filter(|row| !probe_matched[*row as usize])
                    .collect();
                self.emit_probe_with_null_build(chunk, &unmatched, outputs)?;
            }
            JoinOp::RightOuter => {
                self.emit_joined(part_idx, chunk, &pairs, outputs)?;
                self.set_matched(part_idx, &pairs);
            }
            JoinOp::FullOuter => {
                self.emit_joined(part_idx, chunk, &pairs, outputs)?;
                self.set_matched(part_idx, &pairs);
                let unmatched: Vec<u32> = rows
                    .iter()
                    .copied()
                    .filter(|row| !probe_matched[*row as usize])
                    .collect();
                self.emit_probe_with_null_build(chunk, &unmatched, outputs)?;
            }
            JoinOp::LeftSemi => {
                let matched: Vec<u32> = rows
                    .iter()
                    .copied()
                    .filter(|row| probe_matched[*row as usize])
                    .collect();
                self.emit_probe_only(chunk, &matched, outputs)?;
            }
            JoinOp::LeftAnti => {
                let unmatched: Vec<u32> = rows
                    .iter()
                    .copied()
                    .filter(|row| !probe_matched[*row as usize])
                    .collect();
                self.emit_probe_only(chunk, &unmatched, outputs)?;
            }
            JoinOp::RightSemi => {
                // Emit each build row at its first surviving match.
                let mut first_matches = Vec::new();
                {
                    let part = &mut self.hash_partitions[part_idx];
                    let table = part.hash_table_mut().expect("probed partition has hash table");
                    for (_, entry) in &pairs {
                        if !table.is_matched(*entry) {
                            table.set_matched(*entry);
                            first_matches.push(*entry);
                        }
                    }
                }
                self.emit_build_only(part_idx, &first_matches, outputs)?;
            }
            JoinOp::RightAnti => {
                self.set_matched(part_idx, &pairs);
            }
        }
        Ok(())
    }

    fn set_matched(&mut self, part_idx: usize, pairs: &[(u32, u32)]) {
        let part = &mut self.hash_partitions[part_idx];
        if let Some(table) = part.hash_table_mut() {
            for (_, entry) in pairs {
                table.set_matched(*entry);
            }
        }
    }

    fn emit_joined(
        &self,
        part_idx: usize,
        chunk: &Chunk,
        pairs: &[(u32, u32)],
        outputs: &mut Vec<arrow::array::RecordBatch>,
    ) -> ExecResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let part = &self.hash_partitions[part_idx];
        let table = part.hash_table().expect("probed partition has hash table");
        let probe_rows: Vec<u32> = pairs.iter().map(|(row, _)| *row).collect();
        let build_refs: Vec<(usize, usize)> = pairs
            .iter()
            .map(|(_, entry)| {
                let (chunk_idx, row_idx) = table.entry_row(*entry);
                (chunk_idx as usize, row_idx as usize)
            })
            .collect();
        let mut columns = take_columns(chunk, &probe_rows).map_err(ExecError::Internal)?;
        columns
            .extend(gather_columns(part.build_pages(), &build_refs).map_err(ExecError::Internal)?);
        outputs.push(assemble(&self.output_schema, columns).map_err(ExecError::Internal)?);
        Ok(())
    }

    fn emit_probe_with_null_build(
        &self,
        chunk: &Chunk,
        rows: &[u32],
        outputs: &mut Vec<arrow::array::RecordBatch>,
    ) -> ExecResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut columns = take_columns(chunk, rows).map_err(ExecError::Internal)?;
        columns.extend(null_columns(&self.ctx.build_schema, rows.len()));
        outputs.push(assemble(&self.output_schema, columns).map_err(ExecError::Internal)?);
        Ok(())
    }

    fn emit_probe_only(
        &self,
        chunk: &Chunk,
        rows: &[u32],
        outputs: &mut Vec<arrow::array::RecordBatch>,
    ) -> ExecResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = take_columns(chunk, rows).map_err(ExecError::Internal)?;
        outputs.push(assemble(&self.output_schema, columns).map_err(ExecError::Internal)?);
        Ok(())
    }

    fn emit_build_only(
        &self,
        part_idx: usize,
        entries: &[u32],
        outputs: &mut Vec<arrow::array::RecordBatch>,
    ) -> ExecResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let part = &self.hash_partitions[part_idx];
        let table = part.hash_table().expect("probed partition has hash table");
        let refs: Vec<(usize, usize)> = entries
            .iter()
            .map(|entry| {
                let (chunk_idx, row_idx) = table.entry_row(*entry);
                (chunk_idx as usize, row_idx as usize)
            })
            .collect();
        let columns = gather_columns(part.build_pages(), &refs).map_err(ExecError::Internal)?;
        outputs.push(assemble(&self.output_schema, columns).map_err(ExecError::Internal)?);
        Ok(())
    }

    // ---- Probe-side cleanup ----------------------------------------------

    /// Called when the current probe input is drained. In-memory partitions
    /// either move to the unmatched-build output list or close; fully spilled
    /// partitions flush their write buffers and queue for phase 4.
    fn clean_up_hash_partitions(&mut self) -> ExecResult<()> {
        let parts = std::mem::take(&mut self.hash_partitions);
        for mut part in parts {
            if part.is_closed() {
                continue;
            }
            if part.hash_table().is_some() {
                if self.config.join_op.needs_unmatched_build_output() {
                    self.output_build_partitions.push_back(part);
                } else {
                    part.close(&self.ctx);
                }
            } else {
                part.flush_spilled_streams().map_err(ExecError::Io)?;
                self.spilled_partitions.push_back(part);
            }
        }
        Ok(())
    }

    // ---- Phase 4 ----------------------------------------------------------

    /// Emit unmatched build rows from the front output partition, up to one
    /// output batch. Returns None when the partition is exhausted (it is
    /// closed and popped).
    fn emit_unmatched_build(&mut self) -> ExecResult<Option<Chunk>> {
        let join_op = self.config.join_op;
        let batch_rows = self.config.tunables.output_batch_rows;
        let (refs, next_cursor, exhausted) = {
            let part = self
                .output_build_partitions
                .front()
                .expect("output build partition");
            let table = part.hash_table().expect("output partition has hash table");
            let mut refs: Vec<(usize, usize)> = Vec::new();
            let mut cursor = self.output_build_cursor;
            while cursor < table.entry_count() && refs.len() < batch_rows {
                let entry = cursor as u32;
                if !table.is_matched(entry) {
                    let (chunk_idx, row_idx) = table.entry_row(entry);
                    refs.push((chunk_idx as usize, row_idx as usize));
                }
                cursor += 1;
            }
            (refs, cursor, cursor >= table.entry_count())
        };
        self.output_build_cursor = next_cursor;

        if refs.is_empty() {
            // The scan only stops empty-handed at the end of the table.
            debug_assert!(exhausted);
            let mut part = self
                .output_build_partitions
                .pop_front()
                .expect("output build partition");
            part.close(&self.ctx);
            self.output_build_cursor = 0;
            return Ok(None);
        }

        let part = self
            .output_build_partitions
            .front()
            .expect("output build partition");
        let build_columns =
            gather_columns(part.build_pages(), &refs).map_err(ExecError::Internal)?;
        let batch = if join_op.emits_build_side_only() {
            assemble(&self.output_schema, build_columns).map_err(ExecError::Internal)?
        } else {
            let mut columns = null_columns(&self.ctx.probe_schema, refs.len());
            columns.extend(build_columns);
            assemble(&self.output_schema, columns).map_err(ExecError::Internal)?
        };
        Ok(Some(Chunk::new(batch)))
    }

    /// Set up the next spilled partition: build its table directly when the
    /// estimate fits the remaining reservation, otherwise repartition it one
    /// level deeper.
    fn prepare_next_partition(&mut self, mut part: JoinPartition) -> ExecResult<()> {
        let estimate = part.estimated_in_mem_size();
        let available = self.ctx.tracker.available();
        debug!(
            "preparing spilled partition: level={} build_rows={} probe_rows={} estimate={} available={}",
            part.level(),
            part.build_rows(),
            part.probe_rows(),
            estimate,
            available
        );
        if i64::try_from(estimate).unwrap_or(i64::MAX) <= available {
            self.hash_ctx.rehash_for_level(part.level());
            match part
                .build_hash_table(&self.ctx, &self.hash_ctx)
                .map_err(ExecError::Io)?
            {
                BuildTableResult::Built => {
                    self.update_state(JoinNodeState::ProbingSpilledPartition);
                    self.num_hash_buckets.add(
                        part.hash_table().map(|t| t.num_buckets()).unwrap_or(0) as i64,
                    );
                    let mut probe = part.take_probe_stream();
                    if let Some(stream) = probe.as_mut() {
                        stream.prepare_for_read().map_err(ExecError::Io)?;
                    }
                    self.input_probe_stream = probe;
                    self.hash_partitions = vec![part];
                    if self.input_probe_stream.is_none() {
                        self.clean_up_hash_partitions()?;
                    }
                    return Ok(());
                }
                BuildTableResult::DidNotFit => {}
            }
        }

        // Repartition one level deeper.
        let next_level = part.level() + 1;
        if next_level > self.config.tunables.max_partition_depth {
            let message = format!(
                "partition with {} build rows at level {} still does not fit \
                 (reservation {} bytes); raise the memory limit or use a broadcast plan",
                part.build_rows(),
                part.level(),
                self.ctx.tracker.limit()
            );
            part.close(&self.ctx);
            self.close();
            return Err(ExecError::RepartitionLimit(message));
        }
        self.update_state(JoinNodeState::Repartitioning);
        self.num_repartitions.add(1);
        let parent_rows = part.build_rows();
        part.build_stream_mut()
            .prepare_for_read()
            .map_err(ExecError::Io)?;
        {
            let _timer = crate::runtime::profile::ScopedTimer::new(Arc::clone(
                &self.partition_build_timer,
            ));
            self.process_build_input(Some(&mut part), next_level)?;
        }

        // A repartition pass that fails to split the parent cannot converge.
        let largest_child = self
            .hash_partitions
            .iter()
            .map(|p| p.build_rows())
            .max()
            .unwrap_or(0);
        if parent_rows > 0 && largest_child == parent_rows {
            part.close(&self.ctx);
            self.close();
            return Err(ExecError::RepartitionLimit(format!(
                "repartitioning level {next_level} did not reduce the dominant partition \
                 ({parent_rows} build rows share one key); raise the memory limit or use a \
                 broadcast plan"
            )));
        }

        self.build_hash_tables()?;
        let mut probe = part.take_probe_stream();
        if let Some(stream) = probe.as_mut() {
            stream.prepare_for_read().map_err(ExecError::Io)?;
        }
        self.input_probe_stream = probe;
        part.close(&self.ctx);
        if self.input_probe_stream.is_none() {
            self.clean_up_hash_partitions()?;
        }
        Ok(())
    }
}

impl Drop for PartitionedHashJoinNode {
    fn drop(&mut self) {
        self.close();
    }
}
