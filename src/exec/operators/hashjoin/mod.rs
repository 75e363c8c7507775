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
//! Partitioned spill-to-disk hash join.
//!
//! Responsibilities:
//! - Partitions build and probe inputs by hash, spilling partitions to disk
//!   under memory pressure and repartitioning oversized partitions.
//! - Implements all eight equi-join variants with residual conjuncts.
//!
//! Key exported interfaces:
//! - Types: `PartitionedHashJoinNode`, `PartitionedHashJoinConfig`, `JoinOp`,
//!   `EquiJoinPredicate`, `CancelToken`.
//! - Traits: `ChunkSource`.

mod hash_context;
mod join_hash_table;
mod partition;
mod partitioned_join_node;
mod probe_output;
mod tuple_stream;

pub use partitioned_join_node::{
    CancelToken, ChunkSource, EquiJoinPredicate, JoinNodeState, JoinOp, PartitionedHashJoinConfig,
    PartitionedHashJoinNode,
};
pub use probe_output::concat_schemas;
