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
//! Tunables for the partitioned hash join and its spill substrate.

/// Partitioning and memory knobs for the hash join node.
///
/// `fanout` must be a power of two; each repartitioning level consumes a fresh
/// `num_partitioning_bits`-wide slice of the 32-bit hash, so
/// `(max_partition_depth + 1) * num_partitioning_bits` must not exceed 32.
#[derive(Debug, Clone)]
pub struct JoinTunables {
    /// Number of partitions created by one partitioning pass.
    pub fanout: usize,
    /// log2(fanout).
    pub num_partitioning_bits: u32,
    /// Maximum number of repartitioning passes before giving up.
    pub max_partition_depth: usize,
    /// Cap on simultaneously resident build hash tables. Lowering this below
    /// `fanout` forces spilling, which is how the spill paths are tested.
    pub max_in_mem_build_tables: usize,
    /// Page granularity for buffered tuple streams. An unpinned stream keeps
    /// one page of write buffer and flushes it to disk when full.
    pub page_size_bytes: usize,
    /// Target row count for output batches.
    pub output_batch_rows: usize,
}

impl Default for JoinTunables {
    fn default() -> Self {
        Self {
            fanout: 16,
            num_partitioning_bits: 4,
            max_partition_depth: 4,
            max_in_mem_build_tables: 16,
            page_size_bytes: 64 * 1024,
            output_batch_rows: 4096,
        }
    }
}

impl JoinTunables {
    pub fn validate(&self) -> Result<(), String> {
        if self.fanout < 2 || !self.fanout.is_power_of_two() {
            return Err(format!(
                "join fanout must be a power of two >= 2, got {}",
                self.fanout
            ));
        }
        if self.num_partitioning_bits != self.fanout.trailing_zeros() {
            return Err(format!(
                "num_partitioning_bits must equal log2(fanout): bits={} fanout={}",
                self.num_partitioning_bits, self.fanout
            ));
        }
        let consumed_bits = (self.max_partition_depth as u32 + 1) * self.num_partitioning_bits;
        if consumed_bits > 32 {
            return Err(format!(
                "partitioning would consume {consumed_bits} hash bits, only 32 available"
            ));
        }
        if self.max_in_mem_build_tables == 0 {
            return Err("max_in_mem_build_tables must be at least 1".to_string());
        }
        if self.page_size_bytes == 0 {
            return Err("page_size_bytes must be positive".to_string());
        }
        if self.output_batch_rows == 0 {
            return Err("output_batch_rows must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tunables_are_valid() {
        JoinTunables::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_fanout() {
        let tunables = JoinTunables {
            fanout: 12,
            num_partitioning_bits: 4,
            ..JoinTunables::default()
        };
        assert!(tunables.validate().is_err());
    }

    #[test]
    fn rejects_depth_exceeding_hash_width() {
        let tunables = JoinTunables {
            fanout: 256,
            num_partitioning_bits: 8,
            max_partition_depth: 4,
            ..JoinTunables::default()
        };
        assert!(tunables.validate().is_err());
    }
}
