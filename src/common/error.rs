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
//! Operator-level error kinds.
//!
//! Substrate modules (spill files, IPC serde, chunk helpers) report plain
//! `String` errors with formatted context; the operator layer wraps them into
//! `ExecError` so callers can tell terminal memory/repartition failures apart
//! from I/O problems and cancellation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// No partition can be spilled to free memory. Terminal for the query.
    #[error("memory limit exceeded: {0}")]
    MemLimitExceeded(String),

    /// A partition still does not fit at the maximum repartitioning depth.
    /// The engine should surface a planner-visible failure recommending a
    /// larger memory limit or a broadcast plan.
    #[error("repartition limit reached: {0}")]
    RepartitionLimit(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("expression error: {0}")]
    Expression(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ExecResult<T> = Result<T, ExecError>;

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }
}
