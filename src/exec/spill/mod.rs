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
pub mod block_file;
pub mod dir_manager;
pub mod ipc_serde;

use std::path::PathBuf;
use std::sync::Arc;

use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::SpillCodec;

/// Where and how unpinned stream pages are written.
#[derive(Debug, Clone)]
pub struct SpillStorageConfig {
    pub local_dirs: Vec<PathBuf>,
    pub ipc_compression: SpillCodec,
}

impl SpillStorageConfig {
    pub fn new(local_dirs: Vec<PathBuf>) -> Self {
        Self {
            local_dirs,
            ipc_compression: SpillCodec::None,
        }
    }

    pub fn open(&self) -> Result<Arc<DirManager>, String> {
        Ok(Arc::new(DirManager::new(self.local_dirs.clone())?))
    }
}
