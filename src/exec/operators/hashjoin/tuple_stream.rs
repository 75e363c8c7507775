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
//! Buffered tuple stream: an append-only chunk sequence with a pinned and an
//! unpinned state.
//!
//! Pinned: every page is memory resident and accounted against the join's
//! reservation; appends fail with `NeedsSpill` when the reservation is
//! exhausted. Unpinned: resident pages are flushed to a spill block file and
//! only a one-page write buffer stays accounted, so appends keep working
//! while the partition is spilled. `pin_for_read` loads everything back if
//! the reservation allows; `prepare_for_read`/`get_next` stream the rows in
//! either state.

use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::spill::block_file::{BlockReader, BlockWriter, SpillFile};
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::SpillCodec;
use crate::runtime::mem_tracker::MemTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AppendStatus {
    Appended,
    NeedsSpill,
}

#[derive(Debug)]
pub(crate) struct BufferedTupleStream {
    schema: SchemaRef,
    tracker: Arc<MemTracker>,
    dir_manager: Arc<DirManager>,
    codec: SpillCodec,
    page_size: usize,

    pinned: bool,
    pages: Vec<Chunk>,
    write_buffer: Vec<Chunk>,
    write_buffer_bytes: usize,
    writer: Option<BlockWriter>,
    sealed: Option<SpillFile>,
    reader: Option<BlockReader>,
    read_pos: usize,
    reading: bool,

    num_rows: usize,
    /// Estimated in-memory bytes of chunks currently on disk.
    flushed_bytes: usize,
    closed: bool,
}

impl BufferedTupleStream {
    pub(crate) fn new(
        schema: SchemaRef,
        tracker: Arc<MemTracker>,
        dir_manager: Arc<DirManager>,
        codec: SpillCodec,
        page_size: usize,
    ) -> Self {
        Self {
            schema,
            tracker,
            dir_manager,
            codec,
            page_size,
            pinned: true,
            pages: Vec::new(),
            write_buffer: Vec::new(),
            write_buffer_bytes: 0,
            writer: None,
            sealed: None,
            reader: None,
            read_pos: 0,
            reading: false,
            num_rows: 0,
            flushed_bytes: 0,
            closed: false,
        }
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub(crate) fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Reservation currently held by this stream.
    pub(crate) fn pinned_bytes(&self) -> usize {
        let resident: usize = self.pages.iter().map(|c| c.estimated_bytes()).sum();
        resident + self.write_buffer_bytes
    }

    /// Estimated bytes needed to hold every row of this stream in memory.
    pub(crate) fn total_bytes(&self) -> usize {
        self.pinned_bytes() + self.flushed_bytes
    }

    /// Resident pages. Only meaningful while the stream is pinned.
    pub(crate) fn pages(&self) -> &[Chunk] {
        &self.pages
    }

    pub(crate) fn add_chunk(&mut self, mut chunk: Chunk) -> Result<AppendStatus, String> {
        if self.closed {
            return Err("append to closed tuple stream".to_string());
        }
        if self.reading {
            return Err("append to tuple stream already prepared for read".to_string());
        }
        if chunk.is_empty() {
            return Ok(AppendStatus::Appended);
        }
        let bytes = chunk.estimated_bytes();
        if (self.tracker.available() as u128) < bytes as u128 {
            return Ok(AppendStatus::NeedsSpill);
        }
        chunk.transfer_to(&self.tracker);
        self.num_rows += chunk.len();
        if self.pinned {
            self.pages.push(chunk);
        } else {
            self.write_buffer_bytes += bytes;
            self.write_buffer.push(chunk);
            if self.write_buffer_bytes >= self.page_size {
                self.flush_write_buffer()?;
            }
        }
        Ok(AppendStatus::Appended)
    }

    /// Move resident pages to disk, keeping only the write buffer reservation.
    pub(crate) fn unpin(&mut self) -> Result<(), String> {
        if self.closed {
            return Err("unpin of closed tuple stream".to_string());
        }
        if !self.pinned {
            return Ok(());
        }
        self.pinned = false;
        self.ensure_writer()?;
        let writer = self.writer.as_mut().expect("spill block writer");
        for chunk in &self.pages {
            writer.append_chunk(chunk)?;
        }
        for chunk in self.pages.drain(..) {
            self.flushed_bytes += chunk.estimated_bytes();
            drop(chunk);
        }
        Ok(())
    }

    /// Bring every page back into memory. Returns false (and stays unpinned)
    /// if the reservation cannot cover the resident size.
    pub(crate) fn pin_for_read(&mut self) -> Result<bool, String> {
        if self.closed {
            return Err("pin of closed tuple stream".to_string());
        }
        if self.pinned {
            return Ok(true);
        }
        self.seal_writer()?;
        let Some(sealed) = self.sealed.as_ref() else {
            // Nothing was flushed; only the write buffer exists.
            self.pages.append(&mut self.write_buffer);
            self.write_buffer_bytes = 0;
            self.pinned = true;
            return Ok(true);
        };

        let mut reader = BlockReader::open(sealed.path(), self.schema.clone())?;
        let mut loaded: Vec<Chunk> = Vec::with_capacity(reader.num_messages());
        while let Some(mut chunk) = reader.next_chunk()? {
            let bytes = chunk.estimated_bytes();
            if (self.tracker.available() as u128) < bytes as u128 {
                // Not enough reservation; drop what we loaded and stay spilled.
                drop(loaded);
                return Ok(false);
            }
            chunk.transfer_to(&self.tracker);
            loaded.push(chunk);
        }

        self.flushed_bytes = 0;
        self.pages = loaded;
        self.pages.append(&mut self.write_buffer);
        self.write_buffer_bytes = 0;
        self.sealed = None;
        self.reader = None;
        self.pinned = true;
        Ok(true)
    }

    /// Flush any buffered writes of an unpinned stream to disk, releasing the
    /// write-buffer reservation. No-op for pinned streams.
    pub(crate) fn flush(&mut self) -> Result<(), String> {
        if self.closed {
            return Err("flush of closed tuple stream".to_string());
        }
        if self.pinned || self.reading {
            return Ok(());
        }
        self.flush_write_buffer()
    }

    /// Switch to sequential read mode. Appends are rejected afterwards.
    pub(crate) fn prepare_for_read(&mut self) -> Result<(), String> {
        if self.closed {
            return Err("read of closed tuple stream".to_string());
        }
        if self.reading {
            return Err("tuple stream already prepared for read".to_string());
        }
        self.reading = true;
        self.read_pos = 0;
        if !self.pinned {
            self.seal_writer()?;
            if let Some(sealed) = self.sealed.as_ref() {
                self.reader = Some(BlockReader::open(sealed.path(), self.schema.clone())?);
            }
        }
        Ok(())
    }

    /// Next chunk in append order, or None at end of stream.
    pub(crate) fn get_next(&mut self) -> Result<Option<Chunk>, String> {
        if !self.reading {
            return Err("tuple stream is not prepared for read".to_string());
        }
        if self.pinned {
            if self.read_pos < self.pages.len() {
                let chunk = self.pages[self.read_pos].clone();
                self.read_pos += 1;
                return Ok(Some(chunk));
            }
            return Ok(None);
        }
        if let Some(reader) = self.reader.as_mut() {
            if let Some(chunk) = reader.next_chunk()? {
                return Ok(Some(chunk));
            }
            self.reader = None;
        }
        // Disk pages are exhausted; drain the write buffer tail.
        if self.read_pos < self.write_buffer.len() {
            let chunk = self.write_buffer[self.read_pos].clone();
            self.read_pos += 1;
            return Ok(Some(chunk));
        }
        Ok(None)
    }

    /// Release all memory and disk resources. Idempotent.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pages.clear();
        self.write_buffer.clear();
        self.write_buffer_bytes = 0;
        self.reader = None;
        self.sealed = None;
        if let Some(writer) = self.writer.take() {
            let path = writer.path().to_path_buf();
            drop(writer);
            let _ = std::fs::remove_file(path);
        }
    }

    fn ensure_writer(&mut self) -> Result<&mut BlockWriter, String> {
        if self.writer.is_none() {
            if self.sealed.is_some() {
                return Err("tuple stream spill file already sealed".to_string());
            }
            self.writer = Some(BlockWriter::create(
                &self.dir_manager,
                self.codec,
                &self.schema,
            )?);
        }
        Ok(self.writer.as_mut().expect("spill block writer"))
    }

    fn flush_write_buffer(&mut self) -> Result<(), String> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let batches: Vec<_> = self.write_buffer.iter().map(|c| c.batch.clone()).collect();
        let page = concat_batches(&self.schema, &batches)
            .map_err(|e| format!("concat spill page failed: {e}"))?;
        let page = Chunk::new(page);
        let writer = self.ensure_writer()?;
        writer.append_chunk(&page)?;
        self.flushed_bytes += self.write_buffer_bytes;
        self.write_buffer.clear();
        self.write_buffer_bytes = 0;
        Ok(())
    }

    fn seal_writer(&mut self) -> Result<(), String> {
        if let Some(writer) = self.writer.take() {
            self.sealed = Some(writer.seal()?);
        }
        Ok(())
    }
}

impl Drop for BufferedTupleStream {
    fn drop(&mut self) {
        self.close();
    }
}
