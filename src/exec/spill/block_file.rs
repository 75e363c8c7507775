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
//! On-disk spill block files.
//!
//! A block file holds a fixed header, a run of IPC-encoded chunk messages, and
//! a trailing message index. `BlockWriter` appends messages incrementally so
//! an unpinned tuple stream can keep flushing pages; `seal` writes the index
//! and final header, after which `BlockReader` streams the chunks back.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::{IpcSerde, SpillCodec, schema_hash};

const BLOCK_MAGIC: [u8; 4] = *b"SPBK";
const BLOCK_VERSION: u16 = 1;
const BLOCK_HEADER_LEN: u16 = 40;
const MESSAGE_INDEX_ENTRY_LEN: usize = 24;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub codec: SpillCodec,
    pub num_messages: u32,
    pub index_offset: u64,
    pub index_length: u64,
    pub schema_hash: u64,
}

impl BlockHeader {
    fn new(codec: SpillCodec, schema_hash: u64) -> Self {
        Self {
            codec,
            num_messages: 0,
            index_offset: 0,
            index_length: 0,
            schema_hash,
        }
    }

    fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN as usize] {
        let mut buf = [0u8; BLOCK_HEADER_LEN as usize];
        buf[..4].copy_from_slice(&BLOCK_MAGIC);
        buf[4..6].copy_from_slice(&BLOCK_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&BLOCK_HEADER_LEN.to_le_bytes());
        buf[8] = self.codec.as_u8();
        buf[12..16].copy_from_slice(&self.num_messages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.index_length.to_le_bytes());
        buf[32..40].copy_from_slice(&self.schema_hash.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < BLOCK_HEADER_LEN as usize {
            return Err("spill block header is too small".to_string());
        }
        if buf[..4] != BLOCK_MAGIC {
            return Err("spill block header magic mismatch".to_string());
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != BLOCK_VERSION {
            return Err(format!("unsupported spill block version: {version}"));
        }
        let header_len = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        if header_len != BLOCK_HEADER_LEN {
            return Err(format!("unsupported spill block header length: {header_len}"));
        }
        let codec = SpillCodec::try_from(buf[8])?;
        let num_messages = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let index_offset = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let index_length = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let schema_hash = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        Ok(Self {
            codec,
            num_messages,
            index_offset,
            index_length,
            schema_hash,
        })
    }
}

#[derive(Debug, Clone)]
struct MessageIndexEntry {
    offset: u64,
    length: u64,
    num_rows: u32,
}

impl MessageIndexEntry {
    fn to_bytes(&self) -> [u8; MESSAGE_INDEX_ENTRY_LEN] {
        let mut buf = [0u8; MESSAGE_INDEX_ENTRY_LEN];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.num_rows.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < MESSAGE_INDEX_ENTRY_LEN {
            return Err("spill message index entry is too small".to_string());
        }
        Ok(Self {
            offset: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            length: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            num_rows: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// Incremental writer for one spill block file.
#[derive(Debug)]
pub struct BlockWriter {
    path: PathBuf,
    file: File,
    header: BlockHeader,
    index: Vec<MessageIndexEntry>,
    ipc: IpcSerde,
    bytes_written: u64,
}

impl BlockWriter {
    pub fn create(
        dir_manager: &Arc<DirManager>,
        codec: SpillCodec,
        schema: &SchemaRef,
    ) -> Result<Self, String> {
        let (path, mut file) = create_block_file(dir_manager)?;
        let header = BlockHeader::new(codec, schema_hash(schema.as_ref()));
        file.write_all(&header.to_bytes())
            .map_err(|e| format!("write spill block header failed: {e}"))?;
        Ok(Self {
            path,
            file,
            header,
            index: Vec::new(),
            ipc: IpcSerde::new(codec)?,
            bytes_written: BLOCK_HEADER_LEN as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_messages(&self) -> usize {
        self.index.len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn append_chunk(&mut self, chunk: &Chunk) -> Result<(), String> {
        if chunk.is_empty() {
            return Ok(());
        }
        let encoded = self.ipc.encode_record_batch(&chunk.batch)?;
        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| format!("seek spill message offset failed: {e}"))?;
        self.file
            .write_all(&encoded.bytes)
            .map_err(|e| format!("write spill message failed: {e}"))?;
        self.bytes_written = self
            .bytes_written
            .saturating_add(encoded.bytes.len() as u64);
        self.index.push(MessageIndexEntry {
            offset,
            length: encoded.bytes.len() as u64,
            num_rows: encoded.num_rows,
        });
        Ok(())
    }

    /// Write the index and final header. The file is complete afterwards.
    pub fn seal(mut self) -> Result<SpillFile, String> {
        let index_offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| format!("seek spill index offset failed: {e}"))?;
        for entry in &self.index {
            self.file
                .write_all(&entry.to_bytes())
                .map_err(|e| format!("write spill block index failed: {e}"))?;
        }
        self.header.num_messages = self.index.len() as u32;
        self.header.index_offset = index_offset;
        self.header.index_length = (self.index.len() * MESSAGE_INDEX_ENTRY_LEN) as u64;

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| format!("seek spill header failed: {e}"))?;
        self.file
            .write_all(&self.header.to_bytes())
            .map_err(|e| format!("rewrite spill block header failed: {e}"))?;
        self.file
            .flush()
            .map_err(|e| format!("flush spill file failed: {e}"))?;
        Ok(SpillFile { path: self.path })
    }
}

/// A sealed spill block file, removed from disk on drop.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
}

impl SpillFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Sequential reader over a sealed spill block file.
#[derive(Debug)]
pub struct BlockReader {
    file: File,
    schema: SchemaRef,
    index: Vec<MessageIndexEntry>,
    position: usize,
    ipc: IpcSerde,
}

impl BlockReader {
    pub fn open(path: impl AsRef<Path>, schema: SchemaRef) -> Result<Self, String> {
        let mut file = File::open(path.as_ref())
            .map_err(|e| format!("open spill file {} failed: {e}", path.as_ref().display()))?;
        let mut buf = [0u8; BLOCK_HEADER_LEN as usize];
        file.read_exact(&mut buf)
            .map_err(|e| format!("read spill block header failed: {e}"))?;
        let header = BlockHeader::from_bytes(&buf)?;
        if header.schema_hash != schema_hash(schema.as_ref()) {
            return Err("spill schema hash mismatch".to_string());
        }
        let index = read_index(&mut file, &header)?;
        let ipc = IpcSerde::new(header.codec)?;
        Ok(Self {
            file,
            schema,
            index,
            position: 0,
            ipc,
        })
    }

    pub fn num_messages(&self) -> usize {
        self.index.len()
    }

    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, String> {
        if self.position >= self.index.len() {
            return Ok(None);
        }
        let entry = self.index[self.position].clone();
        self.position += 1;
        let mut buf = vec![0u8; entry.length as usize];
        self.file
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| format!("seek spill message failed: {e}"))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| format!("read spill message failed: {e}"))?;
        let batch = self.ipc.decode_record_batch(self.schema.clone(), &buf)?;
        Ok(Some(Chunk::new(batch)))
    }
}

fn read_index(file: &mut File, header: &BlockHeader) -> Result<Vec<MessageIndexEntry>, String> {
    if header.index_length == 0 {
        return Ok(Vec::new());
    }
    if header.index_length % MESSAGE_INDEX_ENTRY_LEN as u64 != 0 {
        return Err("spill block index length is not aligned".to_string());
    }
    file.seek(SeekFrom::Start(header.index_offset))
        .map_err(|e| format!("seek to spill block index failed: {e}"))?;
    let entry_count = (header.index_length / MESSAGE_INDEX_ENTRY_LEN as u64) as usize;
    let mut entries = Vec::with_capacity(entry_count);
    let mut buf = [0u8; MESSAGE_INDEX_ENTRY_LEN];
    for _ in 0..entry_count {
        file.read_exact(&mut buf)
            .map_err(|e| format!("read spill block index entry failed: {e}"))?;
        entries.push(MessageIndexEntry::from_bytes(&buf)?);
    }
    Ok(entries)
}

fn create_block_file(dir_manager: &Arc<DirManager>) -> Result<(PathBuf, File), String> {
    let pid = std::process::id();
    let mut attempts = 0;
    loop {
        let dir = dir_manager.next_dir();
        let id = NEXT_BLOCK_ID.fetch_add(1, Ordering::AcqRel);
        let filename = format!("spill_{pid:x}_{id:x}.blk");
        let path = dir.join(filename);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path);
        match file {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                attempts += 1;
                continue;
            }
            Err(err) => {
                return Err(format!("create spill file {} failed: {err}", path.display()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Utf8, true),
        ]))
    }

    fn test_chunk(schema: &SchemaRef, ints: Vec<i32>, strs: Vec<Option<&str>>) -> Chunk {
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int32Array::from(ints)),
                Arc::new(StringArray::from(strs)),
            ],
        )
        .unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn block_roundtrip_preserves_chunks() {
        let temp = tempdir().unwrap();
        let dirs = Arc::new(DirManager::new(vec![temp.path().to_path_buf()]).unwrap());
        let schema = test_schema();

        let mut writer = BlockWriter::create(&dirs, SpillCodec::None, &schema).unwrap();
        writer
            .append_chunk(&test_chunk(&schema, vec![1, 2, 3], vec![Some("x"), None, Some("z")]))
            .unwrap();
        writer
            .append_chunk(&test_chunk(&schema, vec![4, 5], vec![Some("y"), Some("w")]))
            .unwrap();
        let spill_file = writer.seal().unwrap();

        let mut reader = BlockReader::open(spill_file.path(), schema).unwrap();
        assert_eq!(reader.num_messages(), 2);
        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 3);
        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 2);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn spill_file_is_removed_on_drop() {
        let temp = tempdir().unwrap();
        let dirs = Arc::new(DirManager::new(vec![temp.path().to_path_buf()]).unwrap());
        let schema = test_schema();
        let mut writer = BlockWriter::create(&dirs, SpillCodec::None, &schema).unwrap();
        writer
            .append_chunk(&test_chunk(&schema, vec![1], vec![Some("x")]))
            .unwrap();
        let spill_file = writer.seal().unwrap();
        let path = spill_file.path().to_path_buf();
        assert!(path.exists());
        drop(spill_file);
        assert!(!path.exists());
    }

    #[test]
    fn reader_rejects_wrong_schema() {
        let temp = tempdir().unwrap();
        let dirs = Arc::new(DirManager::new(vec![temp.path().to_path_buf()]).unwrap());
        let schema = test_schema();
        let writer = BlockWriter::create(&dirs, SpillCodec::None, &schema).unwrap();
        let spill_file = writer.seal().unwrap();

        let other = Arc::new(Schema::new(vec![Field::new("z", DataType::Int64, false)]));
        assert!(BlockReader::open(spill_file.path(), other).is_err());
    }
}
