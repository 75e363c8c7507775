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
use std::fmt;

use arrow::array::RecordBatch;
use arrow::buffer::Buffer;
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileDecoder;
use arrow::ipc::writer::{DictionaryTracker, IpcDataGenerator, IpcWriteOptions, write_message};
use arrow::ipc::{Block, CompressionType, MetadataVersion};

const IPC_ALIGNMENT: usize = 64;
const CONTINUATION_MARKER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillCodec {
    None,
    Lz4,
    Zstd,
}

impl SpillCodec {
    pub fn as_u8(self) -> u8 {
        match self {
            SpillCodec::None => 0,
            SpillCodec::Lz4 => 1,
            SpillCodec::Zstd => 2,
        }
    }
}

impl TryFrom<u8> for SpillCodec {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SpillCodec::None),
            1 => Ok(SpillCodec::Lz4),
            2 => Ok(SpillCodec::Zstd),
            _ => Err(format!("unknown spill codec value: {value}")),
        }
    }
}

impl fmt::Display for SpillCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpillCodec::None => write!(f, "none"),
            SpillCodec::Lz4 => write!(f, "lz4"),
            SpillCodec::Zstd => write!(f, "zstd"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub bytes: Vec<u8>,
    pub num_rows: u32,
}

/// Encodes and decodes single record-batch IPC messages for spill blocks.
#[derive(Debug, Clone)]
pub struct IpcSerde {
    codec: SpillCodec,
    write_options: IpcWriteOptions,
}

impl IpcSerde {
    pub fn new(codec: SpillCodec) -> Result<Self, String> {
        let options = IpcWriteOptions::try_new(IPC_ALIGNMENT, false, MetadataVersion::V5)
            .map_err(map_arrow_err)?;
        let write_options = match codec {
            SpillCodec::None => options,
            SpillCodec::Lz4 => options
                .try_with_compression(Some(CompressionType::LZ4_FRAME))
                .map_err(map_arrow_err)?,
            SpillCodec::Zstd => options
                .try_with_compression(Some(CompressionType::ZSTD))
                .map_err(map_arrow_err)?,
        };
        Ok(Self {
            codec,
            write_options,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    pub fn encode_record_batch(&self, batch: &RecordBatch) -> Result<EncodedMessage, String> {
        if has_dictionary(batch.schema().as_ref()) {
            return Err("dictionary-encoded columns are not supported in spill blocks".to_string());
        }

        let data_gen = IpcDataGenerator::default();
        let mut dictionary_tracker = DictionaryTracker::new(false);
        let (encoded_dictionaries, encoded_message) = data_gen
            .encoded_batch(batch, &mut dictionary_tracker, &self.write_options)
            .map_err(map_arrow_err)?;
        if !encoded_dictionaries.is_empty() {
            return Err("dictionary batch messages are not supported in spill blocks".to_string());
        }

        let mut bytes = Vec::new();
        let (meta, body) =
            write_message(&mut bytes, encoded_message, &self.write_options).map_err(map_arrow_err)?;
        if bytes.len() != meta + body {
            return Err(format!(
                "ipc encoded message length mismatch: expected {} bytes, got {}",
                meta + body,
                bytes.len()
            ));
        }
        let num_rows = u32::try_from(batch.num_rows())
            .map_err(|_| "record batch row count overflows u32".to_string())?;
        Ok(EncodedMessage { bytes, num_rows })
    }

    pub fn decode_record_batch(
        &self,
        schema: SchemaRef,
        message: &[u8],
    ) -> Result<RecordBatch, String> {
        let metadata_len = ipc_metadata_len(message)?;
        if metadata_len > message.len() {
            return Err("ipc message metadata length exceeds buffer size".to_string());
        }
        let body_len = message.len() - metadata_len;
        let block = Block::new(0, metadata_len as i32, body_len as i64);
        let buffer = Buffer::from(message.to_vec());
        let decoder = FileDecoder::new(schema, MetadataVersion::V5);
        decoder
            .read_record_batch(&block, &buffer)
            .map_err(map_arrow_err)?
            .ok_or_else(|| "ipc message did not contain a record batch".to_string())
    }
}

pub fn schema_hash(schema: &Schema) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in schema.to_string().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn ipc_metadata_len(message: &[u8]) -> Result<usize, String> {
    if message.len() < 4 {
        return Err("ipc message is too small to contain a header".to_string());
    }
    let (prefix_size, meta_len) = if message.len() >= 8 && message[..4] == CONTINUATION_MARKER {
        let len = i32::from_le_bytes(message[4..8].try_into().unwrap());
        (8usize, len)
    } else {
        let len = i32::from_le_bytes(message[..4].try_into().unwrap());
        (4usize, len)
    };
    if meta_len < 0 {
        return Err("ipc message has negative metadata length".to_string());
    }
    let raw = prefix_size
        .checked_add(meta_len as usize)
        .ok_or_else(|| "ipc metadata length overflow".to_string())?;
    Ok(align_up(raw, IPC_ALIGNMENT))
}

fn align_up(value: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (value + mask) & !mask
}

fn has_dictionary(schema: &Schema) -> bool {
    schema
        .fields()
        .iter()
        .any(|field| matches!(field.data_type(), DataType::Dictionary(_, _)))
}

fn map_arrow_err(err: ArrowError) -> String {
    format!("arrow ipc error: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::Field;
    use std::sync::Arc;

    #[test]
    fn encode_decode_roundtrip() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![7, 8])),
                Arc::new(StringArray::from(vec![Some("x"), None])),
            ],
        )
        .unwrap();

        let serde = IpcSerde::new(SpillCodec::None).unwrap();
        let encoded = serde.encode_record_batch(&batch).unwrap();
        assert_eq!(encoded.num_rows, 2);
        let decoded = serde.decode_record_batch(schema, &encoded.bytes).unwrap();
        assert_eq!(decoded.num_rows(), 2);
        assert_eq!(decoded.column(0).as_ref(), batch.column(0).as_ref());
    }

    #[test]
    fn schema_hash_distinguishes_schemas() {
        let a = Schema::new(vec![Field::new("a", DataType::Int64, false)]);
        let b = Schema::new(vec![Field::new("b", DataType::Int64, false)]);
        assert_ne!(schema_hash(&a), schema_hash(&b));
    }
}
