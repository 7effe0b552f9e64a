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
use std::io::Cursor;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use bytes::Bytes;

use crate::common::error::{Error, Result};
use crate::exec::chunk::Chunk;

/// One immutable serialized batch of rows moving through the exchange.
///
/// `sequence` is the position of the page within its producer/destination stream.
#[derive(Clone, Debug)]
pub struct Page {
    sequence: i64,
    num_rows: usize,
    payload: Bytes,
}

impl Page {
    pub fn new(sequence: i64, num_rows: usize, payload: Bytes) -> Self {
        Self {
            sequence,
            num_rows,
            payload,
        }
    }

    /// Serialize chunks sharing one schema into a page (Arrow IPC stream).
    pub fn encode(sequence: i64, chunks: &[Chunk]) -> Result<Self> {
        let num_rows = chunks.iter().map(Chunk::len).sum();
        let payload = encode_chunks(chunks)?;
        Ok(Self::new(sequence, num_rows, Bytes::from(payload)))
    }

    pub fn decode(&self) -> Result<Vec<Chunk>> {
        decode_chunks(&self.payload)
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn byte_len(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

fn encode_chunks(chunks: &[Chunk]) -> Result<Vec<u8>> {
    let Some(first) = chunks.first() else {
        return Ok(vec![]);
    };
    let schema: SchemaRef = first.schema();
    for (i, c) in chunks.iter().enumerate().skip(1) {
        if c.schema().as_ref() != schema.as_ref() {
            return Err(Error::InvalidPlan(format!(
                "page encode schema mismatch at chunk index {}: expected={:?} actual={:?}",
                i,
                schema,
                c.schema()
            )));
        }
    }

    let mut buffer = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buffer, &schema)?;
    for chunk in chunks {
        writer.write(&chunk.batch)?;
    }
    writer.finish()?;
    drop(writer);
    Ok(buffer)
}

fn decode_chunks(bytes: &[u8]) -> Result<Vec<Chunk>> {
    if bytes.is_empty() {
        return Ok(vec![]);
    }
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let mut chunks = Vec::new();
    for batch in reader {
        chunks.push(Chunk::new(batch?));
    }
    Ok(chunks)
}
