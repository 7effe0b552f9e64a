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
//! Parquet files on the local filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use ::parquet::arrow::ArrowWriter;
use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use ::parquet::basic::Compression;
use ::parquet::file::properties::WriterProperties;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::config::writer_compression;
use crate::common::error::{Error, Result};
use crate::connector::write_protocol::STAGING_FILE_PREFIX;
use crate::connector::{FileHandle, FileSink, StorageConnector};
use crate::novarocks_logging::{debug, warn};

pub const PARQUET_CONNECTOR: &str = "parquet";

#[derive(Clone, Debug)]
pub struct ParquetConnector {
    compression: Compression,
}

impl ParquetConnector {
    pub fn new(compression: &str) -> Result<Self> {
        Ok(Self {
            compression: map_parquet_compression(compression)?,
        })
    }

    /// Uses `writer.compression`, falling back to snappy when the name is unknown.
    pub fn from_config() -> Self {
        let name = writer_compression();
        match Self::new(&name) {
            Ok(connector) => connector,
            Err(e) => {
                warn!("parquet connector: {e}; using snappy");
                Self {
                    compression: Compression::SNAPPY,
                }
            }
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

pub fn map_parquet_compression(name: &str) -> Result<Compression> {
    match name.trim().to_ascii_lowercase().as_str() {
        "none" | "uncompressed" | "no_compression" => Ok(Compression::UNCOMPRESSED),
        "snappy" => Ok(Compression::SNAPPY),
        "lz4" | "lz4_frame" => Ok(Compression::LZ4),
        "zstd" => Ok(Compression::ZSTD(Default::default())),
        "gzip" | "zlib" | "deflate" => Ok(Compression::GZIP(Default::default())),
        "brotli" => Ok(Compression::BROTLI(Default::default())),
        other => Err(Error::Config(format!(
            "unsupported parquet compression: {other}"
        ))),
    }
}

struct ParquetFileSink {
    path: PathBuf,
    writer: ArrowWriter<fs::File>,
}

impl FileSink for ParquetFileSink {
    fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer.write(batch).map_err(|e| {
            Error::WriteFailure(format!(
                "write parquet batch {} failed: {e}",
                self.path.display()
            ))
        })
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        let ParquetFileSink { path, writer } = *self;
        writer.close().map_err(|e| {
            Error::WriteFailure(format!(
                "close parquet writer {} failed: {e}",
                path.display()
            ))
        })?;
        let meta = fs::metadata(&path).map_err(|e| {
            Error::WriteFailure(format!("stat parquet file {} failed: {e}", path.display()))
        })?;
        Ok(meta.len())
    }
}

impl StorageConnector for ParquetConnector {
    fn name(&self) -> &'static str {
        PARQUET_CONNECTOR
    }

    fn open_file(&self, path: &Path, schema: SchemaRef) -> Result<FileHandle> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::WriteFailure(format!(
                    "create parquet dir {} failed: {e}",
                    parent.display()
                ))
            })?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                Error::WriteFailure(format!(
                    "create parquet file {} failed: {e}",
                    path.display()
                ))
            })?;
        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .build();
        let writer = ArrowWriter::try_new(file, schema, Some(props)).map_err(|e| {
            Error::WriteFailure(format!(
                "create parquet writer {} failed: {e}",
                path.display()
            ))
        })?;
        debug!("parquet file OPEN: path={}", path.display());
        Ok(FileHandle::new(
            path.to_path_buf(),
            Box::new(ParquetFileSink {
                path: path.to_path_buf(),
                writer,
            }),
        ))
    }
}

/// Names starting with the staging prefix or `_` are not part of the table.
pub fn is_visible_name(name: &str) -> bool {
    !(name.starts_with(STAGING_FILE_PREFIX) || name.starts_with('_'))
}

/// Files under `dir`, recursing into partition directories, in path order.
pub fn list_files(dir: &Path, include_hidden: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    collect_files(dir, include_hidden, &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_files(dir: &Path, include_hidden: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let visible = is_visible_name(&name.to_string_lossy());
        if !include_hidden && !visible {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, include_hidden, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

pub fn read_parquet_file(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

/// Every batch of every visible file under `dir`.
pub fn read_visible_batches(dir: &Path) -> Result<Vec<RecordBatch>> {
    let mut batches = Vec::new();
    for path in list_files(dir, false)? {
        batches.extend(read_parquet_file(&path)?);
    }
    Ok(batches)
}
