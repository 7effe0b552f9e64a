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
//! Storage connectors and the target description used by table writers.

pub mod parquet;
pub mod write_protocol;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::error::{Error, Result};

/// Immutable description of an insert target.
#[derive(Clone, Debug)]
pub struct InsertTableHandle {
    connector_id: String,
    location: PathBuf,
    schema: SchemaRef,
    partition_columns: Vec<String>,
}

impl InsertTableHandle {
    /// `location` is a local path or a `file:` URL. `schema` holds the target column
    /// names and types in table order.
    pub fn try_new(
        connector_id: impl Into<String>,
        location: &str,
        schema: SchemaRef,
        partition_columns: Vec<String>,
    ) -> Result<Self> {
        let location = normalize_location(location)?;
        let mut seen = HashSet::new();
        for field in schema.fields() {
            if !seen.insert(field.name().as_str()) {
                return Err(Error::InvalidPlan(format!(
                    "duplicate target column {}",
                    field.name()
                )));
            }
        }
        let mut partition_seen = HashSet::new();
        for name in &partition_columns {
            if !seen.contains(name.as_str()) {
                return Err(Error::InvalidPlan(format!(
                    "partition column {name} is not a target column"
                )));
            }
            if !partition_seen.insert(name.as_str()) {
                return Err(Error::InvalidPlan(format!(
                    "partition column {name} listed twice"
                )));
            }
        }
        Ok(Self {
            connector_id: connector_id.into(),
            location,
            schema,
            partition_columns,
        })
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn partition_columns(&self) -> &[String] {
        &self.partition_columns
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partition_columns.is_empty()
    }

    /// Target-schema positions of the partition columns.
    pub fn partition_indices(&self) -> Result<Vec<usize>> {
        self.partition_columns
            .iter()
            .map(|name| {
                self.schema
                    .index_of(name)
                    .map_err(|_| Error::InvalidPlan(format!("unknown partition column {name}")))
            })
            .collect()
    }
}

fn normalize_location(location: &str) -> Result<PathBuf> {
    if location.is_empty() {
        return Err(Error::InvalidPlan("empty table location".to_string()));
    }
    if location.starts_with("file:") {
        let url = url::Url::parse(location)
            .map_err(|e| Error::InvalidPlan(format!("invalid file url {location}: {e}")))?;
        return url
            .to_file_path()
            .map_err(|_| Error::InvalidPlan(format!("file url {location} is not a local path")));
    }
    Ok(PathBuf::from(location))
}

/// Sink side of one open output file.
pub trait FileSink: Send {
    fn write(&mut self, batch: &RecordBatch) -> Result<()>;

    /// Flush and close; returns the final byte size.
    fn finish(self: Box<Self>) -> Result<u64>;
}

pub struct FileHandle {
    path: PathBuf,
    row_count: u64,
    sink: Box<dyn FileSink>,
}

impl FileHandle {
    pub fn new(path: PathBuf, sink: Box<dyn FileSink>) -> Self {
        Self {
            path,
            row_count: 0,
            sink,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub row_count: u64,
    pub byte_size: u64,
}

pub trait StorageConnector: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_file(&self, path: &Path, schema: SchemaRef) -> Result<FileHandle>;

    fn write_rows(&self, file: &mut FileHandle, batch: &RecordBatch) -> Result<()> {
        file.sink.write(batch)?;
        file.row_count += batch.num_rows() as u64;
        Ok(())
    }

    fn close_file(&self, file: FileHandle) -> Result<WrittenFile> {
        let FileHandle {
            path,
            row_count,
            sink,
        } = file;
        let byte_size = sink.finish()?;
        Ok(WrittenFile {
            path,
            row_count,
            byte_size,
        })
    }
}

#[derive(Clone)]
pub struct ConnectorRegistry {
    storage_connectors: HashMap<&'static str, Arc<dyn StorageConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            storage_connectors: HashMap::new(),
        }
    }

    pub fn register_storage_connector(&mut self, connector: Arc<dyn StorageConnector>) {
        self.storage_connectors.insert(connector.name(), connector);
    }

    pub fn storage_connector(&self, connector_id: &str) -> Result<Arc<dyn StorageConnector>> {
        self.storage_connectors
            .get(connector_id)
            .cloned()
            .ok_or_else(|| Error::InvalidPlan(format!("unknown storage connector: {connector_id}")))
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        let mut reg = ConnectorRegistry::new();
        reg.register_storage_connector(Arc::new(parquet::ParquetConnector::from_config()));
        reg
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.storage_connectors.keys().copied().collect();
        names.sort();
        f.debug_struct("ConnectorRegistry")
            .field("storage_connectors", &names)
            .finish()
    }
}
