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

//! Common utilities and helpers for integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, Int64Array};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use tempfile::TempDir;

use novarocks_dataplane::exec::chunk::Chunk;
use novarocks_dataplane::novarocks_config;
use novarocks_dataplane::novarocks_logging;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Keeps the config file alive for the test's duration
    _temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novarocks.toml");

        let config_content = r#"
log_level = "debug"

[exchange]
high_water_mark_bytes = 33554432
max_request_bytes = 1048576
request_wait_ms = 50
io_threads = 4

[writer]
max_rows_per_file = 0
compression = "snappy"
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            _temp_dir: temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        novarocks_logging::init_with_filter("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static novarocks_config::DataplaneConfig> {
        novarocks_config::init_from_path(&self.config_path)
    }
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Build a chunk from named columns.
pub fn chunk_of(columns: Vec<(&str, ArrayRef)>) -> Chunk {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
        .collect();
    let arrays: Vec<ArrayRef> = columns.into_iter().map(|(_, array)| array).collect();
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).expect("test batch");
    Chunk::new(batch)
}

pub fn int64_chunk(name: &str, values: &[i64]) -> Chunk {
    chunk_of(vec![(name, Arc::new(Int64Array::from(values.to_vec())))])
}

pub fn int64_values(batch: &RecordBatch, column: &str) -> Vec<i64> {
    let idx = batch.schema().index_of(column).expect("column");
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column")
        .values()
        .to_vec()
}
