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
//! Table writer operator.
//!
//! Responsibilities:
//! - Projects input chunks onto the target schema, casts to target types and groups rows
//!   by partition values.
//! - Writes each group through the target's storage connector, rolling files after
//!   `writer.max_rows_per_file` rows.
//! - Commits the produced files through the write protocol registered for the plan's
//!   commit strategy and emits a single-row summary chunk.
//!
//! State machine: `Idle -> Accumulating -> Finalizing -> Done`; `Failed` is absorbing and
//! skips commit, leaving any staged files in place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, UInt32Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::common::config::writer_max_rows_per_file;
use crate::common::error::{Error, Result};
use crate::common::types::UniqueId;
use crate::connector::write_protocol::{
    CommitStrategy, CommittedFile, WriteFile, WriteFileSet, WriteProtocol, WriteProtocolRegistry,
    write_protocol_registry,
};
use crate::connector::{ConnectorRegistry, FileHandle, InsertTableHandle, StorageConnector};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::novarocks_logging::{debug, info, warn};
use crate::runtime::sink_commit;

/// Plan node for a table write.
#[derive(Clone, Debug)]
pub struct TableWriteNode {
    /// Input column feeding each target column, in target order.
    pub input_columns: Vec<String>,
    pub insert_handle: InsertTableHandle,
    pub commit_strategy: CommitStrategy,
    /// Name of the single `Int64` column of the summary chunk.
    pub output_column: String,
}

/// Execution-side collaborators of a table writer.
#[derive(Clone, Debug)]
pub struct TableWriterContext {
    pub protocols: Arc<WriteProtocolRegistry>,
    pub connectors: ConnectorRegistry,
    pub query_id: UniqueId,
    /// Names this writer's files; a fresh random id when unset.
    pub instance_id: Option<UniqueId>,
    pub writer_id: u32,
    /// When set, committed files and load counters are published to the sink commit store.
    pub task_id: Option<UniqueId>,
    /// Zero means unlimited.
    pub max_rows_per_file: usize,
}

impl Default for TableWriterContext {
    fn default() -> Self {
        Self {
            protocols: write_protocol_registry(),
            connectors: ConnectorRegistry::default(),
            query_id: UniqueId::default(),
            instance_id: None,
            writer_id: 0,
            task_id: None,
            max_rows_per_file: writer_max_rows_per_file(),
        }
    }
}

impl TableWriterContext {
    pub fn with_protocols(mut self, protocols: Arc<WriteProtocolRegistry>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_query_id(mut self, query_id: UniqueId) -> Self {
        self.query_id = query_id;
        self
    }

    pub fn with_instance_id(mut self, instance_id: UniqueId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_writer_id(mut self, writer_id: u32) -> Self {
        self.writer_id = writer_id;
        self
    }

    pub fn with_task_id(mut self, task_id: UniqueId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_max_rows_per_file(mut self, max_rows_per_file: usize) -> Self {
        self.max_rows_per_file = max_rows_per_file;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableWriterState {
    Idle,
    Accumulating,
    Finalizing,
    Done,
    Failed,
}

struct OpenFile {
    handle: FileHandle,
    target_path: PathBuf,
    partition_path: String,
}

pub struct TableWriterOperator {
    name: String,
    node: TableWriteNode,
    ctx: TableWriterContext,
    connector: Arc<dyn StorageConnector>,
    partition_indices: Vec<usize>,
    instance_id: UniqueId,
    protocol: Option<Arc<dyn WriteProtocol>>,
    open_files: HashMap<String, OpenFile>,
    written: WriteFileSet,
    committed: Vec<CommittedFile>,
    file_seq: u64,
    rows_written: u64,
    state: TableWriterState,
    output: Option<Chunk>,
}

impl TableWriterOperator {
    pub fn try_new(node: TableWriteNode, ctx: TableWriterContext) -> Result<Self> {
        let width = node.insert_handle.schema().fields().len();
        if node.input_columns.len() != width {
            return Err(Error::InvalidPlan(format!(
                "table writer maps {} input columns onto {} target columns",
                node.input_columns.len(),
                width
            )));
        }
        if node.output_column.is_empty() {
            return Err(Error::InvalidPlan(
                "table writer output column name is empty".to_string(),
            ));
        }
        let connector = ctx
            .connectors
            .storage_connector(node.insert_handle.connector_id())?;
        let partition_indices = node.insert_handle.partition_indices()?;
        let name = format!("TABLE_WRITER (id={})", ctx.writer_id);
        let instance_id = ctx.instance_id.unwrap_or_else(UniqueId::random);
        Ok(Self {
            name,
            node,
            ctx,
            connector,
            partition_indices,
            instance_id,
            protocol: None,
            open_files: HashMap::new(),
            written: WriteFileSet::new(),
            committed: Vec::new(),
            file_seq: 0,
            rows_written: 0,
            state: TableWriterState::Idle,
            output: None,
        })
    }

    pub fn state(&self) -> TableWriterState {
        self.state
    }

    pub fn instance_id(&self) -> UniqueId {
        self.instance_id
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn committed_files(&self) -> &[CommittedFile] {
        &self.committed
    }

    fn schema(&self) -> &SchemaRef {
        self.node.insert_handle.schema()
    }

    fn resolve_protocol(&mut self) -> Result<Arc<dyn WriteProtocol>> {
        if let Some(protocol) = self.protocol.as_ref() {
            return Ok(Arc::clone(protocol));
        }
        let protocol = self.ctx.protocols.protocol_for(self.node.commit_strategy)?;
        debug!(
            "table writer resolved protocol: writer_id={} strategy={}",
            self.ctx.writer_id, self.node.commit_strategy
        );
        self.protocol = Some(Arc::clone(&protocol));
        Ok(protocol)
    }

    fn fail(&mut self, err: &Error) {
        if self.state == TableWriterState::Failed {
            return;
        }
        warn!(
            "table writer FAILED: writer_id={} location={} open_files={} staged_files={} error={}",
            self.ctx.writer_id,
            self.node.insert_handle.location().display(),
            self.open_files.len(),
            self.written.len(),
            err
        );
        self.state = TableWriterState::Failed;
        // Unclosed handles are abandoned where they were written.
        self.open_files.clear();
        self.output = None;
    }

    fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        let mut arrays = Vec::with_capacity(self.node.input_columns.len());
        for name in &self.node.input_columns {
            arrays.push(chunk.column_by_name(name)?);
        }
        let arrays = align_arrays_to_schema(arrays, self.schema())?;
        let batch = RecordBatch::try_new(Arc::clone(self.schema()), arrays)?;

        if self.partition_indices.is_empty() {
            return self.write_group("", &batch);
        }
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<u32>> = HashMap::new();
        for row in 0..batch.num_rows() {
            let key = partition_path_for_row(self.schema(), &batch, &self.partition_indices, row)?;
            let rows = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            rows.push(row as u32);
        }
        for key in order {
            let Some(rows) = groups.remove(&key) else {
                continue;
            };
            let indices = UInt32Array::from(rows);
            let part = arrow::compute::take_record_batch(&batch, &indices)?;
            self.write_group(&key, &part)?;
        }
        Ok(())
    }

    fn write_group(&mut self, partition: &str, batch: &RecordBatch) -> Result<()> {
        let connector = Arc::clone(&self.connector);
        let max_rows = self.ctx.max_rows_per_file;
        let mut offset = 0;
        while offset < batch.num_rows() {
            if !self.open_files.contains_key(partition) {
                let file = self.open_new_file(partition)?;
                self.open_files.insert(partition.to_string(), file);
            }
            let Some(file) = self.open_files.get_mut(partition) else {
                return Err(Error::WriteFailure(format!(
                    "no open file for partition {partition:?}"
                )));
            };
            let remaining = batch.num_rows() - offset;
            let take = if max_rows == 0 {
                remaining
            } else {
                let written = file.handle.row_count() as usize;
                remaining.min(max_rows.saturating_sub(written).max(1))
            };
            connector.write_rows(&mut file.handle, &batch.slice(offset, take))?;
            offset += take;
            self.rows_written += take as u64;
            if max_rows > 0 && file.handle.row_count() as usize >= max_rows {
                self.close_open_file(partition)?;
            }
        }
        Ok(())
    }

    fn open_new_file(&mut self, partition: &str) -> Result<OpenFile> {
        let protocol = self.resolve_protocol()?;
        let dir = if partition.is_empty() {
            self.node.insert_handle.location().to_path_buf()
        } else {
            self.node.insert_handle.location().join(partition)
        };
        let file_name = format!(
            "data-{}-w{}-{}.parquet",
            self.instance_id.to_file_token(),
            self.ctx.writer_id,
            self.file_seq
        );
        self.file_seq = self.file_seq.saturating_add(1);
        let target_path = dir.join(file_name);
        let write_path = protocol.write_path(&target_path);
        let handle = self
            .connector
            .open_file(&write_path, Arc::clone(self.schema()))?;
        Ok(OpenFile {
            handle,
            target_path,
            partition_path: partition.trim_end_matches('/').to_string(),
        })
    }

    fn close_open_file(&mut self, partition: &str) -> Result<()> {
        let Some(file) = self.open_files.remove(partition) else {
            return Ok(());
        };
        let written = self.connector.close_file(file.handle)?;
        debug!(
            "table writer file CLOSED: path={} rows={} bytes={}",
            written.path.display(),
            written.row_count,
            written.byte_size
        );
        self.written.push(WriteFile {
            write_path: written.path,
            target_path: file.target_path,
            partition_path: file.partition_path,
            row_count: written.row_count,
            byte_size: written.byte_size,
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let mut partitions: Vec<String> = self.open_files.keys().cloned().collect();
        partitions.sort();
        for partition in partitions {
            self.close_open_file(&partition)?;
        }
        let protocol = self.resolve_protocol()?;
        let files = std::mem::take(&mut self.written);
        let file_count = files.len();
        let committed = protocol.commit(files)?;

        let rows: u64 = committed.iter().map(|f| f.row_count).sum();
        let bytes: u64 = committed.iter().map(|f| f.byte_size).sum();
        if let Some(task_id) = self.ctx.task_id {
            sink_commit::add_committed_files(task_id, &committed);
            sink_commit::add_load_counters(
                task_id,
                i64::try_from(rows).unwrap_or(i64::MAX),
                i64::try_from(bytes).unwrap_or(i64::MAX),
            );
        }
        info!(
            "table writer DONE: query_id={} instance_id={} writer_id={} strategy={} files={} rows={} bytes={}",
            self.ctx.query_id,
            self.instance_id,
            self.ctx.writer_id,
            self.node.commit_strategy,
            file_count,
            rows,
            bytes
        );
        self.committed = committed;
        self.output = Some(summary_chunk(&self.node.output_column, rows)?);
        Ok(())
    }
}

impl Operator for TableWriterOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn cancel(&mut self) {
        if matches!(
            self.state,
            TableWriterState::Done | TableWriterState::Failed
        ) {
            return;
        }
        self.fail(&Error::Cancelled);
    }

    fn is_finished(&self) -> bool {
        match self.state {
            TableWriterState::Done => self.output.is_none(),
            TableWriterState::Failed => true,
            _ => false,
        }
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for TableWriterOperator {
    fn need_input(&self) -> bool {
        matches!(
            self.state,
            TableWriterState::Idle | TableWriterState::Accumulating
        )
    }

    fn has_output(&self) -> bool {
        self.output.is_some()
    }

    fn push_chunk(&mut self, chunk: Chunk) -> Result<()> {
        match self.state {
            TableWriterState::Idle | TableWriterState::Accumulating => {}
            TableWriterState::Failed => {
                return Err(Error::WriteFailure(format!(
                    "{} already failed",
                    self.name
                )));
            }
            TableWriterState::Finalizing | TableWriterState::Done => {
                return Err(Error::InvalidPlan(format!(
                    "{} received input after finishing",
                    self.name
                )));
            }
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.state = TableWriterState::Accumulating;
        if let Err(err) = self.write_chunk(&chunk) {
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    fn pull_chunk(&mut self) -> Result<Option<Chunk>> {
        Ok(self.output.take())
    }

    fn set_finishing(&mut self) -> Result<()> {
        match self.state {
            TableWriterState::Idle | TableWriterState::Accumulating => {}
            TableWriterState::Failed => {
                return Err(Error::WriteFailure(format!(
                    "{} failed before commit",
                    self.name
                )));
            }
            TableWriterState::Finalizing | TableWriterState::Done => return Ok(()),
        }
        self.state = TableWriterState::Finalizing;
        if let Err(err) = self.finalize() {
            self.fail(&err);
            return Err(err);
        }
        self.state = TableWriterState::Done;
        Ok(())
    }
}

fn summary_chunk(column: &str, rows: u64) -> Result<Chunk> {
    let schema = Arc::new(Schema::new(vec![Field::new(column, DataType::Int64, false)]));
    let rows = i64::try_from(rows).unwrap_or(i64::MAX);
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![rows]))])?;
    Ok(Chunk::new(batch))
}

fn align_arrays_to_schema(arrays: Vec<ArrayRef>, schema: &SchemaRef) -> Result<Vec<ArrayRef>> {
    if arrays.len() != schema.fields().len() {
        return Err(Error::InvalidPlan(format!(
            "table writer column count mismatch while aligning arrays: arrays={} schema={}",
            arrays.len(),
            schema.fields().len()
        )));
    }

    arrays
        .into_iter()
        .zip(schema.fields().iter())
        .enumerate()
        .map(|(idx, (array, field))| {
            let target_type = field.data_type();
            if array.data_type() == target_type {
                return Ok(array);
            }

            let casted = cast(array.as_ref(), target_type).map_err(|e| {
                Error::WriteFailure(format!(
                    "cast failed at column index {} name={} from {:?} to {:?}: {}",
                    idx,
                    field.name(),
                    array.data_type(),
                    target_type,
                    e
                ))
            })?;

            if casted.null_count() > array.null_count() {
                return Err(Error::WriteFailure(format!(
                    "cast introduced nulls at column index {} name={} from {:?} to {:?}",
                    idx,
                    field.name(),
                    array.data_type(),
                    target_type
                )));
            }
            Ok(casted)
        })
        .collect()
}

/// Directory value of a null partition column.
pub const NULL_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

/// `col=value/` segments for one row, values url-encoded, nulls as [`NULL_PARTITION_VALUE`].
fn partition_path_for_row(
    schema: &SchemaRef,
    batch: &RecordBatch,
    partition_indices: &[usize],
    row: usize,
) -> Result<String> {
    let mut path = String::new();
    for &idx in partition_indices {
        let array = batch.column(idx);
        let value = if array.is_null(row) {
            NULL_PARTITION_VALUE.to_string()
        } else {
            let rendered = arrow::util::display::array_value_to_string(array, row)?;
            url_encode(&rendered)
        };
        path.push_str(schema.field(idx).name());
        path.push('=');
        path.push_str(&value);
        path.push('/');
    }
    Ok(path)
}

fn url_encode(input: &str) -> String {
    url::form_urlencoded::byte_serialize(input.as_bytes()).collect()
}
