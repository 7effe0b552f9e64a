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
//! Integration tests for the table writer and commit protocols.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::common::{TestConfig, chunk_of, int64_chunk, int64_values, run_with_timeout};
use novarocks_dataplane::common::error::{Error, Result};
use novarocks_dataplane::common::types::UniqueId;
use novarocks_dataplane::connector::parquet::{
    ParquetConnector, list_files, read_parquet_file, read_visible_batches,
};
use novarocks_dataplane::connector::write_protocol::{
    CommitStrategy, NoCommitWriteProtocol, TaskCommitWriteProtocol, WriteProtocolRegistry,
    write_protocol_registry,
};
use novarocks_dataplane::connector::{
    ConnectorRegistry, FileHandle, InsertTableHandle, StorageConnector,
};
use novarocks_dataplane::exec::chunk::Chunk;
use novarocks_dataplane::exec::operators::{
    TableWriteNode, TableWriterContext, TableWriterOperator, TableWriterState,
};
use novarocks_dataplane::exec::pipeline::driver::{ChunkSource, PipelineDriver};
use novarocks_dataplane::exec::pipeline::operator::ProcessorOperator;
use novarocks_dataplane::runtime::exchange::local;
use novarocks_dataplane::runtime::exchange::{ExchangeClient, ExchangeSourceRegistry, PageBuffer};
use novarocks_dataplane::runtime::exchange_scan::ExchangeScan;
use novarocks_dataplane::runtime::sink_commit;

mod common;

fn schema(fields: &[(&str, DataType)]) -> SchemaRef {
    Arc::new(Schema::new(
        fields
            .iter()
            .map(|(name, ty)| Field::new(*name, ty.clone(), true))
            .collect::<Vec<_>>(),
    ))
}

fn protocols(strategies: &[CommitStrategy]) -> Arc<WriteProtocolRegistry> {
    let registry = Arc::new(WriteProtocolRegistry::new());
    for strategy in strategies {
        match strategy {
            CommitStrategy::NoCommit => {
                registry.register_protocol(*strategy, Arc::new(NoCommitWriteProtocol));
            }
            CommitStrategy::TaskCommit => {
                registry.register_protocol(*strategy, Arc::new(TaskCommitWriteProtocol));
            }
            other => panic!("no built-in protocol for {other}"),
        }
    }
    registry
}

fn write_node(
    dir: &Path,
    target: SchemaRef,
    input_columns: &[&str],
    partitions: &[&str],
    strategy: CommitStrategy,
) -> TableWriteNode {
    let handle = InsertTableHandle::try_new(
        "parquet",
        &dir.to_string_lossy(),
        target,
        partitions.iter().map(|p| p.to_string()).collect(),
    )
    .expect("insert handle");
    TableWriteNode {
        input_columns: input_columns.iter().map(|c| c.to_string()).collect(),
        insert_handle: handle,
        commit_strategy: strategy,
        output_column: "rows".to_string(),
    }
}

fn context(registry: Arc<WriteProtocolRegistry>) -> TableWriterContext {
    TableWriterContext::default()
        .with_protocols(registry)
        .with_query_id(UniqueId::new(7, 11))
        .with_max_rows_per_file(0)
}

fn source(chunks: Vec<Chunk>) -> ChunkSource {
    Box::new(chunks.into_iter().map(Ok))
}

fn run_writer(node: TableWriteNode, ctx: TableWriterContext, chunks: Vec<Chunk>) -> Result<i64> {
    let writer = TableWriterOperator::try_new(node, ctx)?;
    let mut driver = PipelineDriver::new(0, source(chunks), vec![Box::new(writer)]);
    let out = driver.run()?;
    assert_eq!(out.len(), 1, "one summary chunk");
    Ok(int64_values(&out[0].batch, "rows")[0])
}

fn string_values(batch: &RecordBatch, column: &str) -> Vec<String> {
    let idx = batch.schema().index_of(column).expect("column");
    let array = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("utf8 column");
    (0..array.len()).map(|i| array.value(i).to_string()).collect()
}

fn visible_values(dir: &Path, column: &str) -> Vec<i64> {
    let mut values: Vec<i64> = read_visible_batches(dir)
        .expect("read")
        .iter()
        .flat_map(|b| int64_values(b, column))
        .collect();
    values.sort();
    values
}

fn file_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect()
}

#[test]
fn test_empty_input_writes_no_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[("x", DataType::Int64)]);
    let node = write_node(dir.path(), target, &["a"], &[], CommitStrategy::TaskCommit);

    let rows = run_writer(node, context(protocols(&[CommitStrategy::TaskCommit])), vec![])
        .expect("write");
    assert_eq!(rows, 0);
    assert!(list_files(dir.path(), true).expect("list").is_empty());
}

#[test]
fn test_unregistered_strategy_then_registered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[("x", DataType::Int64)]);
    let registry = protocols(&[CommitStrategy::NoCommit]);
    let chunks = vec![int64_chunk("a", &[1, 2, 3])];

    let node = write_node(dir.path(), Arc::clone(&target), &["a"], &[], CommitStrategy::TaskCommit);
    let err = run_writer(node.clone(), context(Arc::clone(&registry)), chunks.clone())
        .expect_err("unregistered strategy");
    assert!(matches!(err, Error::UnregisteredCommitStrategy(CommitStrategy::TaskCommit)));
    assert_eq!(
        err.to_string(),
        "No write protocol found for commit strategy TASK_COMMIT"
    );
    assert!(list_files(dir.path(), true).expect("list").is_empty());

    registry.register_protocol(CommitStrategy::TaskCommit, Arc::new(TaskCommitWriteProtocol));
    let rows = run_writer(node, context(registry), chunks).expect("write");
    assert_eq!(rows, 3);
    assert_eq!(list_files(dir.path(), false).expect("list").len(), 1);
}

#[test]
fn test_process_wide_registry_after_registration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[("x", DataType::Int64)]);
    TaskCommitWriteProtocol::register_protocol();
    assert!(
        write_protocol_registry()
            .protocol_for(CommitStrategy::TaskCommit)
            .is_ok()
    );

    let node = write_node(dir.path(), target, &["a"], &[], CommitStrategy::TaskCommit);
    let ctx = TableWriterContext::default().with_max_rows_per_file(0);
    let rows = run_writer(node, ctx, vec![int64_chunk("a", &[4, 5])]).expect("write");
    assert_eq!(rows, 2);
}

#[test]
fn test_repeated_writes_keep_earlier_output() {
    for strategy in [CommitStrategy::NoCommit, CommitStrategy::TaskCommit] {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = schema(&[("x", DataType::Int64)]);
        let node = write_node(dir.path(), target, &["a"], &[], strategy);
        let registry = Arc::new(WriteProtocolRegistry::with_builtin_protocols());
        let ctx = || {
            TableWriterContext::default()
                .with_protocols(Arc::clone(&registry))
                .with_max_rows_per_file(0)
        };

        let first = run_writer(node.clone(), ctx(), vec![int64_chunk("a", &[1, 2, 3])])
            .expect("first write");
        let second =
            run_writer(node, ctx(), vec![int64_chunk("a", &[4, 5])]).expect("second write");
        assert_eq!(first + second, 5, "strategy={strategy}");
        assert_eq!(list_files(dir.path(), false).expect("list").len(), 2);
        assert_eq!(visible_values(dir.path(), "x"), vec![1, 2, 3, 4, 5]);
    }
}

#[test]
fn test_writers_sharing_a_directory_keep_all_rows() {
    for strategy in [CommitStrategy::NoCommit, CommitStrategy::TaskCommit] {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = schema(&[("x", DataType::Int64)]);
        let registry = protocols(&[strategy]);
        let query = UniqueId::new(3, 5);

        for (writer_id, values) in [(0u32, vec![10, 11]), (1u32, vec![20, 21, 22])] {
            let node = write_node(dir.path(), Arc::clone(&target), &["a"], &[], strategy);
            let ctx = context(Arc::clone(&registry))
                .with_query_id(query)
                .with_writer_id(writer_id);
            run_writer(node, ctx, vec![int64_chunk("a", &values)]).expect("write");
        }
        assert_eq!(list_files(dir.path(), false).expect("list").len(), 2);
        assert_eq!(visible_values(dir.path(), "x"), vec![10, 11, 20, 21, 22]);
    }
}

#[test]
fn test_file_name_collision_never_replaces_committed_rows() {
    let instance = UniqueId::new(1, 1);
    for strategy in [CommitStrategy::NoCommit, CommitStrategy::TaskCommit] {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = schema(&[("x", DataType::Int64)]);
        let node = write_node(dir.path(), target, &["a"], &[], strategy);
        let registry = protocols(&[strategy]);

        let ctx = context(Arc::clone(&registry)).with_instance_id(instance);
        run_writer(node.clone(), ctx, vec![int64_chunk("a", &[1, 2, 3])]).expect("first write");

        let ctx = context(registry).with_instance_id(instance);
        let err = run_writer(node, ctx, vec![int64_chunk("a", &[4, 5])])
            .expect_err("same file name");
        match strategy {
            CommitStrategy::NoCommit => {
                assert!(matches!(err, Error::WriteFailure(_)), "err={err}")
            }
            _ => assert!(matches!(err, Error::CommitFailure(_)), "err={err}"),
        }
        assert_eq!(list_files(dir.path(), false).expect("list").len(), 1);
        assert_eq!(visible_values(dir.path(), "x"), vec![1, 2, 3]);
    }
}

#[test]
fn test_writer_defaults_follow_loaded_config() {
    let test_config = TestConfig::new().expect("test config");
    test_config.init_logging();
    let config = test_config.load_config().expect("load config");
    let ctx = TableWriterContext::default();
    assert_eq!(ctx.max_rows_per_file, config.writer.max_rows_per_file);
    assert!(ctx.instance_id.is_none());
}

#[test]
fn test_task_commit_hides_files_until_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[("x", DataType::Int64)]);
    let node = write_node(dir.path(), target, &["a"], &[], CommitStrategy::TaskCommit);
    let mut writer =
        TableWriterOperator::try_new(node, context(protocols(&[CommitStrategy::TaskCommit])))
            .expect("writer");

    writer.push_chunk(int64_chunk("a", &[1, 2])).expect("push");
    writer.push_chunk(int64_chunk("a", &[3])).expect("push");
    assert_eq!(writer.state(), TableWriterState::Accumulating);
    assert!(list_files(dir.path(), false).expect("list").is_empty());
    let staged = list_files(dir.path(), true).expect("list");
    assert_eq!(staged.len(), 1);
    assert!(file_names(&staged).iter().all(|n| n.starts_with('.')));

    writer.set_finishing().expect("finish");
    assert_eq!(writer.state(), TableWriterState::Done);
    let summary = writer.pull_chunk().expect("pull").expect("summary");
    assert_eq!(int64_values(&summary.batch, "rows"), vec![3]);

    let visible = list_files(dir.path(), false).expect("list");
    assert_eq!(visible.len(), 1);
    assert_eq!(list_files(dir.path(), true).expect("list").len(), 1);
    let batches = read_parquet_file(&visible[0]).expect("read");
    let values: Vec<i64> = batches.iter().flat_map(|b| int64_values(b, "x")).collect();
    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(writer.committed_files().len(), 1);
    assert_eq!(writer.committed_files()[0].path, visible[0]);
}

#[test]
fn test_columns_are_mapped_by_name_and_position() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[
        ("x", DataType::Int64),
        ("y", DataType::Utf8),
        ("z", DataType::Int64),
    ]);
    let node = write_node(
        dir.path(),
        target,
        &["d", "c", "b"],
        &[],
        CommitStrategy::NoCommit,
    );
    let input = chunk_of(vec![
        ("a", Arc::new(StringArray::from(vec!["a0", "a1"])) as ArrayRef),
        ("b", Arc::new(Int64Array::from(vec![10, 11])) as ArrayRef),
        ("c", Arc::new(StringArray::from(vec!["c0", "c1"])) as ArrayRef),
        ("d", Arc::new(Int32Array::from(vec![100, 101])) as ArrayRef),
    ]);

    let rows = run_writer(node, context(protocols(&[CommitStrategy::NoCommit])), vec![input])
        .expect("write");
    assert_eq!(rows, 2);

    let batches = read_visible_batches(dir.path()).expect("read");
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    let names: Vec<_> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(names, vec!["x", "y", "z"]);
    assert_eq!(int64_values(batch, "x"), vec![100, 101]);
    assert_eq!(string_values(batch, "y"), vec!["c0", "c1"]);
    assert_eq!(int64_values(batch, "z"), vec![10, 11]);
}

#[test]
fn test_missing_input_column_fails_write() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[("x", DataType::Int64)]);
    let node = write_node(dir.path(), target, &["nope"], &[], CommitStrategy::NoCommit);
    let err = run_writer(
        node,
        context(protocols(&[CommitStrategy::NoCommit])),
        vec![int64_chunk("a", &[1])],
    )
    .expect_err("missing column");
    assert!(matches!(err, Error::InvalidPlan(_)), "err={err}");
}

#[test]
fn test_partitioned_write_groups_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[("id", DataType::Int64), ("region", DataType::Utf8)]);
    let node = write_node(
        dir.path(),
        target,
        &["id", "region"],
        &["region"],
        CommitStrategy::TaskCommit,
    );
    let input = chunk_of(vec![
        ("id", Arc::new(Int64Array::from(vec![1, 2, 3, 4])) as ArrayRef),
        (
            "region",
            Arc::new(StringArray::from(vec!["east", "west", "east", "north west"])) as ArrayRef,
        ),
    ]);

    let task_id = UniqueId::new(42, 4242);
    sink_commit::unregister(task_id);
    let ctx = context(protocols(&[CommitStrategy::TaskCommit])).with_task_id(task_id);
    let rows = run_writer(node, ctx, vec![input]).expect("write");
    assert_eq!(rows, 4);

    let east = read_visible_batches(&dir.path().join("region=east")).expect("east");
    let east_ids: Vec<i64> = east.iter().flat_map(|b| int64_values(b, "id")).collect();
    assert_eq!(east_ids, vec![1, 3]);
    let west = read_visible_batches(&dir.path().join("region=west")).expect("west");
    assert_eq!(west.iter().map(RecordBatch::num_rows).sum::<usize>(), 1);
    assert!(dir.path().join("region=north+west").is_dir());

    let committed = sink_commit::list_committed_files(task_id);
    assert_eq!(committed.len(), 3);
    let mut partitions: Vec<_> = committed.iter().map(|f| f.partition_path.clone()).collect();
    partitions.sort();
    assert_eq!(
        partitions,
        vec!["region=east", "region=north+west", "region=west"]
    );
    let (loaded_rows, loaded_bytes) = sink_commit::get_load_counters(task_id);
    assert_eq!(loaded_rows, 4);
    assert!(loaded_bytes > 0);
    sink_commit::unregister(task_id);
}

#[test]
fn test_files_roll_after_max_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[("x", DataType::Int64)]);
    let node = write_node(dir.path(), target, &["a"], &[], CommitStrategy::TaskCommit);
    let ctx = context(protocols(&[CommitStrategy::TaskCommit])).with_max_rows_per_file(2);

    let rows = run_writer(
        node,
        ctx,
        vec![int64_chunk("a", &[1, 2, 3]), int64_chunk("a", &[4, 5])],
    )
    .expect("write");
    assert_eq!(rows, 5);

    let files = list_files(dir.path(), false).expect("list");
    assert_eq!(files.len(), 3);
    let mut values = Vec::new();
    for file in &files {
        let batches = read_parquet_file(file).expect("read");
        let count: usize = batches.iter().map(RecordBatch::num_rows).sum();
        assert!(count <= 2);
        values.extend(batches.iter().flat_map(|b| int64_values(b, "x")));
    }
    values.sort();
    assert_eq!(values, vec![1, 2, 3, 4, 5]);
}

/// Opens real parquet files but fails every write after the first.
struct FlakyConnector {
    inner: ParquetConnector,
}

impl StorageConnector for FlakyConnector {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn open_file(&self, path: &Path, schema: SchemaRef) -> Result<FileHandle> {
        self.inner.open_file(path, schema)
    }

    fn write_rows(&self, file: &mut FileHandle, batch: &RecordBatch) -> Result<()> {
        if file.row_count() > 0 {
            return Err(Error::WriteFailure("disk quota exceeded".to_string()));
        }
        self.inner.write_rows(file, batch)
    }
}

#[test]
fn test_failed_write_skips_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = schema(&[("x", DataType::Int64)]);
    let handle = InsertTableHandle::try_new(
        "flaky",
        &dir.path().to_string_lossy(),
        target,
        vec![],
    )
    .expect("handle");
    let node = TableWriteNode {
        input_columns: vec!["a".to_string()],
        insert_handle: handle,
        commit_strategy: CommitStrategy::TaskCommit,
        output_column: "rows".to_string(),
    };
    let mut connectors = ConnectorRegistry::default();
    connectors.register_storage_connector(Arc::new(FlakyConnector {
        inner: ParquetConnector::new("snappy").expect("parquet"),
    }));
    let ctx = context(protocols(&[CommitStrategy::TaskCommit])).with_connectors(connectors);
    let mut writer = TableWriterOperator::try_new(node, ctx).expect("writer");

    writer.push_chunk(int64_chunk("a", &[1])).expect("first push");
    let err = writer
        .push_chunk(int64_chunk("a", &[2]))
        .expect_err("second push fails");
    assert!(matches!(err, Error::WriteFailure(_)));
    assert_eq!(writer.state(), TableWriterState::Failed);
    assert!(!writer.need_input());

    assert!(writer.set_finishing().is_err());
    assert!(writer.pull_chunk().expect("pull").is_none());
    assert!(list_files(dir.path(), false).expect("list").is_empty());
    let staged = list_files(dir.path(), true).expect("list");
    assert_eq!(staged.len(), 1);
    assert!(file_names(&staged)[0].starts_with('.'));
}

#[test]
fn test_exchange_into_table_writer() {
    run_with_timeout(Duration::from_secs(30), || {
        let dir = tempfile::tempdir().expect("tempdir");
        let tasks = ["table-write-it-p0", "table-write-it-p1"];
        for (i, task) in tasks.iter().enumerate() {
            local::create_task_output(task, 1).expect("create output");
            for k in 0..5i64 {
                let base = i as i64 * 100 + k * 10;
                local::enqueue_output(task, 0, &[int64_chunk("v", &[base, base + 1])])
                    .expect("enqueue");
            }
            local::no_more_output(task).expect("finish output");
        }

        let client = ExchangeClient::with_parts(
            0,
            PageBuffer::new("table-write", 1 << 20),
            ExchangeSourceRegistry::default(),
        );
        for task in &tasks {
            client
                .add_remote_task(&format!("local://{task}"))
                .expect("add task");
        }
        client.no_more_remote_tasks();

        let target = schema(&[("x", DataType::Int64)]);
        let node = write_node(dir.path(), target, &["v"], &[], CommitStrategy::TaskCommit);
        let writer =
            TableWriterOperator::try_new(node, context(protocols(&[CommitStrategy::TaskCommit])))
                .expect("writer");
        let mut driver = PipelineDriver::new(
            3,
            Box::new(ExchangeScan::new(client)),
            vec![Box::new(writer)],
        );
        let out = driver.run().expect("run");
        assert_eq!(int64_values(&out[0].batch, "rows"), vec![20]);

        let mut values: Vec<i64> = read_visible_batches(dir.path())
            .expect("read")
            .iter()
            .flat_map(|b| int64_values(b, "x"))
            .collect();
        values.sort();
        assert_eq!(values.len(), 20);
        assert_eq!(values[0], 0);
        assert_eq!(values[19], 141);
        for task in &tasks {
            local::remove_task_output(task);
        }
    });
}
