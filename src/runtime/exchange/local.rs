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
//! In-process exchange transport for `local://<task-id>` locators.
//!
//! A producing task registers an output with one queue per destination and appends
//! pages with consecutive sequence numbers. Consumers long-poll with the next sequence
//! they expect; that sequence acknowledges (and frees) every earlier page. Closing a
//! consumer aborts its destination queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::common::config::{exchange_max_request_bytes, exchange_request_wait};
use crate::common::error::{Error, Result};
use crate::exec::chunk::Chunk;
use crate::novarocks_logging::{debug, info};
use crate::runtime::exchange::page::Page;
use crate::runtime::exchange::page_buffer::PageBuffer;
use crate::runtime::exchange::source::{ExchangeSource, ExchangeSourceFactory, SourceCore};
use crate::runtime::io::{IoTaskContext, IoTaskHandle, io_executor};

pub const LOCAL_LOCATOR_PREFIX: &str = "local://";

#[derive(Default)]
struct DestinationQueue {
    /// Unacknowledged pages; the front page has sequence `acked`.
    pages: VecDeque<Page>,
    acked: i64,
    next_sequence: i64,
    aborted: bool,
}

impl DestinationQueue {
    fn acknowledge(&mut self, sequence: i64) {
        while self.acked < sequence && !self.pages.is_empty() {
            self.pages.pop_front();
            self.acked += 1;
        }
    }
}

struct OutputState {
    destinations: Vec<DestinationQueue>,
    no_more_output: bool,
    failure: Option<String>,
}

struct TaskOutput {
    task_id: String,
    state: Mutex<OutputState>,
    cv: Condvar,
}

impl TaskOutput {
    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().expect("local task output lock")
    }
}

/// Pages handed to a consumer by one long-poll.
#[derive(Debug)]
pub struct LocalPageBatch {
    pub pages: Vec<Page>,
    /// Sequence the consumer should ask for next.
    pub next_sequence: i64,
    /// No page at or after `next_sequence` will ever be produced.
    pub end: bool,
}

static LOCAL_OUTPUTS: OnceLock<Mutex<HashMap<String, Arc<TaskOutput>>>> = OnceLock::new();

fn outputs() -> MutexGuard<'static, HashMap<String, Arc<TaskOutput>>> {
    LOCAL_OUTPUTS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .expect("local outputs lock")
}

fn lookup(task_id: &str) -> Result<Arc<TaskOutput>> {
    outputs()
        .get(task_id)
        .cloned()
        .ok_or_else(|| Error::TransportFailure(format!("unknown local task output {task_id}")))
}

fn destination_mut<'a>(
    state: &'a mut OutputState,
    task_id: &str,
    destination: usize,
) -> Result<&'a mut DestinationQueue> {
    let count = state.destinations.len();
    state.destinations.get_mut(destination).ok_or_else(|| {
        Error::InvalidPlan(format!(
            "task {task_id} has {count} destinations, destination {destination} requested"
        ))
    })
}

/// Register the output of a producing task.
pub fn create_task_output(task_id: &str, num_destinations: usize) -> Result<()> {
    if num_destinations == 0 {
        return Err(Error::InvalidPlan(format!(
            "task {task_id} must have at least one destination"
        )));
    }
    let mut guard = outputs();
    if guard.contains_key(task_id) {
        return Err(Error::InvalidPlan(format!(
            "local task output {task_id} already exists"
        )));
    }
    let destinations = (0..num_destinations)
        .map(|_| DestinationQueue::default())
        .collect();
    guard.insert(
        task_id.to_string(),
        Arc::new(TaskOutput {
            task_id: task_id.to_string(),
            state: Mutex::new(OutputState {
                destinations,
                no_more_output: false,
                failure: None,
            }),
            cv: Condvar::new(),
        }),
    );
    debug!(
        "local task output CREATED: task_id={} destinations={}",
        task_id, num_destinations
    );
    Ok(())
}

/// Append `chunks` as one page for `destination`. Output for an aborted destination is
/// dropped.
pub fn enqueue_output(task_id: &str, destination: usize, chunks: &[Chunk]) -> Result<()> {
    let output = lookup(task_id)?;
    let mut st = output.lock();
    if st.no_more_output || st.failure.is_some() {
        return Err(Error::StreamClosed(format!(
            "local task output {task_id} is finished"
        )));
    }
    let queue = destination_mut(&mut st, task_id, destination)?;
    if queue.aborted {
        return Ok(());
    }
    let page = Page::encode(queue.next_sequence, chunks)?;
    queue.next_sequence += 1;
    queue.pages.push_back(page);
    output.cv.notify_all();
    Ok(())
}

pub fn no_more_output(task_id: &str) -> Result<()> {
    let output = lookup(task_id)?;
    let mut st = output.lock();
    st.no_more_output = true;
    output.cv.notify_all();
    Ok(())
}

pub fn fail_task_output(task_id: &str, message: impl Into<String>) -> Result<()> {
    let output = lookup(task_id)?;
    let mut st = output.lock();
    if st.failure.is_none() {
        st.failure = Some(message.into());
        for queue in st.destinations.iter_mut() {
            queue.pages.clear();
        }
    }
    output.cv.notify_all();
    Ok(())
}

pub fn remove_task_output(task_id: &str) -> bool {
    let removed = outputs().remove(task_id);
    if let Some(output) = removed.as_ref() {
        let mut st = output.lock();
        if st.failure.is_none() {
            st.failure = Some("task output removed".to_string());
        }
        output.cv.notify_all();
    }
    removed.is_some()
}

/// Pages still held for `destination`, i.e. not yet acknowledged.
pub fn buffered_output_pages(task_id: &str, destination: usize) -> Option<usize> {
    let output = lookup(task_id).ok()?;
    let st = output.lock();
    st.destinations.get(destination).map(|q| q.pages.len())
}

/// Long-poll for pages starting at `sequence`. Asking for `sequence` acknowledges every
/// earlier page. Returns an empty, non-final batch when `wait` elapses.
pub fn get_output(
    task_id: &str,
    destination: usize,
    sequence: i64,
    max_bytes: usize,
    wait: Duration,
) -> Result<LocalPageBatch> {
    let output = lookup(task_id)?;
    let deadline = Instant::now() + wait;
    let mut st = output.lock();
    loop {
        if let Some(message) = st.failure.as_ref() {
            return Err(Error::TransportFailure(format!(
                "task {}: {message}",
                output.task_id
            )));
        }
        let no_more_output = st.no_more_output;
        let queue = destination_mut(&mut st, task_id, destination)?;
        if queue.aborted {
            return Err(Error::StreamClosed(format!(
                "destination {destination} of task {task_id} was aborted"
            )));
        }
        if sequence > queue.next_sequence {
            return Err(Error::TransportFailure(format!(
                "task {task_id} destination {destination}: requested sequence {sequence} \
                 beyond produced {}",
                queue.next_sequence
            )));
        }
        queue.acknowledge(sequence);

        let available = queue.pages.len();
        if available > 0 || no_more_output {
            let mut pages = Vec::new();
            let mut bytes = 0usize;
            for page in queue.pages.iter() {
                if !pages.is_empty() && bytes + page.byte_len() > max_bytes {
                    break;
                }
                bytes += page.byte_len();
                pages.push(page.clone());
            }
            let next_sequence = sequence + pages.len() as i64;
            let end = no_more_output && next_sequence == queue.next_sequence;
            return Ok(LocalPageBatch {
                pages,
                next_sequence,
                end,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(LocalPageBatch {
                pages: Vec::new(),
                next_sequence: sequence,
                end: false,
            });
        }
        let (next, _) = output
            .cv
            .wait_timeout(st, deadline - now)
            .map_err(|_| Error::TransportFailure("local task output wait poisoned".to_string()))?;
        st = next;
    }
}

pub fn acknowledge_output(task_id: &str, destination: usize, sequence: i64) -> Result<()> {
    let output = lookup(task_id)?;
    let mut st = output.lock();
    destination_mut(&mut st, task_id, destination)?.acknowledge(sequence);
    Ok(())
}

/// Consumer is gone: free buffered pages and drop later output for `destination`.
pub fn abort_output(task_id: &str, destination: usize) -> Result<()> {
    let output = lookup(task_id)?;
    let mut st = output.lock();
    let queue = destination_mut(&mut st, task_id, destination)?;
    queue.aborted = true;
    queue.pages.clear();
    output.cv.notify_all();
    info!(
        "local task output destination ABORTED: task_id={} destination={}",
        task_id, destination
    );
    Ok(())
}

pub struct LocalExchangeSource {
    core: SourceCore,
    output_task_id: String,
    next_sequence: Mutex<i64>,
    inflight: Mutex<Vec<IoTaskHandle>>,
    max_request_bytes: usize,
    request_wait: Duration,
}

impl LocalExchangeSource {
    fn pull(self: &Arc<Self>, ctx: &IoTaskContext) {
        if ctx.is_cancelled() || self.core.is_closed() {
            self.core.clear_pending();
            return;
        }
        let sequence = *self.next_sequence.lock().expect("local source sequence lock");
        let batch = match get_output(
            &self.output_task_id,
            self.core.destination(),
            sequence,
            self.max_request_bytes,
            self.request_wait,
        ) {
            Ok(batch) => batch,
            Err(err) => {
                self.core.on_failure(err);
                return;
            }
        };

        let out_of_order = batch
            .pages
            .iter()
            .enumerate()
            .find(|(i, page)| page.sequence() != sequence + *i as i64);
        if let Some((i, page)) = out_of_order {
            self.core.on_failure(format!(
                "expected page sequence {} got {}",
                sequence + i as i64,
                page.sequence()
            ));
            return;
        }

        if let Err(err) = self.core.on_pages(batch.pages) {
            self.core.on_failure(err);
            return;
        }
        *self.next_sequence.lock().expect("local source sequence lock") = batch.next_sequence;

        if batch.end {
            // Release the tail of the destination queue.
            if let Err(err) = acknowledge_output(
                &self.output_task_id,
                self.core.destination(),
                batch.next_sequence,
            ) {
                debug!(
                    "local exchange source end: task_id={} acknowledge skipped: {}",
                    self.output_task_id, err
                );
            }
            self.core.on_end();
            return;
        }
        if self.core.complete_request() {
            Arc::clone(self).request();
        }
    }
}

impl ExchangeSource for LocalExchangeSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn request(self: Arc<Self>) {
        let source = Arc::clone(&self);
        let handle = io_executor().submit(move |ctx| source.pull(&ctx));
        let mut inflight = self.inflight.lock().expect("local source inflight lock");
        inflight.retain(|h| !h.is_finished());
        inflight.push(handle);
    }

    fn close(&self) {
        if !self.core.close() {
            return;
        }
        for handle in self
            .inflight
            .lock()
            .expect("local source inflight lock")
            .drain(..)
        {
            handle.cancel();
        }
        if let Err(err) = abort_output(&self.output_task_id, self.core.destination()) {
            debug!(
                "local exchange source close: task_id={} abort skipped: {}",
                self.output_task_id, err
            );
        }
    }
}

pub struct LocalExchangeSourceFactory;

impl ExchangeSourceFactory for LocalExchangeSourceFactory {
    fn prefix(&self) -> &str {
        LOCAL_LOCATOR_PREFIX
    }

    fn create(
        &self,
        locator: &str,
        destination: usize,
        buffer: &Arc<PageBuffer>,
    ) -> Result<Arc<dyn ExchangeSource>> {
        let output_task_id = locator
            .strip_prefix(LOCAL_LOCATOR_PREFIX)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::UnresolvableLocator(locator.to_string()))?;
        Ok(Arc::new(LocalExchangeSource {
            core: SourceCore::new(locator, destination, buffer)?,
            output_task_id: output_task_id.to_string(),
            next_sequence: Mutex::new(0),
            inflight: Mutex::new(Vec::new()),
            max_request_bytes: exchange_max_request_bytes(),
            request_wait: exchange_request_wait(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    use super::*;
    use crate::runtime::exchange::page_buffer::PagePopResult;

    fn chunk(values: &[i32]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
            .expect("batch");
        Chunk::new(batch)
    }

    #[test]
    fn get_acknowledges_earlier_pages() {
        let task = "local-unit-ack";
        create_task_output(task, 1).expect("create");
        enqueue_output(task, 0, &[chunk(&[1])]).expect("enqueue");
        enqueue_output(task, 0, &[chunk(&[2])]).expect("enqueue");

        let first = get_output(task, 0, 0, 1, Duration::ZERO).expect("get");
        assert_eq!(first.pages.len(), 1);
        assert_eq!(first.next_sequence, 1);
        assert!(!first.end);
        assert_eq!(buffered_output_pages(task, 0), Some(2));

        no_more_output(task).expect("finish");
        let second = get_output(task, 0, 1, usize::MAX, Duration::ZERO).expect("get");
        assert_eq!(second.pages.len(), 1);
        assert_eq!(second.pages[0].sequence(), 1);
        assert!(second.end);
        assert_eq!(buffered_output_pages(task, 0), Some(1));
        assert!(remove_task_output(task));
    }

    #[test]
    fn empty_poll_times_out_without_end() {
        let task = "local-unit-timeout";
        create_task_output(task, 2).expect("create");
        let batch = get_output(task, 1, 0, 1024, Duration::from_millis(10)).expect("get");
        assert!(batch.pages.is_empty());
        assert!(!batch.end);
        assert!(matches!(
            get_output(task, 2, 0, 1024, Duration::ZERO),
            Err(Error::InvalidPlan(_))
        ));
        remove_task_output(task);
    }

    #[test]
    fn abort_frees_pages_and_drops_later_output() {
        let task = "local-unit-abort";
        create_task_output(task, 1).expect("create");
        enqueue_output(task, 0, &[chunk(&[1, 2])]).expect("enqueue");
        abort_output(task, 0).expect("abort");
        assert_eq!(buffered_output_pages(task, 0), Some(0));
        enqueue_output(task, 0, &[chunk(&[3])]).expect("dropped");
        assert_eq!(buffered_output_pages(task, 0), Some(0));
        remove_task_output(task);
    }

    #[test]
    fn acknowledge_after_removal_reports_error() {
        let task = "local-unit-ack-removed";
        create_task_output(task, 1).expect("create");
        enqueue_output(task, 0, &[chunk(&[1])]).expect("enqueue");
        acknowledge_output(task, 0, 1).expect("acknowledge");
        assert_eq!(buffered_output_pages(task, 0), Some(0));
        assert!(remove_task_output(task));

        let err = acknowledge_output(task, 0, 1).expect_err("removed task");
        assert!(matches!(err, Error::TransportFailure(_)), "err={err}");
    }

    #[test]
    fn source_pulls_until_end() {
        let task = "local-unit-source";
        create_task_output(task, 1).expect("create");
        for v in 0..3 {
            enqueue_output(task, 0, &[chunk(&[v])]).expect("enqueue");
        }
        no_more_output(task).expect("finish");

        let buffer = PageBuffer::new("local-source", 1 << 20);
        let source = LocalExchangeSourceFactory
            .create(&format!("local://{task}"), 0, &buffer)
            .expect("create source");
        buffer.no_more_producers();
        assert!(source.should_request());
        Arc::clone(&source).request();

        let mut sequences = Vec::new();
        loop {
            match buffer.dequeue().expect("dequeue") {
                PagePopResult::Page(page) => sequences.push(page.sequence()),
                PagePopResult::End => break,
            }
        }
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(source.is_at_end());
        assert!(!source.should_request());
        remove_task_output(task);
    }

    #[test]
    fn producer_failure_reaches_consumer() {
        let task = "local-unit-failure";
        create_task_output(task, 1).expect("create");
        let buffer = PageBuffer::new("local-failure", 1 << 20);
        let source = LocalExchangeSourceFactory
            .create(&format!("local://{task}"), 0, &buffer)
            .expect("create source");
        fail_task_output(task, "disk full").expect("fail");
        assert!(source.should_request());
        Arc::clone(&source).request();
        let err = buffer.dequeue().expect_err("failure");
        assert!(err.to_string().contains("disk full"), "err={err}");
        remove_task_output(task);
    }

    #[test]
    fn empty_task_id_is_unresolvable() {
        let buffer = PageBuffer::new("local-empty", 1 << 20);
        let err = LocalExchangeSourceFactory
            .create("local://", 0, &buffer)
            .err()
            .expect("unresolvable");
        assert!(matches!(err, Error::UnresolvableLocator(_)));
    }
}
