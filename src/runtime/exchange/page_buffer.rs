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
//! Per-destination queue shared by every exchange source of one consuming task.
//!
//! The buffer is the single mutual-exclusion boundary between asynchronous pull
//! completions and the consumer: pages, terminal markers, producer bookkeeping and the
//! byte accounting all live under one mutex. The consumer blocks on a condition variable
//! until a page, the end of stream, a failure or a cancellation is observed.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::common::config::exchange_high_water_mark_bytes;
use crate::common::error::{Error, Result};
use crate::novarocks_logging::{debug, warn};
use crate::runtime::exchange::page::Page;
use crate::runtime::observer::Observable;

const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);
const ENQUEUE_LOG_EVERY: u64 = 4096;

static ENQUEUE_LOG_COUNT: AtomicU64 = AtomicU64::new(0);

fn should_log_enqueue() -> bool {
    ENQUEUE_LOG_COUNT.fetch_add(1, Ordering::Relaxed) % ENQUEUE_LOG_EVERY == 0
}

/// Identity of one producer (exchange source) feeding the buffer.
pub type ProducerId = u64;

#[derive(Debug)]
pub enum PagePopResult {
    Page(Page),
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The producer was detached or the stream was abandoned; nothing was queued.
    Discarded,
}

#[derive(Clone, Debug, Default)]
pub struct PageBufferStats {
    pub pages_received: u64,
    pub bytes_received: u64,
    pub rows_received: u64,
    pub pages_discarded: u64,
    pub peak_buffered_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct PageBufferSnapshot {
    pub queued_pages: usize,
    pub buffered_bytes: usize,
    pub registered_producers: usize,
    pub finished_producers: usize,
    pub at_end: bool,
    pub failed: bool,
    pub cancelled: bool,
}

#[derive(Default)]
struct BufferState {
    pages: VecDeque<Page>,
    buffered_bytes: usize,
    at_end: bool,
    failure: Option<String>,
    cancelled: bool,
    next_producer: ProducerId,
    producers: HashSet<ProducerId>,
    finished: HashSet<ProducerId>,
    detached: HashSet<ProducerId>,
    no_more_producers: bool,
    waiting_for_space: bool,
    stats: PageBufferStats,
}

impl BufferState {
    fn closed_reason(&self) -> Option<&'static str> {
        if self.failure.is_some() {
            Some("page buffer failed")
        } else if self.at_end {
            Some("page buffer already at end")
        } else if self.cancelled {
            Some("page buffer cancelled")
        } else {
            None
        }
    }

    fn done_producers(&self) -> usize {
        self.producers
            .iter()
            .filter(|p| self.finished.contains(p) || self.detached.contains(p))
            .count()
    }
}

pub struct PageBuffer {
    label: String,
    high_water_mark_bytes: usize,
    mu: Mutex<BufferState>,
    cv: Condvar,
    space_available: Arc<Observable>,
}

impl PageBuffer {
    pub fn new(label: impl Into<String>, high_water_mark_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            high_water_mark_bytes: high_water_mark_bytes.max(1),
            mu: Mutex::new(BufferState::default()),
            cv: Condvar::new(),
            space_available: Arc::new(Observable::new()),
        })
    }

    pub fn with_configured_limit(label: impl Into<String>) -> Arc<Self> {
        Self::new(label, exchange_high_water_mark_bytes())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn high_water_mark_bytes(&self) -> usize {
        self.high_water_mark_bytes
    }

    /// Fires when a dequeue brings the buffer back under its high-water mark after a
    /// producer was refused capacity.
    pub fn space_observable(&self) -> Arc<Observable> {
        Arc::clone(&self.space_available)
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.mu.lock().expect("page buffer lock")
    }

    pub fn register_producer(&self) -> Result<ProducerId> {
        let mut st = self.lock();
        if let Some(reason) = st.closed_reason() {
            return Err(Error::StreamClosed(format!("{}: {reason}", self.label)));
        }
        if st.no_more_producers {
            return Err(Error::StreamClosed(format!(
                "{}: no more producers may register",
                self.label
            )));
        }
        let id = st.next_producer;
        st.next_producer += 1;
        st.producers.insert(id);
        Ok(id)
    }

    pub fn no_more_producers(&self) {
        let mut st = self.lock();
        st.no_more_producers = true;
        self.maybe_finish_locked(&mut st);
    }

    /// One producer reached its own end of stream.
    pub fn producer_finished(&self, producer: ProducerId) {
        let mut st = self.lock();
        if !st.producers.contains(&producer) || st.detached.contains(&producer) {
            return;
        }
        st.finished.insert(producer);
        self.maybe_finish_locked(&mut st);
    }

    /// Stop accepting pages from `producer`. Once this returns, every later
    /// `enqueue_from` for the producer is discarded.
    pub fn detach_producer(&self, producer: ProducerId) {
        let mut st = self.lock();
        if !st.detached.insert(producer) {
            return;
        }
        self.maybe_finish_locked(&mut st);
    }

    fn maybe_finish_locked(&self, st: &mut BufferState) {
        if st.at_end || st.failure.is_some() || st.cancelled || !st.no_more_producers {
            return;
        }
        if st.done_producers() < st.producers.len() {
            return;
        }
        st.at_end = true;
        debug!(
            "page buffer AT END: label={} producers={} queued_pages={}",
            self.label,
            st.producers.len(),
            st.pages.len()
        );
        self.cv.notify_all();
    }

    fn push_locked(&self, st: &mut BufferState, page: Page) {
        st.buffered_bytes = st.buffered_bytes.saturating_add(page.byte_len());
        st.stats.pages_received += 1;
        st.stats.bytes_received += page.byte_len() as u64;
        st.stats.rows_received += page.num_rows() as u64;
        st.stats.peak_buffered_bytes = st.stats.peak_buffered_bytes.max(st.buffered_bytes);
        st.pages.push_back(page);
    }

    /// Append a page that is not attributed to a registered producer.
    pub fn enqueue(&self, page: Page) -> Result<()> {
        let mut st = self.lock();
        if let Some(reason) = st.closed_reason() {
            return Err(Error::StreamClosed(format!("{}: {reason}", self.label)));
        }
        self.push_locked(&mut st, page);
        self.cv.notify_all();
        Ok(())
    }

    /// Append pages received by `producer`, preserving their order.
    pub fn enqueue_from(&self, producer: ProducerId, pages: Vec<Page>) -> Result<EnqueueOutcome> {
        let mut st = self.lock();
        if st.detached.contains(&producer) || st.cancelled || st.failure.is_some() {
            st.stats.pages_discarded += pages.len() as u64;
            return Ok(EnqueueOutcome::Discarded);
        }
        if st.at_end || st.finished.contains(&producer) {
            return Err(Error::StreamClosed(format!(
                "{}: producer {producer} enqueued after end of stream",
                self.label
            )));
        }
        if !st.producers.contains(&producer) {
            return Err(Error::StreamClosed(format!(
                "{}: unknown producer {producer}",
                self.label
            )));
        }
        let count = pages.len();
        for page in pages {
            self.push_locked(&mut st, page);
        }
        if count > 0 {
            self.cv.notify_all();
        }
        if should_log_enqueue() {
            debug!(
                "page buffer enqueue: label={} producer={} pages={} buffered_bytes={}",
                self.label, producer, count, st.buffered_bytes
            );
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Idempotent; a buffer that already failed or ended ignores later calls.
    pub fn mark_end(&self) {
        let mut st = self.lock();
        if st.at_end || st.failure.is_some() {
            return;
        }
        st.at_end = true;
        self.cv.notify_all();
    }

    /// Idempotent; queued pages are dropped and the next dequeue reports the failure.
    pub fn mark_failed(&self, message: impl Into<String>) {
        let message = message.into();
        let mut st = self.lock();
        if st.at_end || st.failure.is_some() {
            return;
        }
        warn!("page buffer FAILED: label={} error={}", self.label, message);
        st.failure = Some(message);
        st.pages.clear();
        st.buffered_bytes = 0;
        self.cv.notify_all();
    }

    /// Consumer went away: wake every waiter and drop queued pages.
    pub fn cancel(&self) {
        let mut st = self.lock();
        if st.cancelled {
            return;
        }
        st.cancelled = true;
        st.pages.clear();
        st.buffered_bytes = 0;
        self.cv.notify_all();
    }

    /// False while buffered bytes are at or above the high-water mark.
    pub fn has_capacity(&self) -> bool {
        let mut st = self.lock();
        if st.buffered_bytes >= self.high_water_mark_bytes {
            st.waiting_for_space = true;
            return false;
        }
        true
    }

    fn pop_locked(&self, st: &mut BufferState) -> Option<(Page, bool)> {
        let page = st.pages.pop_front()?;
        st.buffered_bytes = st.buffered_bytes.saturating_sub(page.byte_len());
        let wake_producers =
            st.waiting_for_space && st.buffered_bytes < self.high_water_mark_bytes;
        if wake_producers {
            st.waiting_for_space = false;
        }
        Some((page, wake_producers))
    }

    fn deliver(&self, page: Page, wake_producers: bool) -> PagePopResult {
        if wake_producers {
            let notify = self.space_available.defer_notify();
            notify.arm();
        }
        PagePopResult::Page(page)
    }

    /// Blocks until a page, the end of stream, a failure or a cancellation.
    pub fn dequeue(&self) -> Result<PagePopResult> {
        let start = Instant::now();
        let mut st = self.lock();
        loop {
            if let Some(result) = self.poll_locked(&mut st)? {
                return match result {
                    Polled::Page(page, wake) => {
                        drop(st);
                        Ok(self.deliver(page, wake))
                    }
                    Polled::End => Ok(PagePopResult::End),
                };
            }
            let (next, wait_res) = self
                .cv
                .wait_timeout(st, WAIT_LOG_INTERVAL)
                .map_err(|_| Error::TransportFailure("page buffer wait poisoned".to_string()))?;
            st = next;
            if wait_res.timed_out() {
                debug!(
                    "page buffer dequeue WAITING: label={} producers={} finished={} elapsed={:?}",
                    self.label,
                    st.producers.len(),
                    st.done_producers(),
                    start.elapsed()
                );
            }
        }
    }

    /// Non-blocking variant of [`dequeue`](Self::dequeue); `None` means nothing yet.
    pub fn try_dequeue(&self) -> Result<Option<PagePopResult>> {
        let mut st = self.lock();
        match self.poll_locked(&mut st)? {
            Some(Polled::Page(page, wake)) => {
                drop(st);
                Ok(Some(self.deliver(page, wake)))
            }
            Some(Polled::End) => Ok(Some(PagePopResult::End)),
            None => Ok(None),
        }
    }

    fn poll_locked(&self, st: &mut BufferState) -> Result<Option<Polled>> {
        if st.cancelled {
            return Err(Error::Cancelled);
        }
        if let Some(message) = st.failure.as_ref() {
            return Err(Error::TransportFailure(message.clone()));
        }
        if let Some((page, wake)) = self.pop_locked(st) {
            return Ok(Some(Polled::Page(page, wake)));
        }
        if st.at_end {
            return Ok(Some(Polled::End));
        }
        Ok(None)
    }

    pub fn is_at_end(&self) -> bool {
        self.lock().at_end
    }

    pub fn buffered_bytes(&self) -> usize {
        self.lock().buffered_bytes
    }

    pub fn stats(&self) -> PageBufferStats {
        self.lock().stats.clone()
    }

    pub fn snapshot(&self) -> PageBufferSnapshot {
        let st = self.lock();
        PageBufferSnapshot {
            queued_pages: st.pages.len(),
            buffered_bytes: st.buffered_bytes,
            registered_producers: st.producers.len(),
            finished_producers: st.done_producers(),
            at_end: st.at_end,
            failed: st.failure.is_some(),
            cancelled: st.cancelled,
        }
    }
}

enum Polled {
    Page(Page, bool),
    End,
}
