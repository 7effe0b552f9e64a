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
//! Exchange client: the consuming side of one destination.
//!
//! The client owns every source feeding its page buffer. Pulls are started by
//! [`ExchangeClient::schedule`], which runs on the consumer thread whenever a source is
//! added, before each blocking dequeue, and from the buffer's space observer once a
//! full buffer drains below its high-water mark.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::common::error::{Error, Result};
use crate::exec::chunk::Chunk;
use crate::novarocks_logging::{debug, info};
use crate::runtime::exchange::page::Page;
use crate::runtime::exchange::page_buffer::{PageBuffer, PageBufferStats, PagePopResult};
use crate::runtime::exchange::source::{
    ExchangeSource, ExchangeSourceRegistry, SourceStats, exchange_source_registry,
};

#[derive(Clone, Debug, Default)]
pub struct ExchangeClientStats {
    pub sources: Vec<(String, SourceStats)>,
    pub buffer: PageBufferStats,
    pub buffered_bytes: usize,
}

#[derive(Default)]
struct ClientState {
    sources: Vec<Arc<dyn ExchangeSource>>,
    locators: HashSet<String>,
    no_more_tasks: bool,
    closed: bool,
    closed_task_ids: Vec<String>,
}

struct ClientInner {
    destination: usize,
    buffer: Arc<PageBuffer>,
    registry: ExchangeSourceRegistry,
    state: Mutex<ClientState>,
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().expect("exchange client lock")
    }

    fn schedule(&self) {
        let sources = {
            let st = self.lock();
            if st.closed {
                return;
            }
            st.sources.clone()
        };
        for source in sources {
            if !self.buffer.has_capacity() {
                break;
            }
            if source.should_request() {
                source.request();
            }
        }
    }
}

pub struct ExchangeClient {
    inner: Arc<ClientInner>,
}

impl ExchangeClient {
    /// Client with a buffer sized from config and the process-wide source registry.
    pub fn new(destination: usize) -> Self {
        let buffer = PageBuffer::with_configured_limit(format!("exchange-dest-{destination}"));
        Self::with_parts(destination, buffer, exchange_source_registry())
    }

    pub fn with_parts(
        destination: usize,
        buffer: Arc<PageBuffer>,
        registry: ExchangeSourceRegistry,
    ) -> Self {
        let inner = Arc::new(ClientInner {
            destination,
            buffer,
            registry,
            state: Mutex::new(ClientState::default()),
        });
        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        inner
            .buffer
            .space_observable()
            .add_observer(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule();
                }
            }));
        Self { inner }
    }

    pub fn destination(&self) -> usize {
        self.inner.destination
    }

    pub fn buffer(&self) -> &Arc<PageBuffer> {
        &self.inner.buffer
    }

    /// Adds a source for `locator`; a locator already added is ignored.
    pub fn add_remote_task(&self, locator: &str) -> Result<()> {
        {
            let mut st = self.inner.lock();
            if st.closed {
                return Err(Error::StreamClosed(format!(
                    "exchange client closed, cannot add {locator}"
                )));
            }
            if st.locators.contains(locator) {
                return Ok(());
            }
            if st.no_more_tasks {
                return Err(Error::InvalidPlan(format!(
                    "remote task {locator} added after no_more_remote_tasks"
                )));
            }
            let source =
                self.inner
                    .registry
                    .resolve(locator, self.inner.destination, &self.inner.buffer)?;
            st.locators.insert(locator.to_string());
            st.sources.push(source);
            debug!(
                "exchange client ADD source: destination={} locator={} sources={}",
                self.inner.destination,
                locator,
                st.sources.len()
            );
        }
        self.inner.schedule();
        Ok(())
    }

    pub fn no_more_remote_tasks(&self) {
        {
            let mut st = self.inner.lock();
            if st.no_more_tasks {
                return;
            }
            st.no_more_tasks = true;
        }
        self.inner.buffer.no_more_producers();
    }

    pub fn schedule(&self) {
        self.inner.schedule();
    }

    /// Blocks for the next page; `None` once every source reached its end.
    pub fn next_page(&self) -> Result<Option<Page>> {
        self.inner.schedule();
        match self.inner.buffer.dequeue()? {
            PagePopResult::Page(page) => Ok(Some(page)),
            PagePopResult::End => Ok(None),
        }
    }

    pub fn next_chunks(&self) -> Result<Option<Vec<Chunk>>> {
        match self.next_page()? {
            Some(page) => page.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Closes every source, in flight or not, and cancels the buffer. Idempotent.
    pub fn close(&self) {
        let sources = {
            let mut st = self.inner.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.sources.clone()
        };
        let mut closed = Vec::with_capacity(sources.len());
        for source in &sources {
            source.close();
            closed.push(source.task_id().to_string());
        }
        self.inner.buffer.cancel();
        {
            let mut st = self.inner.lock();
            for task_id in closed {
                if !st.closed_task_ids.contains(&task_id) {
                    st.closed_task_ids.push(task_id);
                }
            }
        }
        info!(
            "exchange client CLOSED: destination={} sources={}",
            self.inner.destination,
            sources.len()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn closed_task_ids(&self) -> Vec<String> {
        self.inner.lock().closed_task_ids.clone()
    }

    /// True once the end of stream is reached and drained, or the client is closed.
    pub fn is_finished(&self) -> bool {
        if self.is_closed() {
            return true;
        }
        let snapshot = self.inner.buffer.snapshot();
        snapshot.at_end && snapshot.queued_pages == 0
    }

    pub fn stats(&self) -> ExchangeClientStats {
        let sources = self.inner.lock().sources.clone();
        ExchangeClientStats {
            sources: sources
                .iter()
                .map(|s| (s.task_id().to_string(), s.stats()))
                .collect(),
            buffer: self.inner.buffer.stats(),
            buffered_bytes: self.inner.buffer.buffered_bytes(),
        }
    }
}

impl Drop for ExchangeClient {
    fn drop(&mut self) {
        self.close();
    }
}
