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
//! Exchange sources: one per (upstream task, destination) pair.
//!
//! Every transport shares [`SourceCore`], which owns the request/end/close flags and
//! the producer slot in the page buffer. Transports only implement the pull itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::common::error::{Error, Result};
use crate::novarocks_logging::{debug, warn};
use crate::runtime::exchange::local::LocalExchangeSourceFactory;
use crate::runtime::exchange::page::Page;
use crate::runtime::exchange::page_buffer::{EnqueueOutcome, PageBuffer, ProducerId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub requests: u64,
    pub pages: u64,
    pub bytes: u64,
    pub discarded_pages: u64,
}

pub struct SourceCore {
    task_id: String,
    destination: usize,
    buffer: Arc<PageBuffer>,
    producer: ProducerId,
    request_pending: AtomicBool,
    at_end: AtomicBool,
    failed: AtomicBool,
    closed: AtomicBool,
    requests: AtomicU64,
    pages: AtomicU64,
    bytes: AtomicU64,
    discarded_pages: AtomicU64,
}

impl SourceCore {
    /// Registers a producer slot in `buffer` for this source.
    pub fn new(
        task_id: impl Into<String>,
        destination: usize,
        buffer: &Arc<PageBuffer>,
    ) -> Result<Self> {
        let producer = buffer.register_producer()?;
        Ok(Self {
            task_id: task_id.into(),
            destination,
            buffer: Arc::clone(buffer),
            producer,
            request_pending: AtomicBool::new(false),
            at_end: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            pages: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            discarded_pages: AtomicU64::new(0),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn destination(&self) -> usize {
        self.destination
    }

    pub fn buffer(&self) -> &Arc<PageBuffer> {
        &self.buffer
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    pub fn is_at_end(&self) -> bool {
        self.at_end.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_request_pending(&self) -> bool {
        self.request_pending.load(Ordering::Acquire)
    }

    /// Returns true for exactly one caller until the winner clears the pending flag.
    pub fn should_request(&self) -> bool {
        if self.is_at_end() || self.is_closed() || self.failed.load(Ordering::Acquire) {
            return false;
        }
        let won = self
            .request_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }
        won
    }

    pub fn clear_pending(&self) {
        self.request_pending.store(false, Ordering::Release);
    }

    /// Hand received pages to the buffer. Pages for a closed source are dropped.
    pub fn on_pages(&self, pages: Vec<Page>) -> Result<EnqueueOutcome> {
        let count = pages.len() as u64;
        let bytes: u64 = pages.iter().map(|p| p.byte_len() as u64).sum();
        if self.is_closed() {
            self.discarded_pages.fetch_add(count, Ordering::Relaxed);
            return Ok(EnqueueOutcome::Discarded);
        }
        let outcome = self.buffer.enqueue_from(self.producer, pages)?;
        match outcome {
            EnqueueOutcome::Enqueued => {
                self.pages.fetch_add(count, Ordering::Relaxed);
                self.bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            EnqueueOutcome::Discarded => {
                self.discarded_pages.fetch_add(count, Ordering::Relaxed);
            }
        }
        Ok(outcome)
    }

    pub fn on_end(&self) {
        if self.at_end.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "exchange source END: task_id={} destination={} pages={}",
            self.task_id,
            self.destination,
            self.pages.load(Ordering::Relaxed)
        );
        self.buffer.producer_finished(self.producer);
        self.clear_pending();
    }

    pub fn on_failure(&self, message: impl fmt::Display) {
        if self.is_closed() {
            self.clear_pending();
            return;
        }
        self.failed.store(true, Ordering::Release);
        warn!(
            "exchange source FAILED: task_id={} destination={} error={}",
            self.task_id, self.destination, message
        );
        self.buffer.mark_failed(format!(
            "exchange source {} destination {}: {}",
            self.task_id, self.destination, message
        ));
        self.clear_pending();
    }

    /// Clear the pending flag after a successful pull and report whether the caller
    /// should immediately issue the next pull.
    pub fn complete_request(&self) -> bool {
        self.clear_pending();
        self.buffer.has_capacity() && self.should_request()
    }

    /// Returns true only for the first call. Once this returns, the buffer drops any
    /// page this source delivers.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.buffer.detach_producer(self.producer);
        true
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            requests: self.requests.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            discarded_pages: self.discarded_pages.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for SourceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCore")
            .field("task_id", &self.task_id)
            .field("destination", &self.destination)
            .field("producer", &self.producer)
            .field("at_end", &self.is_at_end())
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub trait ExchangeSource: Send + Sync {
    fn core(&self) -> &SourceCore;

    /// Issue one asynchronous pull. Callers must have won [`should_request`](Self::should_request).
    fn request(self: Arc<Self>);

    /// Idempotent. Must notify the producer side on the first call.
    fn close(&self);

    fn task_id(&self) -> &str {
        self.core().task_id()
    }

    fn destination(&self) -> usize {
        self.core().destination()
    }

    fn should_request(&self) -> bool {
        self.core().should_request()
    }

    fn is_at_end(&self) -> bool {
        self.core().is_at_end()
    }

    fn stats(&self) -> SourceStats {
        self.core().stats()
    }
}

pub trait ExchangeSourceFactory: Send + Sync {
    /// Locator prefix handled by this factory, e.g. `local://`.
    fn prefix(&self) -> &str;

    fn create(
        &self,
        locator: &str,
        destination: usize,
        buffer: &Arc<PageBuffer>,
    ) -> Result<Arc<dyn ExchangeSource>>;
}

/// Ordered factory list; the first factory whose prefix matches a locator wins.
#[derive(Clone)]
pub struct ExchangeSourceRegistry {
    factories: Vec<Arc<dyn ExchangeSourceFactory>>,
}

impl ExchangeSourceRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    pub fn register_factory(&mut self, factory: Arc<dyn ExchangeSourceFactory>) {
        self.factories.push(factory);
    }

    pub fn resolve(
        &self,
        locator: &str,
        destination: usize,
        buffer: &Arc<PageBuffer>,
    ) -> Result<Arc<dyn ExchangeSource>> {
        let Some(factory) = self
            .factories
            .iter()
            .find(|f| locator.starts_with(f.prefix()))
        else {
            return Err(Error::UnresolvableLocator(locator.to_string()));
        };
        factory.create(locator, destination, buffer)
    }
}

impl Default for ExchangeSourceRegistry {
    fn default() -> Self {
        let mut reg = ExchangeSourceRegistry::new();
        reg.register_factory(Arc::new(LocalExchangeSourceFactory));
        reg
    }
}

impl fmt::Debug for ExchangeSourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefixes: Vec<_> = self.factories.iter().map(|f| f.prefix()).collect();
        f.debug_struct("ExchangeSourceRegistry")
            .field("prefixes", &prefixes)
            .finish()
    }
}

static GLOBAL_SOURCE_REGISTRY: OnceLock<RwLock<ExchangeSourceRegistry>> = OnceLock::new();

fn global_source_registry() -> &'static RwLock<ExchangeSourceRegistry> {
    GLOBAL_SOURCE_REGISTRY.get_or_init(|| RwLock::new(ExchangeSourceRegistry::default()))
}

/// Snapshot of the process-wide registry.
pub fn exchange_source_registry() -> ExchangeSourceRegistry {
    global_source_registry()
        .read()
        .expect("exchange source registry lock")
        .clone()
}

/// Append a factory to the process-wide registry. Built-in prefixes keep precedence.
pub fn register_exchange_source_factory(factory: Arc<dyn ExchangeSourceFactory>) {
    global_source_registry()
        .write()
        .expect("exchange source registry lock")
        .register_factory(factory);
}
