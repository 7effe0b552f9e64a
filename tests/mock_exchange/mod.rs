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

//! Scriptable `mock://` exchange transport for exchange integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use novarocks_dataplane::common::error::Result;
use novarocks_dataplane::runtime::exchange::{
    ExchangeSource, ExchangeSourceFactory, Page, PageBuffer, SourceCore,
};

/// Scripted reply of the mock transport for one pull.
#[derive(Clone, Debug)]
pub enum MockReply {
    Pages(Vec<Page>),
    End,
    Fail(String),
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<MockReply>>,
    requests: HashMap<String, usize>,
    closed: Vec<String>,
    pending: Vec<Arc<MockExchangeSource>>,
}

/// In-memory transport behind `mock://` locators.
///
/// In immediate mode a pull is answered inside `request`; in deferred mode pulls are
/// parked until [`MockTransport::deliver_pending`].
#[derive(Default)]
pub struct MockTransport {
    deferred: bool,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn immediate() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deferred() -> Arc<Self> {
        Arc::new(Self {
            deferred: true,
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn script(&self, locator: &str, reply: MockReply) {
        let mut st = self.state.lock().expect("mock transport lock");
        st.scripts
            .entry(locator.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self, locator: &str) -> usize {
        let st = self.state.lock().expect("mock transport lock");
        st.requests.get(locator).copied().unwrap_or(0)
    }

    pub fn closed(&self) -> Vec<String> {
        self.state.lock().expect("mock transport lock").closed.clone()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().expect("mock transport lock").pending.len()
    }

    /// Answer every parked pull; returns how many were answered.
    pub fn deliver_pending(&self) -> usize {
        let pending = std::mem::take(&mut self.state.lock().expect("mock transport lock").pending);
        let count = pending.len();
        for source in pending {
            source.reply();
        }
        count
    }

    fn next_reply(&self, locator: &str) -> Option<MockReply> {
        let mut st = self.state.lock().expect("mock transport lock");
        st.scripts.get_mut(locator).and_then(VecDeque::pop_front)
    }
}

pub struct MockExchangeSource {
    core: SourceCore,
    transport: Arc<MockTransport>,
}

impl MockExchangeSource {
    fn reply(self: &Arc<Self>) {
        match self.transport.next_reply(self.core.task_id()) {
            None => self.core.clear_pending(),
            Some(MockReply::Pages(pages)) => {
                if let Err(err) = self.core.on_pages(pages) {
                    self.core.on_failure(err);
                    return;
                }
                if self.core.complete_request() {
                    Arc::clone(self).request();
                }
            }
            Some(MockReply::End) => self.core.on_end(),
            Some(MockReply::Fail(message)) => self.core.on_failure(message),
        }
    }
}

impl ExchangeSource for MockExchangeSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn request(self: Arc<Self>) {
        {
            let mut st = self.transport.state.lock().expect("mock transport lock");
            *st.requests
                .entry(self.core.task_id().to_string())
                .or_default() += 1;
            if self.transport.deferred {
                st.pending.push(Arc::clone(&self));
                return;
            }
        }
        self.reply();
    }

    fn close(&self) {
        if self.core.close() {
            let mut st = self.transport.state.lock().expect("mock transport lock");
            st.closed.push(self.core.task_id().to_string());
        }
    }
}

pub struct MockExchangeSourceFactory {
    transport: Arc<MockTransport>,
}

impl MockExchangeSourceFactory {
    pub fn new(transport: Arc<MockTransport>) -> Self {
        Self { transport }
    }
}

impl ExchangeSourceFactory for MockExchangeSourceFactory {
    fn prefix(&self) -> &str {
        "mock://"
    }

    fn create(
        &self,
        locator: &str,
        destination: usize,
        buffer: &Arc<PageBuffer>,
    ) -> Result<Arc<dyn ExchangeSource>> {
        Ok(Arc::new(MockExchangeSource {
            core: SourceCore::new(locator, destination, buffer)?,
            transport: Arc::clone(&self.transport),
        }))
    }
}
