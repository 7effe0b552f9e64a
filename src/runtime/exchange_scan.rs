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
use std::collections::VecDeque;
use std::time::Instant;

use crate::common::error::Result;
use crate::exec::chunk::Chunk;
use crate::novarocks_logging::debug;
use crate::runtime::exchange::ExchangeClient;

/// Chunk stream over an [`ExchangeClient`]. Dropping the scan before the end of stream
/// closes the client.
pub struct ExchangeScan {
    client: ExchangeClient,
    pending: VecDeque<Chunk>,
    start: Instant,
    completed: bool,
    errored: bool,
    seen_chunks: usize,
    seen_rows: usize,
}

impl ExchangeScan {
    pub fn new(client: ExchangeClient) -> Self {
        debug!(
            "ExchangeScan::new: destination={}",
            client.destination()
        );
        Self {
            client,
            pending: VecDeque::new(),
            start: Instant::now(),
            completed: false,
            errored: false,
            seen_chunks: 0,
            seen_rows: 0,
        }
    }

    pub fn client(&self) -> &ExchangeClient {
        &self.client
    }

    pub fn seen_rows(&self) -> usize {
        self.seen_rows
    }
}

impl Iterator for ExchangeScan {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                self.seen_chunks = self.seen_chunks.saturating_add(1);
                self.seen_rows = self.seen_rows.saturating_add(chunk.len());
                return Some(Ok(chunk));
            }
            if self.completed || self.errored {
                return None;
            }
            match self.client.next_chunks() {
                Ok(Some(chunks)) => self.pending.extend(chunks),
                Ok(None) => {
                    self.completed = true;
                    return None;
                }
                Err(e) => {
                    self.errored = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Drop for ExchangeScan {
    fn drop(&mut self) {
        if self.completed {
            debug!(
                "ExchangeScan completed: destination={} chunks={} rows={} elapsed={:?}",
                self.client.destination(),
                self.seen_chunks,
                self.seen_rows,
                self.start.elapsed()
            );
        } else if !self.errored {
            debug!(
                "ExchangeScan dropped early: destination={} seen_chunks={} seen_rows={}",
                self.client.destination(),
                self.seen_chunks,
                self.seen_rows
            );
        }
        self.client.close();
    }
}
