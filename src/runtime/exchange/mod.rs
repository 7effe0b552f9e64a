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
//! Pull-based exchange: pages flow from upstream task outputs, through one
//! [`ExchangeSource`] per upstream task, into a shared [`PageBuffer`] drained by the
//! consuming task's [`ExchangeClient`].

pub mod client;
pub mod local;
pub mod page;
pub mod page_buffer;
pub mod source;

pub use client::{ExchangeClient, ExchangeClientStats};
pub use page::Page;
pub use page_buffer::{EnqueueOutcome, PageBuffer, PageBufferStats, PagePopResult, ProducerId};
pub use source::{
    ExchangeSource, ExchangeSourceFactory, ExchangeSourceRegistry, SourceCore, SourceStats,
    exchange_source_registry, register_exchange_source_factory,
};
