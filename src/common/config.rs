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
use std::time::Duration;

use crate::novarocks_config::config as dataplane_config;

pub(crate) fn exchange_high_water_mark_bytes() -> usize {
    dataplane_config()
        .ok()
        .map(|c| c.exchange.high_water_mark_bytes)
        .unwrap_or(32 * 1024 * 1024)
}

pub(crate) fn exchange_max_request_bytes() -> usize {
    dataplane_config()
        .ok()
        .map(|c| c.exchange.max_request_bytes)
        .unwrap_or(1024 * 1024)
}

pub(crate) fn exchange_request_wait() -> Duration {
    let ms = dataplane_config()
        .ok()
        .map(|c| c.exchange.request_wait_ms)
        .unwrap_or(200);
    Duration::from_millis(ms)
}

pub(crate) fn exchange_io_threads() -> usize {
    dataplane_config()
        .ok()
        .map(|c| c.exchange.io_threads)
        .unwrap_or(4)
}

pub(crate) fn writer_max_rows_per_file() -> usize {
    dataplane_config()
        .ok()
        .map(|c| c.writer.max_rows_per_file)
        .unwrap_or(0)
}

pub(crate) fn writer_compression() -> String {
    dataplane_config()
        .ok()
        .map(|c| c.writer.compression.clone())
        .unwrap_or_else(|| "snappy".to_string())
}
