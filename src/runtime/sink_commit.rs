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
//! Per-task record of what a table writer published, collected by the coordinator.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::common::types::UniqueId;
use crate::connector::write_protocol::CommittedFile;

struct SinkCommitStore {
    mu: Mutex<HashMap<UniqueId, SinkCommitEntry>>,
}

#[derive(Default)]
struct SinkCommitEntry {
    committed_files: Vec<CommittedFile>,
    loaded_rows: i64,
    loaded_bytes: i64,
}

static STORE: OnceLock<SinkCommitStore> = OnceLock::new();

fn store() -> &'static SinkCommitStore {
    STORE.get_or_init(|| SinkCommitStore {
        mu: Mutex::new(HashMap::new()),
    })
}

pub fn register(task_id: UniqueId) {
    let store = store();
    let mut guard = store.mu.lock().expect("sink commit store lock");
    guard.entry(task_id).or_default();
}

pub fn unregister(task_id: UniqueId) {
    let store = store();
    let mut guard = store.mu.lock().expect("sink commit store lock");
    guard.remove(&task_id);
}

/// Files already recorded for the same target path are skipped.
pub fn add_committed_files(task_id: UniqueId, files: &[CommittedFile]) {
    let store = store();
    let mut guard = store.mu.lock().expect("sink commit store lock");
    let entry = guard.entry(task_id).or_default();
    for file in files {
        let already_exists = entry
            .committed_files
            .iter()
            .any(|current| current.path == file.path);
        if !already_exists {
            entry.committed_files.push(file.clone());
        }
    }
}

pub fn list_committed_files(task_id: UniqueId) -> Vec<CommittedFile> {
    let store = store();
    let guard = store.mu.lock().expect("sink commit store lock");
    guard
        .get(&task_id)
        .map(|entry| entry.committed_files.clone())
        .unwrap_or_default()
}

pub fn add_load_counters(task_id: UniqueId, loaded_rows: i64, loaded_bytes: i64) {
    let store = store();
    let mut guard = store.mu.lock().expect("sink commit store lock");
    let entry = guard.entry(task_id).or_default();
    entry.loaded_rows = entry.loaded_rows.saturating_add(loaded_rows.max(0));
    entry.loaded_bytes = entry.loaded_bytes.saturating_add(loaded_bytes.max(0));
}

pub fn get_load_counters(task_id: UniqueId) -> (i64, i64) {
    let store = store();
    let guard = store.mu.lock().expect("sink commit store lock");
    guard
        .get(&task_id)
        .map(|entry| (entry.loaded_rows, entry.loaded_bytes))
        .unwrap_or((0, 0))
}
