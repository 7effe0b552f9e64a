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
//! Commit protocols for table writes.
//!
//! A writer asks its protocol where each output file should be written, then hands the
//! finished file set to `commit`, which makes the files visible at their final paths.
//! Protocols are looked up by [`CommitStrategy`] in a [`WriteProtocolRegistry`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};

use crate::common::error::{Error, Result};
use crate::novarocks_logging::{debug, info, warn};

/// File-name prefix marking a staged, not yet committed file.
pub const STAGING_FILE_PREFIX: &str = ".";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum CommitStrategy {
    /// Files are written at their final paths and are visible immediately.
    NoCommit,
    /// Files are staged under hidden names and published when the task commits.
    TaskCommit,
}

impl CommitStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitStrategy::NoCommit => "NO_COMMIT",
            CommitStrategy::TaskCommit => "TASK_COMMIT",
        }
    }
}

impl fmt::Display for CommitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NO_COMMIT" => Ok(CommitStrategy::NoCommit),
            "TASK_COMMIT" => Ok(CommitStrategy::TaskCommit),
            other => Err(Error::InvalidPlan(format!("unknown commit strategy {other}"))),
        }
    }
}

/// One file produced by a writer, before commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteFile {
    pub write_path: PathBuf,
    pub target_path: PathBuf,
    /// `col=value/...` relative to the table location; empty when unpartitioned.
    pub partition_path: String,
    pub row_count: u64,
    pub byte_size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct WriteFileSet {
    files: Vec<WriteFile>,
}

impl WriteFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, file: WriteFile) {
        self.files.push(file);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_rows(&self) -> u64 {
        self.files.iter().map(|f| f.row_count).sum()
    }

    pub fn files(&self) -> &[WriteFile] {
        &self.files
    }

    pub fn into_files(self) -> Vec<WriteFile> {
        self.files
    }
}

impl FromIterator<WriteFile> for WriteFileSet {
    fn from_iter<I: IntoIterator<Item = WriteFile>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// A file visible at its final path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedFile {
    pub path: PathBuf,
    pub partition_path: String,
    pub row_count: u64,
    pub byte_size: u64,
}

impl CommittedFile {
    fn at_target(file: &WriteFile) -> Self {
        Self {
            path: file.target_path.clone(),
            partition_path: file.partition_path.clone(),
            row_count: file.row_count,
            byte_size: file.byte_size,
        }
    }
}

pub trait WriteProtocol: Send + Sync + fmt::Debug {
    fn commit_strategy(&self) -> CommitStrategy;

    /// Where a file destined for `target` is written before commit.
    fn write_path(&self, target: &Path) -> PathBuf;

    fn commit(&self, files: WriteFileSet) -> Result<Vec<CommittedFile>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoCommitWriteProtocol;

impl NoCommitWriteProtocol {
    /// Install into the process-wide registry.
    pub fn register_protocol() {
        write_protocol_registry()
            .register_protocol(CommitStrategy::NoCommit, Arc::new(NoCommitWriteProtocol));
    }
}

impl WriteProtocol for NoCommitWriteProtocol {
    fn commit_strategy(&self) -> CommitStrategy {
        CommitStrategy::NoCommit
    }

    fn write_path(&self, target: &Path) -> PathBuf {
        target.to_path_buf()
    }

    fn commit(&self, files: WriteFileSet) -> Result<Vec<CommittedFile>> {
        Ok(files.files().iter().map(CommittedFile::at_target).collect())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TaskCommitWriteProtocol;

impl TaskCommitWriteProtocol {
    /// Install into the process-wide registry.
    pub fn register_protocol() {
        write_protocol_registry()
            .register_protocol(CommitStrategy::TaskCommit, Arc::new(TaskCommitWriteProtocol));
    }

    fn rollback(renamed: &[&WriteFile]) {
        for file in renamed.iter().rev() {
            if let Err(e) = fs::rename(&file.target_path, &file.write_path) {
                warn!(
                    "task commit rollback failed: target={} staged={} error={}",
                    file.target_path.display(),
                    file.write_path.display(),
                    e
                );
            }
        }
    }
}

impl WriteProtocol for TaskCommitWriteProtocol {
    fn commit_strategy(&self) -> CommitStrategy {
        CommitStrategy::TaskCommit
    }

    fn write_path(&self, target: &Path) -> PathBuf {
        match target.file_name() {
            Some(name) => {
                let mut staged = OsString::from(STAGING_FILE_PREFIX);
                staged.push(name);
                target.with_file_name(staged)
            }
            None => target.to_path_buf(),
        }
    }

    fn commit(&self, files: WriteFileSet) -> Result<Vec<CommittedFile>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let mut renamed: Vec<&WriteFile> = Vec::with_capacity(files.len());
        for file in files.files() {
            if file.write_path == file.target_path {
                continue;
            }
            // Publishing never replaces a file another write already committed.
            if fs::symlink_metadata(&file.target_path).is_ok() {
                Self::rollback(&renamed);
                return Err(Error::CommitFailure(format!(
                    "commit target {} already exists",
                    file.target_path.display()
                )));
            }
            if let Err(e) = fs::rename(&file.write_path, &file.target_path) {
                Self::rollback(&renamed);
                return Err(Error::CommitFailure(format!(
                    "rename {} -> {} failed: {e}",
                    file.write_path.display(),
                    file.target_path.display()
                )));
            }
            debug!(
                "task commit renamed: {} -> {}",
                file.write_path.display(),
                file.target_path.display()
            );
            renamed.push(file);
        }
        info!(
            "task commit published files={} rows={}",
            files.len(),
            files.total_rows()
        );
        Ok(files.files().iter().map(CommittedFile::at_target).collect())
    }
}

/// `CommitStrategy -> WriteProtocol` map. Registration overwrites.
pub struct WriteProtocolRegistry {
    protocols: RwLock<HashMap<CommitStrategy, Arc<dyn WriteProtocol>>>,
}

impl WriteProtocolRegistry {
    pub fn new() -> Self {
        Self {
            protocols: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding the built-in protocol for every strategy.
    pub fn with_builtin_protocols() -> Self {
        let registry = Self::new();
        registry.register_protocol(CommitStrategy::NoCommit, Arc::new(NoCommitWriteProtocol));
        registry.register_protocol(CommitStrategy::TaskCommit, Arc::new(TaskCommitWriteProtocol));
        registry
    }

    /// Returns the protocol previously registered for `strategy`.
    pub fn register_protocol(
        &self,
        strategy: CommitStrategy,
        protocol: Arc<dyn WriteProtocol>,
    ) -> Option<Arc<dyn WriteProtocol>> {
        let mut guard = self.protocols.write().expect("write protocol registry lock");
        guard.insert(strategy, protocol)
    }

    pub fn protocol_for(&self, strategy: CommitStrategy) -> Result<Arc<dyn WriteProtocol>> {
        let guard = self.protocols.read().expect("write protocol registry lock");
        guard
            .get(&strategy)
            .cloned()
            .ok_or(Error::UnregisteredCommitStrategy(strategy))
    }

    pub fn unregister_protocol(&self, strategy: CommitStrategy) -> Option<Arc<dyn WriteProtocol>> {
        let mut guard = self.protocols.write().expect("write protocol registry lock");
        guard.remove(&strategy)
    }

    pub fn registered_strategies(&self) -> Vec<CommitStrategy> {
        let guard = self.protocols.read().expect("write protocol registry lock");
        let mut strategies: Vec<_> = guard.keys().copied().collect();
        strategies.sort();
        strategies
    }
}

impl Default for WriteProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WriteProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteProtocolRegistry")
            .field("strategies", &self.registered_strategies())
            .finish()
    }
}

static WRITE_PROTOCOL_REGISTRY: OnceLock<Arc<WriteProtocolRegistry>> = OnceLock::new();

/// Process-wide registry; starts empty until protocols register themselves.
pub fn write_protocol_registry() -> Arc<WriteProtocolRegistry> {
    Arc::clone(WRITE_PROTOCOL_REGISTRY.get_or_init(|| Arc::new(WriteProtocolRegistry::new())))
}
