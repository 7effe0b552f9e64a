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
//! Error taxonomy shared by the exchange and write paths.
//!
//! Configuration errors (unregistered commit strategy, unresolvable locator) are hard,
//! user-visible failures. Transport failures surface to the consumer through the page
//! buffer. Write failures abort the write before commit.

use std::io;

use thiserror::Error;

use crate::connector::write_protocol::CommitStrategy;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No write protocol found for commit strategy {0}")]
    UnregisteredCommitStrategy(CommitStrategy),

    #[error("no exchange source factory matches locator {0}")]
    UnresolvableLocator(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Enqueue after the stream was marked finished or failed.
    #[error("stream closed: {0}")]
    StreamClosed(String),

    #[error("exchange transport failure: {0}")]
    TransportFailure(String),

    #[error("exchange cancelled")]
    Cancelled,

    #[error("table write failed: {0}")]
    WriteFailure(String),

    #[error("commit failed: {0}")]
    CommitFailure(String),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors caused by how the process or plan was set up rather than by data.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::UnregisteredCommitStrategy(_)
                | Error::UnresolvableLocator(_)
                | Error::InvalidPlan(_)
                | Error::Config(_)
        )
    }

    /// Retry policy belongs to transports; nothing surfaced by this crate is retried.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
