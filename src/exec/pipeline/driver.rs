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
//! Pipeline driver: pulls chunks from a source iterator and moves them through a chain
//! of processor operators.
//!
//! ```text
//! Ready ─ run() ─► Running ─┬─ source drained, operators finished ─► Finished
//!                           ├─ canceled ───────────────────────────► Canceled
//!                           └─ fatal error ────────────────────────► Failed(err)
//! ```

use std::time::Instant;

use crate::common::error::{Error, Result};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::novarocks_logging::{debug, error};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverState {
    Ready,
    Running,
    Finished,
    Canceled,
    Failed(String),
}

/// Upstream of a pipeline, e.g. an exchange scan.
pub type ChunkSource = Box<dyn Iterator<Item = Result<Chunk>> + Send>;

pub struct PipelineDriver {
    driver_id: i32,
    source: Option<ChunkSource>,
    operators: Vec<Box<dyn Operator>>,
    state: DriverState,
    output: Vec<Chunk>,
    closed: bool,
}

impl PipelineDriver {
    pub fn new(driver_id: i32, source: ChunkSource, operators: Vec<Box<dyn Operator>>) -> Self {
        Self {
            driver_id,
            source: Some(source),
            operators,
            state: DriverState::Ready,
            output: Vec::new(),
            closed: false,
        }
    }

    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    /// Runs to completion and returns the chunks emitted by the last operator.
    pub fn run(&mut self) -> Result<Vec<Chunk>> {
        if self.state != DriverState::Ready {
            return Err(Error::InvalidPlan(format!(
                "driver {} already ran: {:?}",
                self.driver_id, self.state
            )));
        }
        let start = Instant::now();
        self.state = DriverState::Running;
        match self.run_inner() {
            Ok(()) => {
                self.finish_with_state(DriverState::Finished);
                debug!(
                    "Driver run: driver_id={} elapsed={:?}",
                    self.driver_id,
                    start.elapsed()
                );
                Ok(std::mem::take(&mut self.output))
            }
            Err(err) => {
                let state = match err {
                    Error::Cancelled => DriverState::Canceled,
                    ref other => DriverState::Failed(other.to_string()),
                };
                self.finish_with_state(state);
                Err(err)
            }
        }
    }

    pub fn cancel(&mut self) {
        if matches!(self.state, DriverState::Ready | DriverState::Running) {
            self.finish_with_state(DriverState::Canceled);
        }
    }

    fn run_inner(&mut self) -> Result<()> {
        for op in self.operators.iter_mut() {
            op.prepare()?;
        }
        if let Some(mut source) = self.source.take() {
            for item in source.by_ref() {
                let chunk = item?;
                if chunk.is_empty() {
                    continue;
                }
                self.push_through(0, chunk)?;
            }
        }
        for idx in 0..self.operators.len() {
            self.processor_mut(idx)?.set_finishing()?;
            self.drain_from(idx)?;
        }
        Ok(())
    }

    fn processor_mut(&mut self, idx: usize) -> Result<&mut dyn ProcessorOperator> {
        let op = &mut self.operators[idx];
        let name = op.name().to_string();
        op.as_processor_mut()
            .ok_or_else(|| Error::InvalidPlan(format!("operator {name} is not a processor")))
    }

    fn push_through(&mut self, idx: usize, chunk: Chunk) -> Result<()> {
        if idx == self.operators.len() {
            self.output.push(chunk);
            return Ok(());
        }
        let proc = self.processor_mut(idx)?;
        if !proc.need_input() {
            return Err(Error::InvalidPlan(format!(
                "operator {} does not accept input",
                proc.name()
            )));
        }
        proc.push_chunk(chunk)?;
        self.drain_from(idx)
    }

    fn drain_from(&mut self, idx: usize) -> Result<()> {
        loop {
            let next = {
                let proc = self.processor_mut(idx)?;
                if !proc.has_output() {
                    return Ok(());
                }
                proc.pull_chunk()?
            };
            match next {
                Some(chunk) => self.push_through(idx + 1, chunk)?,
                None => return Ok(()),
            }
        }
    }

    fn finish_with_state(&mut self, state: DriverState) {
        if matches!(state, DriverState::Canceled | DriverState::Failed(_)) {
            for op in self.operators.iter_mut() {
                op.cancel();
            }
        }
        let last_op = self
            .operators
            .last()
            .map(|op| op.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match &state {
            DriverState::Finished => {
                debug!(
                    "Driver finished: driver_id={} last_op={}",
                    self.driver_id, last_op
                );
            }
            DriverState::Canceled => {
                debug!("Driver canceled: driver_id={}", self.driver_id);
            }
            DriverState::Failed(err) => {
                error!("Driver failed: driver_id={} error={}", self.driver_id, err);
            }
            _ => {}
        }
        self.source = None;
        self.close_operators();
        self.state = state;
    }

    fn close_operators(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for op in self.operators.iter_mut().rev() {
            if let Err(err) = op.close() {
                error!("operator close failed: {}: {}", op.name(), err);
            }
        }
    }
}
