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
//! Core operator traits.
//!
//! Operators are driven by a [`PipelineDriver`](crate::exec::pipeline::driver::PipelineDriver)
//! which moves chunks from the pipeline source through each processor in order.

use crate::common::error::Result;
use crate::exec::chunk::Chunk;

/// Base operator contract.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancel(&mut self) {
        // Default: nothing to cancel.
    }

    fn is_finished(&self) -> bool {
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        None
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        None
    }
}

/// Processor stage with push/pull semantics.
pub trait ProcessorOperator: Operator {
    fn need_input(&self) -> bool;

    fn has_output(&self) -> bool;

    fn push_chunk(&mut self, chunk: Chunk) -> Result<()>;

    fn pull_chunk(&mut self) -> Result<Option<Chunk>>;

    /// No more input will arrive; buffered work must be completed.
    fn set_finishing(&mut self) -> Result<()>;
}
