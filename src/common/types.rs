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
use std::fmt;

use rand::Rng;

/// 128-bit id of a query or fragment instance, rendered like a Java UUID.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

pub fn format_uuid(hi: i64, lo: i64) -> String {
    let hi = hi as u64;
    let lo = lo as u64;
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (hi >> 32) as u32,
        (hi >> 16) as u16,
        hi as u16,
        (lo >> 48) as u16,
        lo & 0x0000_FFFF_FFFF_FFFF
    )
}

impl UniqueId {
    pub fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    /// Fresh random id for instances the caller did not name.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            hi: rng.r#gen(),
            lo: rng.r#gen(),
        }
    }

    pub fn to_uuid_string(self) -> String {
        format_uuid(self.hi, self.lo)
    }

    /// Compact form used inside file names.
    pub fn to_file_token(self) -> String {
        format!("{:x}_{:x}", self.hi as u64, self.lo as u64)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_uuid(self.hi, self.lo))
    }
}
