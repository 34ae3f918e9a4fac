//! Opaque peer identifiers
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one peer connection, issued by the host runtime
///
/// Hosts that key their connections by pointer hand over the address as an
/// integer; the core only compares and hashes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerHandle(u64);

impl PeerHandle {
    pub const fn new(raw: u64) -> Self {
        PeerHandle(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for PeerHandle {
    fn from(raw: u64) -> Self {
        PeerHandle(raw)
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
