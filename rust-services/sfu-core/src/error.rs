//! Error types for the SFU core
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


use crate::handle::PeerHandle;
use crate::session::SessionState;
use thiserror::Error;

/// Result type for SFU core operations
pub type SfuResult<T> = Result<T, SfuError>;

/// Errors reported to the host glue layer
///
/// None of these is fatal to the process; media-plane problems never reach
/// this type at all and are dropped inside the session instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfuError {
    /// No session is registered for the handle
    #[error("Session not found: {handle}")]
    NotFound { handle: PeerHandle },

    /// A session is already registered for the handle
    #[error("Session already exists: {handle}")]
    Conflict { handle: PeerHandle },

    /// The session cannot make the requested move from its current state
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: SessionState, to: SessionState },

    /// Token validation failed or the session has not joined
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Signaling or admin payload could not be understood
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The host port refused a call
    #[error("Port error: {0}")]
    Port(String),
}

impl SfuError {
    /// Numeric code carried in signaling error replies
    pub fn code(&self) -> u16 {
        match self {
            SfuError::InvalidMessage(_) => 400,
            SfuError::Unauthorized(_) => 403,
            SfuError::NotFound { .. } => 404,
            SfuError::Conflict { .. } => 409,
            SfuError::InvalidStateTransition { .. } => 422,
            SfuError::Port(_) => 502,
        }
    }
}

impl From<serde_json::Error> for SfuError {
    fn from(err: serde_json::Error) -> Self {
        SfuError::InvalidMessage(err.to_string())
    }
}
