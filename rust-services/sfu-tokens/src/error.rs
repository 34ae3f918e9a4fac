//! Error types for token validation
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


use thiserror::Error;

/// Token validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired at {expired_at}")]
    Expired { expired_at: i64 },

    #[error("Token realm mismatch: expected {expected}, found {found}")]
    RealmMismatch { expected: String, found: String },

    #[error("Token does not grant descriptor: {0}")]
    MissingDescriptor(String),

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

/// Result type for token operations
pub type TokenResult<T> = Result<T, TokenError>;
