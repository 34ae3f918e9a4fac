//! Signed access tokens for SFU signaling
//!
//! Tokens have the shape `expiry,realm,descriptor1,descriptor2:signature`
//! where `expiry` is a unix timestamp in seconds and `signature` is the hex
//! encoded HMAC-SHA256 of everything before the colon. A verifier only
//! accepts tokens minted for its own realm.
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


pub mod error;
pub mod claims;
pub mod signer;

pub use error::{TokenError, TokenResult};
pub use claims::TokenClaims;
pub use signer::{TokenSigner, TokenVerifier};
