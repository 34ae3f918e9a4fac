//! Token claim parsing
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


use crate::error::{TokenError, TokenResult};
use chrono::{DateTime, Utc};

/// Claims carried in the signed part of a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// Unix timestamp (seconds) after which the token is rejected
    pub expires_at: i64,
    /// Realm the token was minted for
    pub realm: String,
    /// Capabilities granted by the token
    pub descriptors: Vec<String>,
}

impl TokenClaims {
    pub fn new(expires_at: DateTime<Utc>, realm: impl Into<String>, descriptors: Vec<String>) -> Self {
        Self {
            expires_at: expires_at.timestamp(),
            realm: realm.into(),
            descriptors,
        }
    }

    /// Split a token into its claims and the hex signature
    pub fn parse(token: &str) -> TokenResult<(Self, &str, &str)> {
        let (data, signature) = token
            .rsplit_once(':')
            .ok_or_else(|| TokenError::Malformed("missing signature separator".to_string()))?;

        let mut parts = data.split(',');
        let expiry = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TokenError::Malformed("missing expiry".to_string()))?;
        let expires_at = expiry
            .parse::<i64>()
            .map_err(|_| TokenError::Malformed(format!("invalid expiry: {}", expiry)))?;
        let realm = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TokenError::Malformed("missing realm".to_string()))?;
        let descriptors = parts.map(str::to_string).collect();

        Ok((
            TokenClaims {
                expires_at,
                realm: realm.to_string(),
                descriptors,
            },
            data,
            signature,
        ))
    }

    /// Render the signed payload
    pub fn payload(&self) -> String {
        let mut payload = format!("{},{}", self.expires_at, self.realm);
        for descriptor in &self.descriptors {
            payload.push(',');
            payload.push_str(descriptor);
        }
        payload
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.expires_at
    }

    pub fn grants(&self, descriptor: &str) -> bool {
        self.descriptors.iter().any(|d| d == descriptor)
    }
}
