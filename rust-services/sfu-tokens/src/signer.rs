//! Token minting and verification
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


use crate::claims::TokenClaims;
use crate::error::{TokenError, TokenResult};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8]) -> TokenResult<HmacSha256> {
    HmacSha256::new_from_slice(secret).map_err(|e| TokenError::InvalidKey(e.to_string()))
}

/// Mints tokens with a shared secret
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Mint a token for `realm` granting `descriptors` until `expires_at`
    pub fn sign(
        &self,
        realm: &str,
        expires_at: DateTime<Utc>,
        descriptors: &[&str],
    ) -> TokenResult<String> {
        let claims = TokenClaims::new(
            expires_at,
            realm,
            descriptors.iter().map(|d| d.to_string()).collect(),
        );
        let payload = claims.payload();

        let mut mac = mac_for(&self.secret)?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}:{}", payload, signature))
    }
}

/// Validates tokens for a single realm
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
    realm: String,
}

impl TokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>, realm: impl Into<String>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            realm: realm.into(),
        }
    }

    /// Check signature, realm and expiry
    pub fn verify(&self, token: &str) -> TokenResult<TokenClaims> {
        self.verify_at(token, Utc::now())
    }

    /// Same as [`verify`](Self::verify) against an explicit clock
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> TokenResult<TokenClaims> {
        let (claims, data, signature) = TokenClaims::parse(token)?;

        let signature = hex::decode(signature)
            .map_err(|_| TokenError::Malformed("signature is not hex".to_string()))?;
        let mut mac = mac_for(&self.secret)?;
        mac.update(data.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        if claims.realm != self.realm {
            return Err(TokenError::RealmMismatch {
                expected: self.realm.clone(),
                found: claims.realm,
            });
        }

        if claims.is_expired_at(now) {
            return Err(TokenError::Expired {
                expired_at: claims.expires_at,
            });
        }

        Ok(claims)
    }

    /// Check the token and that it grants `descriptor`
    pub fn verify_descriptor(&self, token: &str, descriptor: &str) -> TokenResult<TokenClaims> {
        let claims = self.verify(token)?;
        if !claims.grants(descriptor) {
            return Err(TokenError::MissingDescriptor(descriptor.to_string()));
        }
        Ok(claims)
    }

    /// Boolean form used by host ports
    pub fn is_valid(&self, token: &str) -> bool {
        match self.verify(token) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Token rejected");
                false
            }
        }
    }

    /// Boolean form of [`verify_descriptor`](Self::verify_descriptor)
    pub fn contains(&self, token: &str, descriptor: &str) -> bool {
        match self.verify_descriptor(token, descriptor) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, descriptor = descriptor, "Token rejected");
                false
            }
        }
    }
}
