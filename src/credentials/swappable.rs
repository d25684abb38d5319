// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A [`TokenSource`] fed entirely by an external `update()` call, for hosts
//! that mint tokens outside this process.

use crate::credentials::TokenSource;
use crate::error::Result;
use crate::token::AccessToken;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Holds a single [`AccessToken`], replaced wholesale by [`Self::update`].
/// Expiry policy is entirely the caller's responsibility: `get_token` never
/// refreshes on its own.
pub struct SwappableTokenSource {
    current: RwLock<AccessToken>,
}

impl SwappableTokenSource {
    pub fn new(initial: AccessToken) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Atomically replaces the current token.
    pub async fn update(&self, next: AccessToken) {
        *self.current.write().await = next;
    }
}

#[async_trait]
impl TokenSource for SwappableTokenSource {
    async fn get_token(&self) -> Result<AccessToken> {
        Ok(self.current.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn returns_current_value_unconditionally() {
        let source = SwappableTokenSource::new(AccessToken::never_valid());
        let tok = source.get_token().await.unwrap();
        assert!(tok.token.is_empty());

        source
            .update(AccessToken::new("fresh", Utc::now() + chrono::Duration::hours(1)))
            .await;
        let tok = source.get_token().await.unwrap();
        assert_eq!(tok.token, "fresh");
    }

    #[tokio::test]
    async fn does_not_enforce_expiry_itself() {
        // Even an expired token is returned as-is; the caller owns the policy.
        let source = SwappableTokenSource::new(AccessToken::never_valid());
        let tok = source.get_token().await.unwrap();
        assert!(tok.is_expired(chrono::Duration::zero()));
    }
}
