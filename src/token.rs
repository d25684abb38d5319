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

//! [`AccessToken`] and its clock-skew-aware expiry check.

use chrono::{DateTime, Duration, Utc};

/// The default skew subtracted from a token's `expires_at` before treating it
/// as expired.
pub const DEFAULT_SKEW: Duration = Duration::minutes(5);

/// An OAuth2 bearer token usable in `Authorization: Bearer <token>` headers.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// A token that is always expired, used as a placeholder before the
    /// first successful fetch.
    pub fn never_valid() -> Self {
        Self {
            token: String::new(),
            expires_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        }
    }

    /// True when `now >= expires_at - skew`.
    pub fn is_expired(&self, skew: Duration) -> bool {
        Utc::now() >= self.expires_at - skew
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_valid_is_always_expired() {
        assert!(AccessToken::never_valid().is_expired(DEFAULT_SKEW));
        assert!(AccessToken::never_valid().is_expired(Duration::zero()));
    }

    #[test]
    fn expiry_respects_skew() {
        let almost_now = Utc::now() + Duration::minutes(4);
        let tok = AccessToken::new("tok", almost_now);
        assert!(tok.is_expired(DEFAULT_SKEW));
        assert!(!tok.is_expired(Duration::minutes(1)));
    }

    #[test]
    fn fresh_token_is_not_expired() {
        let later = Utc::now() + Duration::hours(1);
        let tok = AccessToken::new("tok", later);
        assert!(!tok.is_expired(DEFAULT_SKEW));
    }
}
