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

//! Workload-identity federation: exchange a caller-supplied OIDC JWT for a
//! Google access token via STS, with an optional service-account
//! impersonation hop.

use crate::credentials::TokenSource;
use crate::error::{Error, Result};
use crate::token::{AccessToken, DEFAULT_SKEW};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const STS_ENDPOINT: &str = "https://sts.googleapis.com/v1/token";
const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// A producer of the OIDC identity token this crate exchanges at STS. Hosts
/// plug in their own OIDC provider (e.g. a Kubernetes projected service
/// account token, or a CI provider's identity token).
#[async_trait]
pub trait OidcIdTokenProvider: Send + Sync {
    async fn get_oidc_id_token(&self) -> Result<String>;
}

#[derive(Deserialize)]
struct StsTokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Serialize)]
struct GenerateAccessTokenRequest {
    scope: Vec<String>,
}

#[derive(Deserialize)]
struct GenerateAccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: DateTime<Utc>,
}

/// A [`TokenSource`] that mints Google access tokens from an external OIDC
/// identity, without a long-lived service-account key. Grounded on the
/// teacher's `STSHandler` for the STS exchange request shape, generalized
/// with an optional impersonation hop and a single-flight refresh cache.
pub struct WorkloadIdentitySource {
    oidc_provider: Box<dyn OidcIdTokenProvider>,
    audience: String,
    service_account_email: Option<String>,
    client: reqwest::Client,
    cached: Arc<Mutex<AccessToken>>,
}

impl WorkloadIdentitySource {
    pub fn new(
        oidc_provider: Box<dyn OidcIdTokenProvider>,
        audience: impl Into<String>,
        service_account_email: Option<String>,
    ) -> Self {
        Self {
            oidc_provider,
            audience: audience.into(),
            service_account_email,
            client: reqwest::Client::new(),
            cached: Arc::new(Mutex::new(AccessToken::never_valid())),
        }
    }

    async fn exchange_sts(&self, jwt: &str) -> Result<AccessToken> {
        let mut params: HashMap<&str, &str> = HashMap::new();
        params.insert("grant_type", TOKEN_EXCHANGE_GRANT_TYPE);
        params.insert("requested_token_type", ACCESS_TOKEN_TYPE);
        params.insert("subject_token_type", JWT_TOKEN_TYPE);
        params.insert("subject_token", jwt);
        params.insert("audience", &self.audience);
        params.insert("scope", CLOUD_PLATFORM_SCOPE);

        let res = self.client.post(STS_ENDPOINT).form(&params).send().await?;
        if !res.status().is_success() {
            return Err(Error::token(format!(
                "sts token exchange failed with status {}",
                res.status()
            )));
        }
        let body: StsTokenResponse = res.json().await?;
        Ok(AccessToken::new(
            body.access_token,
            Utc::now() + chrono::Duration::seconds(body.expires_in),
        ))
    }

    async fn impersonate(&self, email: &str, sts_token: &AccessToken) -> Result<AccessToken> {
        let url = format!(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{email}:generateAccessToken"
        );
        let res = self
            .client
            .post(&url)
            .bearer_auth(&sts_token.token)
            .json(&GenerateAccessTokenRequest {
                scope: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            })
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Error::token(format!(
                "service account impersonation failed with status {}",
                res.status()
            )));
        }
        let body: GenerateAccessTokenResponse = res.json().await?;
        Ok(AccessToken::new(body.access_token, body.expire_time))
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        let jwt = self.oidc_provider.get_oidc_id_token().await?;
        if jwt.is_empty() {
            return Err(Error::token("OIDC provider returned an empty id token"));
        }
        let sts_token = self.exchange_sts(&jwt).await?;
        match &self.service_account_email {
            Some(email) => self.impersonate(email, &sts_token).await,
            None => Ok(sts_token),
        }
    }
}

#[async_trait]
impl TokenSource for WorkloadIdentitySource {
    async fn get_token(&self) -> Result<AccessToken> {
        let mut cached = self.cached.lock().await;
        if !cached.is_expired(DEFAULT_SKEW) {
            return Ok(cached.clone());
        }
        let fresh = self.fetch_token().await?;
        *cached = fresh.clone();
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeOidcProvider {
        calls: AtomicU32,
        token: String,
    }

    #[async_trait]
    impl OidcIdTokenProvider for FakeOidcProvider {
        async fn get_oidc_id_token(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.clone())
        }
    }

    struct EmptyOidcProvider;

    #[async_trait]
    impl OidcIdTokenProvider for EmptyOidcProvider {
        async fn get_oidc_id_token(&self) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn empty_oidc_token_fails_before_any_network_call() {
        let source = WorkloadIdentitySource::new(Box::new(EmptyOidcProvider), "my-audience", None);
        let err = source.fetch_token().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Token);
    }

    #[tokio::test]
    async fn cached_token_short_circuits_fetch() {
        let source = WorkloadIdentitySource::new(
            Box::new(FakeOidcProvider {
                calls: AtomicU32::new(0),
                token: "jwt".into(),
            }),
            "my-audience",
            None,
        );
        *source.cached.lock().await =
            AccessToken::new("still-good", Utc::now() + chrono::Duration::hours(1));
        let tok = source.get_token().await.unwrap();
        assert_eq!(tok.token, "still-good");
    }
}
