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

//! A thin client for the Cloud SQL admin surface, attaching a fresh bearer
//! token (re-read from the [`TokenSource`] on every call, never cached here)
//! to each outbound request.

use crate::credentials::TokenSource;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ADMIN_BASE_URL: &str = "https://sqladmin.googleapis.com/sql/v1beta4";

#[derive(Serialize)]
struct GenerateEphemeralCertRequest {
    public_key: String,
}

#[derive(Deserialize)]
struct GenerateEphemeralCertResponse {
    #[serde(rename = "ephemeralCert")]
    ephemeral_cert: EphemeralCert,
}

#[derive(Deserialize)]
struct EphemeralCert {
    cert: String,
}

/// The instance metadata needed to dial an instance over mTLS.
#[derive(Clone, Debug)]
pub struct ConnectSettings {
    pub ip_address: String,
    pub server_ca_cert_pem: String,
}

#[derive(Deserialize)]
struct InstanceResponse {
    #[serde(rename = "ipAddresses")]
    ip_addresses: Vec<IpMapping>,
    #[serde(rename = "serverCaCert")]
    server_ca_cert: ServerCaCert,
}

#[derive(Deserialize)]
struct IpMapping {
    #[serde(rename = "ipAddress")]
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct ServerCaCert {
    cert: String,
}

/// A client for the `connect.generateEphemeralCert` and `instances.get`
/// admin API surfaces this crate needs. Unlike the cert manager, retry
/// policy is applied by the caller (see [`crate::retry`]), so this client
/// stays a pure request/response mapping.
pub struct AdminApiClient {
    http: reqwest::Client,
    token_source: Arc<dyn TokenSource>,
    base_url: String,
}

impl AdminApiClient {
    pub fn new(token_source: Arc<dyn TokenSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_source,
            base_url: ADMIN_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(token_source: Arc<dyn TokenSource>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_source,
            base_url: base_url.into(),
        }
    }

    async fn bearer_token(&self) -> Result<String> {
        Ok(self.token_source.get_token().await?.token)
    }

    /// Issues an ephemeral client certificate signed against `public_key_pem`
    /// (the SPKI PEM of the caller's RSA key). Returns the PEM-encoded
    /// certificate.
    pub async fn generate_ephemeral_cert(
        &self,
        project: &str,
        region_tilde_name: &str,
        public_key_pem: &str,
    ) -> Result<String> {
        let token = self.bearer_token().await?;
        let url = format!(
            "{}/projects/{project}/instances/{region_tilde_name}:generateEphemeralCert",
            self.base_url
        );
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&GenerateEphemeralCertRequest {
                public_key: public_key_pem.to_string(),
            })
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            return Err(Error::admin_api(
                status.as_u16(),
                "generateEphemeralCert failed",
            ));
        }
        let body: GenerateEphemeralCertResponse = res.json().await?;
        Ok(body.ephemeral_cert.cert)
    }

    /// Fetches the instance's public IP address and server CA certificate.
    pub async fn get_connect_settings(&self, project: &str, name: &str) -> Result<ConnectSettings> {
        let token = self.bearer_token().await?;
        let url = format!("{}/projects/{project}/instances/{name}", self.base_url);
        let res = self.http.get(url).bearer_auth(token).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(Error::admin_api(status.as_u16(), "instances.get failed"));
        }
        let body: InstanceResponse = res.json().await?;
        let ip_address = body
            .ip_addresses
            .into_iter()
            .find(|ip| ip.kind == "PRIMARY")
            .map(|ip| ip.ip_address)
            .ok_or_else(|| Error::config("instance has no PRIMARY ip address"))?;
        Ok(ConnectSettings {
            ip_address,
            server_ca_cert_pem: body.server_ca_cert.cert,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::AccessToken;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FakeTokenSource;

    #[async_trait]
    impl TokenSource for FakeTokenSource {
        async fn get_token(&self) -> Result<AccessToken> {
            Ok(AccessToken::new("fake", Utc::now() + chrono::Duration::hours(1)))
        }
    }

    #[tokio::test]
    async fn bearer_token_is_read_from_source_each_call() {
        let client = AdminApiClient::new(Arc::new(FakeTokenSource));
        assert_eq!(client.bearer_token().await.unwrap(), "fake");
        assert_eq!(client.bearer_token().await.unwrap(), "fake");
    }
}
