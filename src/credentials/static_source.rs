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

//! A [`TokenSource`] backed by a service-account key file, following the
//! teacher's `ServiceAccountKeySource` JWT-bearer flow.

use crate::credentials::TokenSource;
use crate::error::{Error, ErrorKind, Result};
use crate::token::{AccessToken, DEFAULT_SKEW};
use async_trait::async_trait;
use chrono::Utc;
use rustls_pemfile::Item;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// The subset of a service-account key file this crate needs.
#[derive(Deserialize)]
struct ServiceAccountKeyFile {
    #[serde(rename = "type")]
    cred_type: String,
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Serialize)]
struct JwsHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Serialize)]
struct JwsClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Serialize)]
struct TokenRequest {
    grant_type: &'static str,
    assertion: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// A [`TokenSource`] constructed from a service-account key file (or its
/// inline JSON body), caching the resulting [`AccessToken`] until it expires.
pub struct StaticCredentialsSource {
    file: ServiceAccountKeyFile,
    scope: String,
    client: reqwest::Client,
    cached: Arc<Mutex<AccessToken>>,
}

impl StaticCredentialsSource {
    /// Loads a service-account key from `path`.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read(path).await?;
        Self::from_bytes(&contents)
    }

    /// Parses a service-account key from its inline JSON body.
    pub fn from_json(contents: &str) -> Result<Self> {
        Self::from_bytes(contents.as_bytes())
    }

    fn from_bytes(contents: &[u8]) -> Result<Self> {
        let file: ServiceAccountKeyFile = serde_json::from_slice(contents)?;
        if file.cred_type != "service_account" {
            return Err(Error::config(format!(
                "expected a service_account credential file, got type: {}",
                file.cred_type
            )));
        }
        Ok(Self {
            file,
            scope: DEFAULT_SCOPE.to_string(),
            client: reqwest::Client::new(),
            cached: Arc::new(Mutex::new(AccessToken::never_valid())),
        })
    }

    fn signer(&self) -> Result<Box<dyn rustls::sign::Signer>> {
        let mut key_bytes = self.file.private_key.as_bytes();
        let item = rustls_pemfile::read_one(&mut key_bytes)
            .map_err(|e| Error::wrap(ErrorKind::Configuration, "invalid private key PEM", e))?
            .ok_or_else(|| Error::config("private key file contained no PEM item"))?;
        let key_der = match item {
            Item::Pkcs1Key(k) => rustls_pki_types::PrivateKeyDer::Pkcs1(k),
            Item::Pkcs8Key(k) => rustls_pki_types::PrivateKeyDer::Pkcs8(k),
            _ => return Err(Error::config("expected an RSA private key")),
        };
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|_| Error::config("unable to build a signer from the private key"))?;
        signing_key
            .choose_scheme(&[rustls::SignatureScheme::RSA_PKCS1_SHA256])
            .ok_or_else(|| Error::config("private key does not support RSA PKCS1 SHA256"))
    }

    fn signed_assertion(&self) -> Result<String> {
        let signer = self.signer()?;
        let now = Utc::now();
        let header = JwsHeader {
            alg: "RS256",
            typ: "JWT",
        };
        let claims = JwsClaims {
            iss: &self.file.client_email,
            scope: &self.scope,
            aud: &self.file.token_uri,
            iat: now.timestamp(),
            exp: (now + chrono::Duration::hours(1)).timestamp(),
        };
        let encoded_header =
            base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, serde_json::to_vec(&header)?);
        let encoded_claims =
            base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, serde_json::to_vec(&claims)?);
        let signing_input = format!("{encoded_header}.{encoded_claims}");
        let signature = signer
            .sign(signing_input.as_bytes())
            .map_err(|_| Error::token("unable to sign JWT assertion"))?;
        let encoded_signature =
            base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, signature);
        Ok(format!("{signing_input}.{encoded_signature}"))
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        let assertion = self.signed_assertion()?;
        let res = self
            .client
            .post(&self.file.token_uri)
            .form(&TokenRequest {
                grant_type: JWT_BEARER_GRANT,
                assertion,
            })
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Error::token(format!(
                "token exchange failed with status {}",
                res.status()
            )));
        }
        let body: TokenResponse = res.json().await?;
        Ok(AccessToken::new(
            body.access_token,
            Utc::now() + chrono::Duration::seconds(body.expires_in),
        ))
    }
}

#[async_trait]
impl TokenSource for StaticCredentialsSource {
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

    fn test_key_json() -> String {
        // A throwaway RSA-2048 PKCS#8 key used only to exercise signing; not
        // a real credential.
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&key, rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        serde_json::json!({
            "type": "service_account",
            "client_email": "test@example.iam.gserviceaccount.com",
            "private_key": pem,
            "token_uri": "https://oauth2.googleapis.com/token",
        })
        .to_string()
    }

    #[test]
    fn rejects_non_service_account_type() {
        let bad = serde_json::json!({
            "type": "authorized_user",
            "client_email": "",
            "private_key": "",
            "token_uri": "",
        })
        .to_string();
        let err = StaticCredentialsSource::from_json(&bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn signs_a_jwt_with_three_segments() {
        let source = StaticCredentialsSource::from_json(&test_key_json()).unwrap();
        let assertion = source.signed_assertion().unwrap();
        assert_eq!(assertion.split('.').count(), 3);
    }
}
