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

//! Maintains a fresh mTLS client identity (RSA-2048 keypair plus the most
//! recently issued ephemeral certificate) for one Cloud SQL instance.

use crate::admin::AdminApiClient;
use crate::error::{Error, Result};
use crate::key::InstanceConnectionName;
use crate::retry::retry_with_backoff;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

/// How long before `not_after` a certificate is considered stale and worth
/// proactively refreshing.
const REFRESH_WINDOW: chrono::Duration = chrono::Duration::minutes(15);
/// How often the background task pre-warms the certificate.
const BACKGROUND_REFRESH_INTERVAL: Duration = Duration::from_secs(50 * 60);

/// A client certificate paired with its private key, ready to be handed to
/// `rustls` as the client identity for one TLS handshake.
#[derive(Clone)]
pub struct ClientIdentity {
    pub certified_key: Arc<rustls::sign::CertifiedKey>,
    pub not_after: chrono::DateTime<chrono::Utc>,
}

struct KeyPair {
    private_key: RsaPrivateKey,
    public_key_pem: String,
}

impl KeyPair {
    fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| Error::config(format!("failed to generate RSA key: {e}")))?;
        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::config(format!("failed to encode public key: {e}")))?;
        Ok(Self {
            private_key,
            public_key_pem,
        })
    }
}

/// Owns one RSA-2048 keypair (generated once) and the most recent ephemeral
/// client certificate for `key`. Single-flight refresh under `cached`'s
/// mutex; a background task pre-warms the certificate every 50 minutes.
pub struct CertManager {
    key: InstanceConnectionName,
    admin: Arc<AdminApiClient>,
    keypair: OnceCell<KeyPair>,
    cached: Mutex<Option<ClientIdentity>>,
    shutdown: tokio::sync::watch::Sender<bool>,
    background_task: Mutex<Option<JoinHandle<()>>>,
}

impl CertManager {
    pub fn new(key: InstanceConnectionName, admin: Arc<AdminApiClient>) -> Arc<Self> {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        let manager = Arc::new(Self {
            key,
            admin,
            keypair: OnceCell::new(),
            cached: Mutex::new(None),
            shutdown: shutdown_tx,
            background_task: Mutex::new(None),
        });
        manager.clone().spawn_background_refresh();
        manager
    }

    fn spawn_background_refresh(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(BACKGROUND_REFRESH_INTERVAL) => {
                        if let Err(err) = self.get_valid_client_certificate().await {
                            tracing::warn!(key = %self.key, error = %err, "background certificate pre-warm failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!(key = %self.key, "background certificate refresh stopped");
                        return;
                    }
                }
            }
        });
        // Stash the handle so `stop_background_refresh` can join it; this
        // runs synchronously from `new`, before any other caller can race
        // on `background_task`.
        if let Ok(mut guard) = self.background_task.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn keypair(&self) -> Result<&KeyPair> {
        self.keypair.get_or_try_init(|| async { KeyPair::generate() }).await
    }

    /// Returns a client identity whose certificate is valid for at least
    /// [`REFRESH_WINDOW`] past now, refreshing it against the admin API if
    /// necessary. At most one admin call is ever in flight at a time.
    pub async fn get_valid_client_certificate(&self) -> Result<ClientIdentity> {
        let mut cached = self.cached.lock().await;
        if let Some(identity) = cached.as_ref() {
            if identity.not_after > chrono::Utc::now() + REFRESH_WINDOW {
                return Ok(identity.clone());
            }
        }
        let keypair = self.keypair().await?;
        let key = self.key.clone();
        let admin = self.admin.clone();
        let public_key_pem = keypair.public_key_pem.clone();
        let cert_pem = retry_with_backoff("generate_ephemeral_cert", || {
            let admin = admin.clone();
            let key = key.clone();
            let public_key_pem = public_key_pem.clone();
            async move {
                admin
                    .generate_ephemeral_cert(key.project(), &key.region_tilde_name(), &public_key_pem)
                    .await
            }
        })
        .await?;

        let identity = self.build_identity(&keypair.private_key, &cert_pem)?;
        tracing::info!(key = %self.key, not_after = %identity.not_after, "refreshed ephemeral client certificate");
        *cached = Some(identity.clone());
        Ok(identity)
    }

    /// Pairs the signed certificate PEM with the held private key as a
    /// `rustls::sign::CertifiedKey`, skipping the PKCS#12 round-trip the
    /// original design used: `rustls` accepts a detached
    /// `(certificate chain, private key)` pair directly (see DESIGN.md).
    fn build_identity(&self, private_key: &RsaPrivateKey, cert_pem: &str) -> Result<ClientIdentity> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| Error::config(format!("invalid certificate PEM from admin API: {e}")))?;
        let not_after = parse_not_after(&cert_der)?;

        let pkcs8_der = private_key
            .to_pkcs8_der()
            .map_err(|e| Error::config(format!("failed to encode private key: {e}")))?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8_der.as_bytes().to_vec()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|_| Error::config("failed to build a TLS signing key from the RSA key"))?;

        Ok(ClientIdentity {
            certified_key: Arc::new(rustls::sign::CertifiedKey::new(cert_der, signing_key)),
            not_after,
        })
    }

    /// Signals the background refresh task to exit and joins it. Idempotent.
    pub async fn stop_background_refresh(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.background_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Extracts `notAfter` from the leaf certificate's DER bytes.
fn parse_not_after(chain: &[CertificateDer<'static>]) -> Result<chrono::DateTime<chrono::Utc>> {
    let leaf = chain
        .first()
        .ok_or_else(|| Error::config("certificate chain from admin API was empty"))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| Error::config(format!("failed to parse ephemeral certificate: {e}")))?;
    let not_after = parsed.validity().not_after;
    chrono::DateTime::from_timestamp(not_after.timestamp(), 0)
        .ok_or_else(|| Error::config("certificate notAfter is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_generates_2048_bit_rsa() {
        let kp = KeyPair::generate().unwrap();
        assert_eq!(kp.private_key.size() * 8, 2048);
        assert!(kp.public_key_pem.contains("PUBLIC KEY"));
    }
}
