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

//! The per-instance proxy: terminates local connections, dials the remote
//! instance over mTLS, and splices bytes in both directions.

use crate::admin::{AdminApiClient, ConnectSettings};
use crate::cert_manager::CertManager;
use crate::error::{Error, Result};
use crate::key::InstanceConnectionName;
use crate::retry::retry_with_backoff;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

/// The port every Cloud SQL instance accepts mTLS connections on.
const REMOTE_MTLS_PORT: u16 = 3307;

/// Bound to one instance key. See [`ProxyInstance::start`]/[`ProxyInstance::stop`].
pub struct ProxyInstance {
    key: InstanceConnectionName,
    admin: Arc<AdminApiClient>,
    cert_manager: Arc<CertManager>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote: Mutex<Option<ConnectSettings>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyInstance {
    pub(crate) fn new(key: InstanceConnectionName, admin: Arc<AdminApiClient>) -> Arc<Self> {
        let cert_manager = CertManager::new(key.clone(), admin.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            key,
            admin,
            cert_manager,
            local_addr: Mutex::new(None),
            remote: Mutex::new(None),
            shutdown: shutdown_tx,
            accept_task: Mutex::new(None),
        })
    }

    /// Resolves instance metadata, binds the local loopback listener, and
    /// launches the accept loop. Aborts (and returns an error) on listener
    /// bind failure; per-connection failures afterwards are isolated.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        let key = self.key.clone();
        let admin = self.admin.clone();
        let settings = retry_with_backoff("get_connect_settings", || {
            let admin = admin.clone();
            let key = key.clone();
            async move { admin.get_connect_settings(key.project(), key.name()).await }
        })
        .await?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(local_addr);
        *self.remote.lock().unwrap() = Some(settings);

        tracing::info!(key = %self.key, %local_addr, "proxy listening");

        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, peer)) => {
                                let this = this.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = this.handle_connection(socket).await {
                                        tracing::warn!(key = %this.key, %peer, error = %err, "connection failed");
                                    }
                                });
                            }
                            Err(err) => {
                                tracing::warn!(key = %this.key, error = %err, "accept failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!(key = %this.key, "accept loop stopped");
                        return;
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// The local endpoint address, formatted for a database client. `None`
    /// until [`ProxyInstance::start`] has bound its listener.
    pub fn data_source(&self) -> Option<String> {
        let addr = (*self.local_addr.lock().unwrap())?;
        Some(format!("tcp:{},{}", addr.ip(), addr.port()))
    }

    pub fn key(&self) -> &InstanceConnectionName {
        &self.key
    }

    async fn handle_connection(self: &Arc<Self>, local: tokio::net::TcpStream) -> Result<()> {
        let identity = self.cert_manager.get_valid_client_certificate().await?;
        let settings = self
            .remote
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::connection("proxy not started"))?;

        let mut remote = self.dial_remote(&settings, identity.certified_key).await?;
        let mut local = local;
        tokio::io::copy_bidirectional(&mut local, &mut remote)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn dial_remote(
        &self,
        settings: &ConnectSettings,
        client_identity: Arc<CertifiedKey>,
    ) -> Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> {
        let root_ca = parse_single_ca(&settings.server_ca_cert_pem)?;
        let verifier = Arc::new(PinnedCaVerifier {
            root_ca,
            expected_common_name: self.key.to_string(),
        });
        let resolver = Arc::new(StaticClientCertResolver {
            identity: client_identity,
        });

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::connection(format!("unsupported TLS protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(resolver);
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = tokio::net::TcpStream::connect((settings.ip_address.as_str(), REMOTE_MTLS_PORT))
            .await?;
        // The server name is only used to select SNI and is superseded by
        // `PinnedCaVerifier`'s own common-name check; any valid DNS name
        // satisfies rustls's `ServerName` constructor.
        let server_name = ServerName::try_from("cloudsql-instance")
            .map_err(|_| Error::connection("invalid server name"))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::connection(format!("TLS handshake failed: {e}")))?;
        Ok(tls)
    }

    /// Signals the accept loop to exit, closes the listener, stops the cert
    /// manager's background refresher, and disposes of cryptographic
    /// material. Idempotent.
    pub(crate) async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            let _ = handle.await;
        }
        self.cert_manager.stop_background_refresh().await;
        tracing::info!(key = %self.key, "proxy stopped");
    }
}

fn parse_single_ca(pem: &str) -> Result<CertificateDer<'static>> {
    let mut certs = rustls_pemfile::certs(&mut pem.as_bytes());
    certs
        .next()
        .ok_or_else(|| Error::config("server CA PEM contained no certificate"))?
        .map_err(|e| Error::config(format!("invalid server CA PEM: {e}")))
}

/// Always resolves to the one client identity the cert manager holds for
/// this instance; there is exactly one client certificate per proxy.
#[derive(Debug)]
struct StaticClientCertResolver {
    identity: Arc<CertifiedKey>,
}

impl ResolvesClientCert for StaticClientCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.identity.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Verifies the server's certificate chain against a single pinned CA and
/// checks the leaf's CommonName against the instance's canonical
/// `project:region:name`, instead of relying on SAN-based hostname matching
/// (Cloud SQL server certificates carry the instance name in the CN, not a
/// SAN entry).
#[derive(Debug)]
struct PinnedCaVerifier {
    root_ca: CertificateDer<'static>,
    expected_common_name: String,
}

impl ServerCertVerifier for PinnedCaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let (_, ca) = x509_parser::parse_x509_certificate(self.root_ca.as_ref())
            .map_err(|_| rustls::Error::General("invalid pinned CA certificate".into()))?;
        let (_, leaf) = x509_parser::parse_x509_certificate(end_entity.as_ref())
            .map_err(|_| rustls::Error::General("invalid server certificate".into()))?;

        leaf.verify_signature(Some(ca.public_key()))
            .map_err(|_| rustls::Error::General("server certificate not signed by pinned CA".into()))?;

        let now_secs = now.as_secs() as i64;
        let now_asn1 = x509_parser::time::ASN1Time::from_timestamp(now_secs)
            .map_err(|_| rustls::Error::General("system clock is out of range".into()))?;
        if !leaf.validity().is_valid_at(now_asn1) {
            return Err(rustls::Error::General("server certificate is not currently valid".into()));
        }

        let common_name = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default();
        if common_name != self.expected_common_name {
            return Err(rustls::Error::General(format!(
                "server certificate common name {common_name:?} does not match expected instance {:?}",
                self.expected_common_name
            )));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_source_formats_tcp_address() {
        // Exercised indirectly through ProxyInstance in registry tests; this
        // covers the pure formatting logic in isolation.
        let addr: SocketAddr = "127.0.0.1:5432".parse().unwrap();
        assert_eq!(format!("tcp:{},{}", addr.ip(), addr.port()), "tcp:127.0.0.1,5432");
    }
}
