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

//! A connector for authenticating and proxying local TCP connections to
//! Cloud SQL instances over mutual TLS, without a database driver needing
//! to know anything about certificates or the Cloud SQL admin API.
//!
//! ```no_run
//! # async fn example() -> cloud_sql_connector::Result<()> {
//! use cloud_sql_connector::Credentials;
//!
//! let instance = cloud_sql_connector::start_proxy(
//!     "my-project:us-central1:my-instance",
//!     Credentials::CredentialFile("/path/to/key.json".into()),
//! )
//! .await?;
//! println!("dial {}", instance.data_source().unwrap());
//! # Ok(())
//! # }
//! ```

mod admin;
mod cert_manager;
mod credentials;
mod error;
mod key;
mod proxy;
mod registry;
mod retry;
mod token;

pub use crate::credentials::{
    AuthMode, OidcIdTokenProvider, StaticCredentialsSource, SwappableTokenSource, TokenSource,
    WorkloadIdentitySource,
};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::key::InstanceConnectionName;
pub use crate::proxy::ProxyInstance;
pub use crate::registry::InstanceRegistry;
pub use crate::token::AccessToken;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// How to authenticate to an instance, passed to [`start_proxy`].
pub enum Credentials {
    /// A path to a service-account key file; the connector signs its own
    /// JWT-bearer tokens from it.
    CredentialFile(PathBuf),
    /// A caller-supplied [`TokenSource`], e.g. [`WorkloadIdentitySource`] or
    /// [`SwappableTokenSource`].
    TokenSource(Arc<dyn TokenSource>),
}

impl Credentials {
    fn auth_mode(&self) -> AuthMode {
        match self {
            Credentials::CredentialFile(_) => AuthMode::CredentialFile,
            Credentials::TokenSource(_) => AuthMode::AccessTokenSource,
        }
    }

    async fn into_token_source(self) -> Result<Arc<dyn TokenSource>> {
        match self {
            Credentials::CredentialFile(path) => {
                Ok(Arc::new(StaticCredentialsSource::from_file(path).await?))
            }
            Credentials::TokenSource(source) => Ok(source),
        }
    }
}

static REGISTRY: OnceLock<InstanceRegistry> = OnceLock::new();

fn global_registry() -> &'static InstanceRegistry {
    REGISTRY.get_or_init(InstanceRegistry::new)
}

/// Starts (or attaches to an already-running) proxy for `instance_key`
/// (`project:region:name`). Concurrent calls for the same key with the same
/// [`AuthMode`] share one underlying [`ProxyInstance`]; calls with a
/// conflicting auth mode fail without disturbing the existing instance.
pub async fn start_proxy(instance_key: &str, credentials: Credentials) -> Result<Arc<ProxyInstance>> {
    let key = InstanceConnectionName::parse(instance_key)?;
    let auth_mode = credentials.auth_mode();
    let token_source = credentials.into_token_source().await?;

    global_registry()
        .get_or_create(&key, auth_mode, move || async move {
            let admin = Arc::new(admin::AdminApiClient::new(token_source));
            let instance = ProxyInstance::new(key, admin);
            instance.start().await?;
            Ok(instance)
        })
        .await
}

/// Releases one reference to `instance`. The underlying listener and
/// background refresh are stopped once every caller has released it.
pub async fn stop(instance: &Arc<ProxyInstance>) {
    global_registry().release(instance).await;
}

/// Stops every proxy instance currently running in this process.
pub async fn stop_all() {
    global_registry().stop_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_map_to_expected_auth_mode() {
        assert_eq!(
            Credentials::CredentialFile("x".into()).auth_mode(),
            AuthMode::CredentialFile
        );
    }
}
