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

//! Token sources: a uniform abstraction over the three ways this crate can
//! obtain an OAuth2 bearer token.

pub mod static_source;
pub mod swappable;
pub mod workload_identity;

use crate::error::Result;
use crate::token::AccessToken;
use async_trait::async_trait;

/// A producer of [`AccessToken`]s, mirroring the teacher auth crate's
/// `Source` trait.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn get_token(&self) -> Result<AccessToken>;
}

/// Which credential strategy a registry entry was created with. Two entries
/// for the same instance key must agree on this, per spec §4.5 step 2.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AuthMode {
    CredentialFile,
    AccessTokenSource,
}

pub use static_source::StaticCredentialsSource;
pub use swappable::SwappableTokenSource;
pub use workload_identity::{OidcIdTokenProvider, WorkloadIdentitySource};
