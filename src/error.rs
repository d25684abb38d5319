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

//! The crate-wide error type.

/// A coarse classification of [`Error`], useful for callers deciding whether to retry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A malformed instance key, missing credentials, or conflicting auth mode.
    Configuration,
    /// A token source failed to produce a token.
    Token,
    /// An admin API call failed with a status that is safe to retry (>= 500).
    AdminTransient,
    /// An admin API call failed with a status that must not be retried (4xx).
    AdminPermanent,
    /// A proxy instance failed during its first `start()`.
    Startup,
    /// An error isolated to a single client connection.
    Connection,
    /// A local I/O error (listener bind, file read, ...).
    Io,
    /// A (de)serialization error.
    Serialization,
}

/// The error type returned by every fallible operation in this crate.
#[derive(thiserror::Error, Debug)]
#[error("{kind:?}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap<E>(kind: ErrorKind, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn token(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Token, message)
    }

    pub fn startup(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Startup, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    /// An admin API error carrying the HTTP status observed, classified into
    /// [`ErrorKind::AdminTransient`] (`status >= 500`) or
    /// [`ErrorKind::AdminPermanent`] otherwise.
    pub fn admin_api(status: u16, message: impl Into<String>) -> Self {
        let kind = if status >= 500 {
            ErrorKind::AdminTransient
        } else {
            ErrorKind::AdminPermanent
        };
        Self::new(kind, format!("{} (status {status})", message.into()))
    }

    /// Whether this error is safe to retry under the backoff policy in
    /// [`crate::retry`].
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::AdminTransient)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::wrap(ErrorKind::Io, "I/O error", e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::wrap(ErrorKind::Serialization, "serialization error", e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let kind = match e.status().map(|s| s.as_u16()) {
            Some(status) if status >= 500 => ErrorKind::AdminTransient,
            Some(_) => ErrorKind::AdminPermanent,
            None => ErrorKind::Token,
        };
        Self::wrap(kind, "http request failed", e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_api_classifies_by_status() {
        assert_eq!(Error::admin_api(503, "boom").kind(), ErrorKind::AdminTransient);
        assert_eq!(Error::admin_api(500, "boom").kind(), ErrorKind::AdminTransient);
        assert_eq!(Error::admin_api(404, "boom").kind(), ErrorKind::AdminPermanent);
        assert_eq!(Error::admin_api(403, "boom").kind(), ErrorKind::AdminPermanent);
    }

    #[test]
    fn retryability_matches_kind() {
        assert!(Error::admin_api(503, "x").is_retryable());
        assert!(!Error::admin_api(403, "x").is_retryable());
        assert!(!Error::config("bad key").is_retryable());
    }
}
