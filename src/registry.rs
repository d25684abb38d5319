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

//! Deduplicates concurrent requests for the same instance: one
//! [`crate::proxy::ProxyInstance`] per key, refcounted, single-flight
//! construction.

use crate::credentials::AuthMode;
use crate::error::{Error, Result};
use crate::key::InstanceConnectionName;
use crate::proxy::ProxyInstance;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

struct Entry {
    auth_mode: AuthMode,
    ref_count: AtomicI64,
    instance: tokio::sync::OnceCell<Arc<ProxyInstance>>,
}

impl Entry {
    fn new(auth_mode: AuthMode) -> Self {
        Self {
            auth_mode,
            ref_count: AtomicI64::new(0),
            instance: tokio::sync::OnceCell::new(),
        }
    }
}

/// Decrements `entry`'s refcount on drop unless [`RefCountGuard::disarm`] was
/// called. Armed the moment the refcount is incremented so a cancelled
/// `get_or_create` call (e.g. the caller's future dropped mid-construction)
/// never leaks a reference.
struct RefCountGuard<'a> {
    entry: &'a Entry,
    armed: bool,
}

impl<'a> RefCountGuard<'a> {
    fn new(entry: &'a Entry) -> Self {
        entry.ref_count.fetch_add(1, Ordering::SeqCst);
        Self { entry, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RefCountGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.ref_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A concurrent registry of live proxy instances, one per instance key.
#[derive(Default)]
pub struct InstanceRegistry {
    entries: DashMap<String, Arc<Entry>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the shared proxy instance for `key`, constructing it via
    /// `factory` if this is the first caller. Concurrent callers for the
    /// same key observe exactly one construction; a construction failure is
    /// returned to every waiter and leaves the key free to retry. Callers
    /// requesting conflicting [`AuthMode`]s for the same key fail fast,
    /// without affecting the refcount.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &InstanceConnectionName,
        auth_mode: AuthMode,
        factory: F,
    ) -> Result<Arc<ProxyInstance>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<ProxyInstance>>>,
    {
        let entry = self
            .entries
            .entry(key.as_key())
            .or_insert_with(|| Arc::new(Entry::new(auth_mode)))
            .value()
            .clone();

        if entry.auth_mode != auth_mode {
            return Err(Error::config(format!(
                "instance {key} is already registered with a different auth mode"
            )));
        }

        let guard = RefCountGuard::new(&entry);
        let instance = entry.instance.get_or_try_init(factory).await?;
        let instance = instance.clone();
        guard.disarm();
        Ok(instance)
    }

    /// Releases one reference to `instance`. When the refcount reaches zero
    /// the entry is removed and the instance is stopped. A mismatched or
    /// already-released instance is a no-op.
    pub async fn release(&self, instance: &Arc<ProxyInstance>) {
        let key = instance.key().as_key();
        let Some(entry) = self.entries.get(&key).map(|r| r.value().clone()) else {
            tracing::warn!(%key, "release called for an instance not in the registry");
            return;
        };

        match entry.instance.get() {
            Some(current) if Arc::ptr_eq(current, instance) => {}
            _ => {
                tracing::warn!(%key, "release called with a stale instance reference");
                return;
            }
        }

        let remaining = entry.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        debug_assert!(remaining >= 0, "refcount underflow releasing {key}");
        if remaining > 0 {
            return;
        }
        if remaining < 0 {
            tracing::warn!(%key, remaining, "refcount underflow releasing instance, clamping");
        }

        let removed = self
            .entries
            .remove_if(&key, |_, v| Arc::ptr_eq(v, &entry) && v.ref_count.load(Ordering::SeqCst) <= 0);
        if removed.is_some() {
            instance.stop().await;
        }
    }

    /// Stops every instance currently registered, best-effort. Used on
    /// process shutdown.
    pub async fn stop_all(&self) {
        let drained: Vec<Arc<Entry>> = self.entries.iter().map(|r| r.value().clone()).collect();
        self.entries.clear();
        for entry in drained {
            if let Some(instance) = entry.instance.get() {
                instance.stop().await;
            }
        }
    }

    #[cfg(test)]
    fn ref_count(&self, key: &InstanceConnectionName) -> Option<i64> {
        self.entries
            .get(&key.as_key())
            .map(|e| e.ref_count.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminApiClient;
    use crate::credentials::TokenSource;
    use crate::token::AccessToken;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeTokenSource;

    #[async_trait]
    impl TokenSource for FakeTokenSource {
        async fn get_token(&self) -> Result<AccessToken> {
            Ok(AccessToken::new("fake", chrono::Utc::now() + chrono::Duration::hours(1)))
        }
    }

    fn test_key() -> InstanceConnectionName {
        InstanceConnectionName::parse("proj:region:inst").unwrap()
    }

    fn fake_instance(key: InstanceConnectionName) -> Arc<ProxyInstance> {
        let admin = Arc::new(AdminApiClient::new(Arc::new(FakeTokenSource)));
        ProxyInstance::new(key, admin)
    }

    #[tokio::test]
    async fn conflicting_auth_mode_fails_without_incrementing_refcount() {
        let registry = InstanceRegistry::new();
        let key = test_key();
        let k = key.clone();
        registry
            .get_or_create(&key, AuthMode::CredentialFile, move || async move {
                Ok(fake_instance(k))
            })
            .await
            .unwrap();

        let result = registry
            .get_or_create(&key, AuthMode::AccessTokenSource, || async {
                panic!("factory should not run for a conflicting auth mode")
            })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.ref_count(&key), Some(1));
    }

    #[tokio::test]
    async fn concurrent_get_or_create_constructs_once() {
        let registry = Arc::new(InstanceRegistry::new());
        let key = test_key();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_create(&key, AuthMode::CredentialFile, move || {
                        let calls = calls.clone();
                        let key = key.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(fake_instance(key))
                        }
                    })
                    .await
            }));
        }
        let mut instances = Vec::new();
        for h in handles {
            instances.push(h.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count(&key), Some(8));
        for pair in instances.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[tokio::test]
    async fn failed_construction_allows_retry() {
        let registry = InstanceRegistry::new();
        let key = test_key();

        let first = registry
            .get_or_create(&key, AuthMode::CredentialFile, || async {
                Err(Error::startup("boom"))
            })
            .await;
        assert!(first.is_err());
        assert_eq!(registry.ref_count(&key), Some(0));

        let k = key.clone();
        let second = registry
            .get_or_create(&key, AuthMode::CredentialFile, move || async move {
                Ok(fake_instance(k))
            })
            .await;
        assert!(second.is_ok());
        assert_eq!(registry.ref_count(&key), Some(1));
    }

    #[tokio::test]
    async fn release_removes_entry_at_zero_refcount() {
        let registry = InstanceRegistry::new();
        let key = test_key();
        let k = key.clone();
        let instance = registry
            .get_or_create(&key, AuthMode::CredentialFile, move || async move {
                Ok(fake_instance(k))
            })
            .await
            .unwrap();

        registry.release(&instance).await;
        assert_eq!(registry.ref_count(&key), None);
    }
}
