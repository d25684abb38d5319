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

//! Truncated exponential backoff for admin API calls.
//!
//! Base delay 200ms, scaling by the golden ratio (~1.618) per attempt, up to
//! five retries. Only errors flagged [`crate::Error::is_retryable`] are
//! retried; after the fifth retry one final unguarded attempt is made so
//! non-retryable errors surface verbatim.

use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// The golden ratio, used as the backoff scaling factor.
pub const PHI: f64 = 1.618_033_988_749_895;

const BASE_DELAY: Duration = Duration::from_millis(200);
const MAX_RETRIES: u32 = 5;

/// Computes the delay before retry attempt `attempt` (1-indexed), following
/// the same truncated-exponential shape as `gax::exponential_backoff::
/// ExponentialBackoff::delay`, but with a golden-ratio scaling factor instead
/// of a configurable one.
fn delay_for_attempt(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1) as i32;
    BASE_DELAY.mul_f64(PHI.powi(exp))
}

fn delay_with_jitter(attempt: u32, rng: &mut impl Rng) -> Duration {
    let delay = delay_for_attempt(attempt);
    rng.gen_range(Duration::ZERO..=delay)
}

/// Runs `op` with up to [`MAX_RETRIES`] retries on retryable errors,
/// sleeping `200ms * PHI^attempt` (with full jitter) between attempts. If all
/// retries are exhausted, one final unguarded attempt is made and its result
/// (success or failure) is returned verbatim.
pub async fn retry_with_backoff<T, F, Fut>(operation_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut rng = rand::thread_rng();
    for attempt in 1..=MAX_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                let delay = delay_with_jitter(attempt, &mut rng);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient admin API error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
    // Final, unguarded attempt: surfaces non-retryable errors (and any error
    // remaining after exhausting retries) verbatim.
    op().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_by_golden_ratio() {
        let d1 = delay_for_attempt(1);
        let d2 = delay_for_attempt(2);
        let d3 = delay_for_attempt(3);
        assert_eq!(d1, BASE_DELAY);
        let ratio_2 = d2.as_secs_f64() / d1.as_secs_f64();
        let ratio_3 = d3.as_secs_f64() / d2.as_secs_f64();
        assert!((ratio_2 - PHI).abs() < 1e-9);
        assert!((ratio_3 - PHI).abs() < 1e-9);
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::admin_api(503, "temporarily unavailable"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::admin_api(403, "forbidden")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), ErrorKind::AdminPermanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_then_one_final_unguarded_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::admin_api(503, "still down")) }
        })
        .await;
        assert!(result.is_err());
        // MAX_RETRIES attempts inside the loop, plus one final unguarded call.
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }
}
