// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::RetryConfig;
use rand::Rng;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before the given retry attempt (1-based), exponential with an
/// upper bound and optional multiplicative jitter.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = config.min_delay.as_millis() as f64 * config.multiplier.powi(exponent as i32);
    let capped = base.min(config.max_delay.as_millis() as f64);

    let jittered = match config.max_jitter_factor {
        Some(factor) if factor > 0.0 => {
            let jitter = rand::rng().random_range(0.0..=factor);
            capped * (1.0 + jitter)
        }
        _ => capped,
    };

    Duration::from_millis(jittered as u64)
}

/// Runs `action` until it succeeds, a non-retriable error occurs, or
/// `config.max_attempts` is exhausted. The last error is returned.
pub async fn with_retries<T, E, F, Fut, R>(
    description: &str,
    config: &RetryConfig,
    action: F,
    is_retriable: R,
) -> Result<T, E>
where
    E: Debug,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match action().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "{description} succeeded after retries");
                }
                break Ok(result);
            }
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                let delay = calculate_delay(config, attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{description} failed, retrying: {error:?}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => break Err(error),
        }
    }
}
