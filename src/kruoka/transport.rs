use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

use super::challenge::ChallengeError;
use super::rate_limiter::{GlobalRateLimiter, Sleeper, ThreadSleeper};
use super::session_pool::{STATUS_FORBIDDEN, SessionPool};
use super::types::{ApiRequest, ApiResponse};
use crate::sync::config_loader::Rate;

pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Error types for the request layer. Non-2xx statuses are not errors here.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Challenge resolution failed: {0}")]
    Challenge(#[from] ChallengeError),

    #[error("Session is not valid: {0}")]
    SessionInvalid(String),

    #[error("Failed to build request: {0}")]
    Build(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_rate_limit_retries: u32,
    pub initial_backoff: Duration,
    pub max_reauth: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 4,
            initial_backoff: Duration::from_secs(15),
            max_reauth: 1,
        }
    }
}

impl From<&Rate> for RetryPolicy {
    fn from(rate: &Rate) -> Self {
        Self {
            max_rate_limit_retries: rate.max_rate_limit_retries,
            initial_backoff: Duration::from_secs_f64(rate.initial_backoff_secs.max(0.0)),
            max_reauth: rate.max_reauth,
        }
    }
}

impl RetryPolicy {
    /// `initial * 2^attempt`, attempt counted from zero.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Where a single call currently stands.
enum AttemptState {
    Sending,
    RateLimited(ApiResponse),
    Forbidden { response: ApiResponse, generation: u64 },
    Done(ApiResponse),
}

/// Rate-limited request layer with 429 backoff and 403 re-authentication.
#[derive(Clone)]
pub struct Transport {
    pool: Arc<SessionPool>,
    limiter: GlobalRateLimiter,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl Transport {
    pub fn new(pool: Arc<SessionPool>, limiter: GlobalRateLimiter, policy: RetryPolicy) -> Self {
        Self::with_sleeper(pool, limiter, policy, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(
        pool: Arc<SessionPool>,
        limiter: GlobalRateLimiter,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            pool,
            limiter,
            sleeper,
            policy,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn limiter(&self) -> &GlobalRateLimiter {
        &self.limiter
    }

    /// Send `request`, absorbing throttling and one session expiry.
    ///
    /// A response whose status is still 429 or 403 after the retry budgets
    /// are spent is returned as-is. Only network-level failures and challenge
    /// failures are errors.
    pub fn request(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
        let mut rate_limit_attempt = 0u32;
        let mut reauths = 0u32;
        let mut state = AttemptState::Sending;

        loop {
            state = match state {
                AttemptState::Sending => {
                    self.limiter.wait();
                    let session = self.pool.get_session()?;
                    let response = session.send(request)?;

                    match response.status {
                        STATUS_FORBIDDEN => AttemptState::Forbidden {
                            response,
                            generation: session.generation,
                        },
                        STATUS_TOO_MANY_REQUESTS => AttemptState::RateLimited(response),
                        _ => AttemptState::Done(response),
                    }
                }

                AttemptState::Forbidden {
                    response,
                    generation,
                } => {
                    if reauths >= self.policy.max_reauth {
                        AttemptState::Done(response)
                    } else {
                        reauths += 1;
                        warn!(
                            endpoint = %request.endpoint,
                            attempt = reauths,
                            max = self.policy.max_reauth,
                            "HTTP 403, clearance may have expired, re-authenticating"
                        );
                        match self.pool.reauthenticate(generation) {
                            Ok(()) => AttemptState::Sending,
                            Err(e) => {
                                error!(error = %e, "Re-authentication failed");
                                AttemptState::Done(response)
                            }
                        }
                    }
                }

                AttemptState::RateLimited(response) => {
                    if rate_limit_attempt >= self.policy.max_rate_limit_retries {
                        error!(
                            endpoint = %request.endpoint,
                            retries = self.policy.max_rate_limit_retries,
                            "HTTP 429 after all retries, giving up"
                        );
                        AttemptState::Done(response)
                    } else {
                        let backoff = self.policy.backoff_for(rate_limit_attempt);
                        rate_limit_attempt += 1;
                        warn!(
                            endpoint = %request.endpoint,
                            backoff_secs = backoff.as_secs_f64(),
                            attempt = rate_limit_attempt,
                            max = self.policy.max_rate_limit_retries,
                            "HTTP 429, backing off"
                        );
                        self.limiter.push_back(backoff);
                        self.sleeper.sleep(backoff);
                        AttemptState::Sending
                    }
                }

                AttemptState::Done(response) => return Ok(response),
            };
        }
    }
}
