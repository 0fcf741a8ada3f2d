//! Client side of the K-Ruoka API
//! Challenge bypass, rate-limited transport, typed endpoints and bulk fetching

pub mod aggregator;
pub mod challenge;
pub mod client;
pub mod geo;
pub mod health;
pub mod rate_limiter;
pub mod session;
pub mod session_pool;
pub mod transport;
pub mod types;

use std::sync::Arc;

use tracing::info;

use crate::sync::config_loader::AppConfig;

pub use aggregator::{AggregationObserver, Aggregator, NoopObserver};
pub use challenge::{ChallengeError, ChallengeResolver, ChallengeSolver, Credentials};
pub use client::{ApiClient, ApiError, ApiResult};
pub use rate_limiter::GlobalRateLimiter;
pub use session_pool::SessionPool;
pub use transport::{RetryPolicy, Transport, TransportError, TransportResult};

/// Wire the full client stack from configuration.
///
/// Nothing touches the network until the first request, which triggers
/// challenge resolution.
pub fn init_api_client(config: &AppConfig) -> ApiClient {
    let resolver = ChallengeResolver::from_config(config);
    info!(strategies = ?resolver.strategy_names(), "Challenge strategies configured");

    let limiter = GlobalRateLimiter::with_config(config.rate.limiter_config());
    let factory = Arc::new(session::ReqwestSessionFactory::new(session::SessionSettings::from(
        &config.api,
    )));
    let pool = Arc::new(SessionPool::new(resolver, factory, limiter.clone()));
    let transport = Transport::new(pool, limiter, RetryPolicy::from(&config.rate));

    ApiClient::new(transport)
}
