//! Challenge resolution for the K-Ruoka API
//!
//! The API sits behind an anti-automation gate. Before any API call succeeds
//! the process needs a clearance cookie plus the client fingerprint (user
//! agent) that obtained it. This module provides:
//! 1. The immutable `Credentials` produced by a successful solve
//! 2. The `ChallengeSolver` capability implemented by each strategy
//! 3. The `ChallengeResolver` that tries strategies in priority order

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::rate_limiter::{Sleeper, ThreadSleeper};
use crate::sync::config_loader::AppConfig;

pub mod browser;
pub mod captcha;
pub mod flaresolverr;

pub use browser::BrowserSolver;
pub use captcha::CaptchaSolver;
pub use flaresolverr::FlareSolverrSolver;

/// Name of the cookie that proves the challenge was solved.
pub const CLEARANCE_COOKIE: &str = "cf_clearance";

/// Page that serves the challenge.
pub const CHALLENGE_PATH: &str = "/kauppa";

/// Error types for challenge resolution
#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{strategy} did not return the {CLEARANCE_COOKIE} cookie")]
    MissingClearance { strategy: String },

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("No challenge strategy is configured")]
    NoStrategies,

    #[error("All challenge strategies failed. Last error: {last}")]
    Exhausted { last: Box<ChallengeError> },
}

/// Result type for challenge operations
pub type ChallengeResult<T> = Result<T, ChallengeError>;

/// Cookies plus client fingerprint obtained by a solve.
///
/// Never mutated after construction; re-authentication replaces the whole
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    cookies: BTreeMap<String, String>,
    fingerprint: String,
}

impl Credentials {
    pub fn new(cookies: BTreeMap<String, String>, fingerprint: impl Into<String>) -> Self {
        Self {
            cookies,
            fingerprint: fingerprint.into(),
        }
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    /// User agent of the client that solved the challenge.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn has_clearance(&self) -> bool {
        self.cookies
            .get(CLEARANCE_COOKIE)
            .is_some_and(|value| !value.is_empty())
    }

    /// Rejects credentials without the clearance cookie, even when the
    /// strategy itself reported success.
    pub fn require_clearance(self, strategy: &str) -> ChallengeResult<Self> {
        if self.has_clearance() {
            Ok(self)
        } else {
            Err(ChallengeError::MissingClearance {
                strategy: strategy.to_string(),
            })
        }
    }
}

/// A single way of getting past the challenge.
pub trait ChallengeSolver: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Solve the challenge and return cookies plus fingerprint.
    fn solve(&self) -> ChallengeResult<Credentials>;
}

/// Tries each configured strategy in order until one yields clearance.
pub struct ChallengeResolver {
    strategies: Vec<Arc<dyn ChallengeSolver>>,
}

impl ChallengeResolver {
    pub fn new(strategies: Vec<Arc<dyn ChallengeSolver>>) -> Self {
        Self { strategies }
    }

    /// Build the strategy list from configuration.
    ///
    /// Order is cheapest and most reliable first: FlareSolverr, then the paid
    /// CAPTCHA service, then an interactive browser. A strategy whose setting
    /// is absent is left out.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut strategies: Vec<Arc<dyn ChallengeSolver>> = Vec::new();
        let challenge = &config.challenge;
        let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);

        if let Some(url) = challenge.flaresolverr_url.as_deref().filter(|u| !u.is_empty()) {
            strategies.push(Arc::new(FlareSolverrSolver::new(url, &config.api.site_url)));
        }

        if let Some(key) = challenge.captcha_api_key.as_deref().filter(|k| !k.is_empty()) {
            strategies.push(Arc::new(CaptchaSolver::new(
                key,
                &config.api.site_url,
                challenge.browser_options(),
                sleeper.clone(),
            )));
        }

        if challenge.browser_enabled {
            strategies.push(Arc::new(BrowserSolver::new(
                &config.api.site_url,
                challenge.browser_options(),
                sleeper,
            )));
        }

        Self::new(strategies)
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Resolve the challenge, failing only when every strategy failed.
    pub fn resolve(&self) -> ChallengeResult<Credentials> {
        let mut last_error = None;

        for strategy in &self.strategies {
            let name = strategy.name();
            info!(strategy = name, "Trying challenge bypass");

            match strategy.solve().and_then(|creds| creds.require_clearance(name)) {
                Ok(credentials) => {
                    info!(
                        strategy = name,
                        cookies = ?credentials.cookies().keys().collect::<Vec<_>>(),
                        "Challenge bypass succeeded"
                    );
                    return Ok(credentials);
                }
                Err(e) => {
                    warn!(strategy = name, error = %e, "Challenge bypass failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) => Err(ChallengeError::Exhausted {
                last: Box::new(last),
            }),
            None => Err(ChallengeError::NoStrategies),
        }
    }
}

/// Collect `name -> value` pairs for cookies whose domain matches the site.
pub(crate) fn site_cookies<'a, I>(cookies: I, domain_hint: &str) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str, &'a str)>,
{
    cookies
        .into_iter()
        .filter(|(_, _, domain)| domain.is_empty() || domain.contains(domain_hint))
        .map(|(name, value, _)| (name.to_string(), value.to_string()))
        .collect()
}

/// The registrable part of the site host, used to filter browser cookies.
pub(crate) fn domain_hint(site_url: &str) -> String {
    reqwest::Url::parse(site_url)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| "k-ruoka.fi".to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Solver stub that returns a scripted outcome and counts calls.
    pub(crate) struct StubSolver {
        name: String,
        cookies: Option<Vec<(&'static str, &'static str)>>,
        /// Calls beyond this many fail
        successes: usize,
        pub calls: AtomicUsize,
    }

    impl StubSolver {
        pub(crate) fn ok(name: &str) -> Self {
            Self {
                name: name.to_string(),
                cookies: Some(vec![(CLEARANCE_COOKIE, "token"), ("session", "abc")]),
                successes: usize::MAX,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing(name: &str) -> Self {
            Self {
                name: name.to_string(),
                cookies: None,
                successes: usize::MAX,
                calls: AtomicUsize::new(0),
            }
        }

        /// Succeeds `successes` times, then fails.
        pub(crate) fn ok_then_failing(name: &str, successes: usize) -> Self {
            Self {
                successes,
                ..Self::ok(name)
            }
        }

        pub(crate) fn without_clearance(name: &str) -> Self {
            Self {
                name: name.to_string(),
                cookies: Some(vec![("session", "abc")]),
                successes: usize::MAX,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ChallengeSolver for StubSolver {
        fn name(&self) -> &str {
            &self.name
        }

        fn solve(&self) -> ChallengeResult<Credentials> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.cookies {
                Some(cookies) if call < self.successes => Ok(Credentials::new(
                    cookies
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    "test-agent",
                )),
                _ => Err(ChallengeError::Strategy(format!("{} exploded", self.name))),
            }
        }
    }

    #[test]
    fn test_first_success_wins() {
        let first = Arc::new(StubSolver::failing("first"));
        let second = Arc::new(StubSolver::ok("second"));
        let third = Arc::new(StubSolver::ok("third"));
        let resolver = ChallengeResolver::new(vec![
            first.clone() as Arc<dyn ChallengeSolver>,
            second.clone(),
            third.clone(),
        ]);

        let creds = resolver.resolve().unwrap();
        assert!(creds.has_clearance());
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_clearance_counts_as_failure() {
        let resolver = ChallengeResolver::new(vec![
            Arc::new(StubSolver::without_clearance("quiet")) as Arc<dyn ChallengeSolver>,
            Arc::new(StubSolver::ok("fallback")),
        ]);

        let creds = resolver.resolve().unwrap();
        assert_eq!(creds.cookies().get(CLEARANCE_COOKIE).map(String::as_str), Some("token"));
    }

    #[test]
    fn test_exhausted_carries_last_error() {
        let resolver = ChallengeResolver::new(vec![
            Arc::new(StubSolver::failing("a")) as Arc<dyn ChallengeSolver>,
            Arc::new(StubSolver::without_clearance("b")),
        ]);

        match resolver.resolve() {
            Err(ChallengeError::Exhausted { last }) => {
                assert!(matches!(*last, ChallengeError::MissingClearance { ref strategy } if strategy == "b"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_no_strategies() {
        let resolver = ChallengeResolver::new(Vec::new());
        assert!(matches!(resolver.resolve(), Err(ChallengeError::NoStrategies)));
    }

    #[test]
    fn test_site_cookie_filter() {
        let cookies = site_cookies(
            vec![
                ("cf_clearance", "x", ".k-ruoka.fi"),
                ("tracker", "y", ".ads.example"),
                ("host_only", "z", ""),
            ],
            "k-ruoka.fi",
        );
        assert_eq!(cookies.len(), 2);
        assert!(cookies.contains_key("cf_clearance"));
        assert!(!cookies.contains_key("tracker"));
    }

    #[test]
    fn test_domain_hint() {
        assert_eq!(domain_hint("https://www.k-ruoka.fi"), "k-ruoka.fi");
        assert_eq!(domain_hint("not a url"), "k-ruoka.fi");
    }
}
