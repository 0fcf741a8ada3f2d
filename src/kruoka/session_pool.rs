//! Per-thread HTTP sessions sharing one set of challenge credentials
//!
//! Resolution runs once under `init_lock`; every other thread blocks on that
//! lock until it finishes. Afterwards each worker thread lazily builds its own
//! session from the shared credentials. A generation counter is bumped
//! each time fresh credentials are installed, so sessions built from older
//! credentials are rebuilt on their next use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, info, warn};

use super::challenge::{ChallengeResolver, Credentials};
use super::rate_limiter::GlobalRateLimiter;
use super::session::{HttpSession, SessionFactory};
use super::transport::{TransportError, TransportResult};
use super::types::{ApiRequest, ApiResponse};

pub const STATUS_FORBIDDEN: u16 = 403;

#[derive(Default)]
struct SharedCredentials {
    credentials: Option<Arc<Credentials>>,
    generation: u64,
}

/// A session plus the credential generation it was built from.
#[derive(Clone)]
pub struct SessionHandle {
    pub generation: u64,
    session: Arc<dyn HttpSession>,
}

impl SessionHandle {
    pub fn send(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
        self.session.send(request)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionPoolStats {
    pub resolutions: u64,
    pub sessions_built: u64,
    pub live_sessions: usize,
}

pub struct SessionPool {
    resolver: ChallengeResolver,
    factory: Arc<dyn SessionFactory>,
    limiter: GlobalRateLimiter,
    init_lock: Mutex<()>,
    initialised: AtomicBool,
    shared: RwLock<SharedCredentials>,
    sessions: DashMap<ThreadId, SessionHandle>,
    resolutions: AtomicU64,
    sessions_built: AtomicU64,
}

impl SessionPool {
    pub fn new(
        resolver: ChallengeResolver,
        factory: Arc<dyn SessionFactory>,
        limiter: GlobalRateLimiter,
    ) -> Self {
        Self {
            resolver,
            factory,
            limiter,
            init_lock: Mutex::new(()),
            initialised: AtomicBool::new(false),
            shared: RwLock::new(SharedCredentials::default()),
            sessions: DashMap::new(),
            resolutions: AtomicU64::new(0),
            sessions_built: AtomicU64::new(0),
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    /// Current credentials, if resolved.
    pub fn credentials(&self) -> Option<Arc<Credentials>> {
        self.shared.read().credentials.clone()
    }

    /// Session for the calling thread, resolving the challenge first if
    /// nothing has been resolved yet.
    pub fn get_session(&self) -> TransportResult<SessionHandle> {
        let thread_id = thread::current().id();

        loop {
            self.ensure_initialised()?;

            let (generation, credentials) = {
                let shared = self.shared.read();
                (shared.generation, shared.credentials.clone())
            };

            // Invalidated between the init check and the read above; wait for
            // whoever holds `init_lock` to finish resolving
            let Some(credentials) = credentials else {
                debug!(thread = ?thread_id, "Credentials mid-replacement, waiting");
                continue;
            };

            if let Some(handle) = self.sessions.get(&thread_id) {
                if handle.generation == generation {
                    return Ok(handle.clone());
                }
            }

            let handle = self.build(generation, &credentials)?;
            debug!(thread = ?thread_id, generation, "Built thread session");
            self.sessions.insert(thread_id, handle.clone());
            return Ok(handle);
        }
    }

    fn build(&self, generation: u64, credentials: &Credentials) -> TransportResult<SessionHandle> {
        let session = self.factory.create(credentials)?;
        self.sessions_built.fetch_add(1, Ordering::Relaxed);
        Ok(SessionHandle {
            generation,
            session,
        })
    }

    fn ensure_initialised(&self) -> TransportResult<()> {
        if self.is_initialised() {
            return Ok(());
        }

        let _guard = self.init_lock.lock();
        if self.is_initialised() {
            return Ok(());
        }
        self.initialise_locked()
    }

    /// Resolve, build and smoke-test a session. Caller holds `init_lock`.
    fn initialise_locked(&self) -> TransportResult<()> {
        let credentials = self.resolver.resolve()?;
        self.resolutions.fetch_add(1, Ordering::Relaxed);

        let pending_generation = self.shared.read().generation + 1;
        let handle = self.build(pending_generation, &credentials)?;
        self.verify(&handle)?;

        {
            let mut shared = self.shared.write();
            shared.generation = pending_generation;
            shared.credentials = Some(Arc::new(credentials));
        }
        self.sessions.insert(thread::current().id(), handle);
        self.initialised.store(true, Ordering::Release);
        Ok(())
    }

    /// Cheap request proving the fresh credentials actually work.
    fn verify(&self, handle: &SessionHandle) -> TransportResult<()> {
        self.limiter.wait();
        let response = handle.send(&ApiRequest::post(
            "stores/search",
            json!({"query": "", "offset": 0, "limit": 1}),
        ))?;

        if response.status == STATUS_FORBIDDEN {
            warn!("Session verification got 403, clearance cookies may be invalid");
            return Err(TransportError::SessionInvalid(
                "smoke test answered 403".to_string(),
            ));
        }

        info!(status = response.status, "Session verified (stores/search)");
        Ok(())
    }

    /// Drop the shared credentials so the next access resolves again.
    pub fn invalidate(&self) {
        let _guard = self.init_lock.lock();
        self.invalidate_locked();
    }

    fn invalidate_locked(&self) {
        self.initialised.store(false, Ordering::Release);
        self.shared.write().credentials = None;
    }

    /// Replace credentials after a 403 seen on a session of `seen_generation`.
    ///
    /// When another thread already replaced them in the meantime, the new
    /// credentials are reused instead of solving the challenge again.
    pub fn reauthenticate(&self, seen_generation: u64) -> TransportResult<()> {
        warn!("Re-authenticating, resetting challenge session");
        self.sessions.remove(&thread::current().id());

        let _guard = self.init_lock.lock();
        if self.is_initialised() && self.shared.read().generation != seen_generation {
            info!("Credentials already refreshed by another thread");
            return Ok(());
        }

        self.invalidate_locked();
        self.initialise_locked()?;
        info!("Re-authentication complete, new challenge session established");
        Ok(())
    }

    /// Close the calling thread's session and force fresh resolution next time.
    pub fn teardown(&self) {
        self.sessions.remove(&thread::current().id());
        self.invalidate();
    }

    /// Close every session.
    pub fn shutdown(&self) {
        self.sessions.clear();
        self.invalidate();
    }

    pub fn get_stats(&self) -> SessionPoolStats {
        SessionPoolStats {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            sessions_built: self.sessions_built.load(Ordering::Relaxed),
            live_sessions: self.sessions.len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kruoka::challenge::ChallengeSolver;
    use crate::kruoka::challenge::tests::StubSolver;
    use crate::kruoka::rate_limiter::RateLimiterConfig;
    use crate::kruoka::rate_limiter::tests::RecordingSleeper;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Responder = dyn Fn(&ApiRequest) -> ApiResponse + Send + Sync;

    /// Session answering through a shared closure and logging every request.
    pub(crate) struct MockSession {
        responder: Arc<Responder>,
        log: Arc<Mutex<Vec<ApiRequest>>>,
    }

    impl HttpSession for MockSession {
        fn send(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
            self.log.lock().push(request.clone());
            Ok((self.responder)(request))
        }
    }

    pub(crate) struct MockFactory {
        responder: Arc<Responder>,
        pub log: Arc<Mutex<Vec<ApiRequest>>>,
        pub created: AtomicUsize,
    }

    impl MockFactory {
        pub(crate) fn new(responder: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static) -> Self {
            Self {
                responder: Arc::new(responder),
                log: Arc::new(Mutex::new(Vec::new())),
                created: AtomicUsize::new(0),
            }
        }

        /// Number of logged requests to `endpoint`.
        pub(crate) fn calls_to(&self, endpoint: &str) -> usize {
            self.log.lock().iter().filter(|r| r.endpoint == endpoint).count()
        }
    }

    impl SessionFactory for MockFactory {
        fn create(&self, _credentials: &Credentials) -> TransportResult<Arc<dyn HttpSession>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockSession {
                responder: self.responder.clone(),
                log: self.log.clone(),
            }))
        }
    }

    /// Limiter that never blocks, even after a push-back.
    pub(crate) fn fast_limiter() -> GlobalRateLimiter {
        GlobalRateLimiter::with_sleeper(
            RateLimiterConfig {
                min_interval: Duration::ZERO,
            },
            Arc::new(RecordingSleeper::default()),
        )
    }

    pub(crate) fn pool_with(
        solver: Arc<StubSolver>,
        factory: Arc<MockFactory>,
    ) -> SessionPool {
        SessionPool::new(
            ChallengeResolver::new(vec![solver as Arc<dyn ChallengeSolver>]),
            factory,
            fast_limiter(),
        )
    }

    fn ok_factory() -> Arc<MockFactory> {
        Arc::new(MockFactory::new(|_| ApiResponse::new(200, "{}")))
    }

    #[test]
    fn test_resolves_once_across_threads() {
        let solver = Arc::new(StubSolver::ok("stub"));
        let factory = ok_factory();
        let pool = pool_with(solver.clone(), factory.clone());

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    pool.get_session().unwrap();
                    pool.get_session().unwrap();
                });
            }
        });

        assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(factory.calls_to("stores/search"), 1);
        // One session per thread, the initialising thread reuses its verified one
        assert_eq!(factory.created.load(Ordering::SeqCst), 8);
        assert_eq!(pool.get_stats().live_sessions, 8);
    }

    #[test]
    fn test_smoke_test_403_is_fatal() {
        let factory = Arc::new(MockFactory::new(|_| ApiResponse::new(403, "denied")));
        let pool = pool_with(Arc::new(StubSolver::ok("stub")), factory);

        assert!(matches!(pool.get_session(), Err(TransportError::SessionInvalid(_))));
        assert!(!pool.is_initialised());
        assert!(pool.credentials().is_none());
    }

    #[test]
    fn test_challenge_failure_propagates() {
        let pool = pool_with(Arc::new(StubSolver::failing("stub")), ok_factory());
        assert!(matches!(pool.get_session(), Err(TransportError::Challenge(_))));
    }

    #[test]
    fn test_reauthenticate_bumps_generation() {
        let solver = Arc::new(StubSolver::ok("stub"));
        let pool = pool_with(solver.clone(), ok_factory());

        let first = pool.get_session().unwrap();
        pool.reauthenticate(first.generation).unwrap();
        let second = pool.get_session().unwrap();

        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(solver.calls.load(Ordering::SeqCst), 2);

        // A stale 403 report after someone else refreshed does not re-solve
        pool.reauthenticate(first.generation).unwrap();
        assert_eq!(solver.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sessions_survive_concurrent_reauth() {
        let solver = Arc::new(StubSolver::ok("stub"));
        let pool = pool_with(solver.clone(), ok_factory());
        let start = pool.get_session().unwrap().generation;

        thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..20 {
                    let seen = pool.get_session().unwrap().generation;
                    pool.reauthenticate(seen).unwrap();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let handle = pool.get_session().unwrap();
                        assert!(handle.generation >= start);
                    }
                });
            }
        });

        assert_eq!(solver.calls.load(Ordering::SeqCst), 21);
        assert_eq!(pool.get_session().unwrap().generation, start + 20);
        assert!(pool.credentials().is_some());
    }

    #[test]
    fn test_teardown_forces_resolution() {
        let solver = Arc::new(StubSolver::ok("stub"));
        let pool = pool_with(solver.clone(), ok_factory());

        pool.get_session().unwrap();
        pool.teardown();
        assert!(!pool.is_initialised());
        assert_eq!(pool.get_stats().live_sessions, 0);

        pool.get_session().unwrap();
        assert_eq!(solver.calls.load(Ordering::SeqCst), 2);
    }
}
