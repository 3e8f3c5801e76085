//! A single-flight, time-to-live cache in front of a token source

use std::{
    error, fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use latchkey_clock::{Clock, DurationMillis, System, UnixTime};
use tokio::sync::{watch, Mutex};

use crate::{sources::AsyncTokenSource, ExpiryPolicy};

/// The outcome of a single request to the underlying source, shared by every
/// caller that waited on it
type Outcome<T, E> = Result<Arc<T>, Arc<E>>;

struct CacheEntry<T> {
    token: Arc<T>,
    expires_at: UnixTime,
}

impl<T> CacheEntry<T> {
    #[inline]
    fn is_fresh_at(&self, now: UnixTime) -> bool {
        now < self.expires_at
    }
}

struct Settled<T, E> {
    generation: u64,
    outcome: Outcome<T, E>,
}

/// State only touched while holding the exclusion section
struct Flight<S: AsyncTokenSource> {
    source: S,
    last: Option<Settled<S::Token, S::Error>>,
}

/// State shared by every handle to the same cache
struct Shared<S: AsyncTokenSource> {
    flight: Mutex<Flight<S>>,
    entry: watch::Sender<Option<Arc<CacheEntry<S::Token>>>>,
    settled: AtomicU64,
}

/// A token cache that deduplicates concurrent requests to its source
///
/// The cache holds at most one token. While that token is fresh, [`fetch()`]
/// returns it without synchronizing with other callers. Once it goes stale,
/// exactly one caller requests a new token from the source; every caller that
/// arrives while that request is outstanding waits for it and receives the
/// same outcome, whether a token or an error.
///
/// Freshness is evaluated lazily on each access. Nothing runs in the
/// background and failed requests are never retried internally.
///
/// The cache is a cheap handle. Clones share the source and the stored token,
/// so one clone can be handed to a request decorator while another is kept to
/// [`reset()`][Self::reset] the cache. The expiry policy and clock are copied
/// into each clone, so configure the cache before cloning it.
///
/// [`fetch()`]: Self::fetch
pub struct TokenCache<S: AsyncTokenSource, C = System> {
    shared: Arc<Shared<S>>,
    policy: ExpiryPolicy<S::Token>,
    clock: C,
}

impl<S: AsyncTokenSource> TokenCache<S, System> {
    /// Constructs a new, empty cache in front of `source`
    ///
    /// Until a maximum age is configured, tokens are treated as stale as soon
    /// as they are obtained.
    pub fn new(source: S) -> Self {
        let (entry, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                flight: Mutex::new(Flight { source, last: None }),
                entry,
                settled: AtomicU64::new(0),
            }),
            policy: ExpiryPolicy::new(),
            clock: System,
        }
    }
}

impl<S: AsyncTokenSource, C> TokenCache<S, C> {
    /// Reuses each token for a fixed maximum age
    ///
    /// Ignored if a maximum age function has been configured.
    pub fn with_max_age(self, max_age: impl Into<DurationMillis>) -> Self {
        Self {
            policy: self.policy.with_max_age(max_age),
            ..self
        }
    }

    /// Derives each token's maximum age from the token itself
    pub fn with_max_age_fn<F>(self, max_age_fn: F) -> Self
    where
        F: Fn(&S::Token) -> DurationMillis + Send + Sync + 'static,
    {
        Self {
            policy: self.policy.with_max_age_fn(max_age_fn),
            ..self
        }
    }

    /// Replaces the expiry policy
    pub fn with_policy(self, policy: ExpiryPolicy<S::Token>) -> Self {
        Self { policy, ..self }
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenCache<S, D> {
        TokenCache {
            shared: self.shared,
            policy: self.policy,
            clock,
        }
    }

    /// Clears the cached token
    ///
    /// The next call to [`fetch()`][Self::fetch] on any clone will request a
    /// new token. A request that is already outstanding is not cancelled and
    /// will still store its result when it completes.
    pub fn reset(&self) {
        self.shared.entry.send_modify(|entry| *entry = None);
        tracing::debug!("token cache reset");
    }

    /// The instant at which the stored token expires, if a token is stored
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.shared.entry.borrow().as_ref().map(|e| e.expires_at)
    }
}

impl<S: AsyncTokenSource, C: Clock> TokenCache<S, C> {
    /// Gets the cached token if it is still fresh, without requesting a new one
    pub fn peek(&self) -> Option<Arc<S::Token>> {
        let now = self.clock.now();
        self.shared
            .entry
            .borrow()
            .as_ref()
            .filter(|e| e.is_fresh_at(now))
            .map(|e| Arc::clone(&e.token))
    }

    /// Gets a fresh token, requesting one from the source if needed
    ///
    /// # Errors
    ///
    /// Returns the source's error if the request this caller waited on
    /// failed. The error is shared with every other caller that waited on the
    /// same request. The stored token, if any, is left untouched.
    pub async fn fetch(&self) -> Outcome<S::Token, S::Error> {
        // Loaded before the fast path, so an attempt settling in between is shared
        let seen = self.shared.settled.load(Ordering::Acquire);

        if let Some(token) = self.peek() {
            tracing::trace!("using cached token");
            return Ok(token);
        }

        let mut flight = self.shared.flight.lock().await;

        if let Some(last) = flight.last.as_ref().filter(|l| l.generation > seen) {
            tracing::trace!(
                generation = last.generation,
                "sharing result of token request completed while waiting"
            );
            return last.outcome.clone();
        }

        if let Some(token) = self.peek() {
            tracing::trace!("token refreshed while waiting");
            return Ok(token);
        }

        tracing::debug!("requesting new token");
        let outcome = match flight.source.request_token().await {
            Ok(token) => {
                let token = Arc::new(token);
                let expires_at = self.policy.expires_at(self.clock.now(), &token);

                let entry = Arc::new(CacheEntry {
                    token: Arc::clone(&token),
                    expires_at,
                });
                self.shared.entry.send_modify(|e| *e = Some(entry));

                tracing::debug!(expires_at = expires_at.0, "cached new token");
                Ok(token)
            }
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    "token request failed"
                );
                Err(Arc::new(error))
            }
        };

        // Only ever written while holding the exclusion section
        let generation = self.shared.settled.load(Ordering::Relaxed) + 1;
        flight.last = Some(Settled {
            generation,
            outcome: outcome.clone(),
        });
        self.shared.settled.store(generation, Ordering::Release);

        outcome
    }
}

impl<S: AsyncTokenSource, C: Clone> Clone for TokenCache<S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            policy: self.policy.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S, C> fmt::Debug for TokenCache<S, C>
where
    S: AsyncTokenSource,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("policy", &self.policy)
            .field("expires_at", &self.expires_at())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// A cache can stand in for its own source, allowing caches to be layered
#[async_trait]
impl<S, C> AsyncTokenSource for TokenCache<S, C>
where
    S: AsyncTokenSource,
    C: Clock + Send + Sync,
{
    type Token = Arc<S::Token>;
    type Error = Arc<S::Error>;

    async fn request_token(&mut self) -> Result<Self::Token, Self::Error> {
        self.fetch().await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use latchkey_clock::TestClock;

    use super::*;
    use crate::sources::{self, ConstTokenSource};

    #[derive(Debug, thiserror::Error)]
    #[error("unable to fetch token")]
    struct FetchFailed;

    /// A source that replays scripted responses, optionally after a delay,
    /// and counts how often it was asked
    struct ScriptedSource<T> {
        calls: Arc<AtomicUsize>,
        script: VecDeque<(Duration, Result<T, FetchFailed>)>,
    }

    impl<T> ScriptedSource<T> {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                script: VecDeque::new(),
            }
        }

        fn then_ok(mut self, token: T) -> Self {
            self.script.push_back((Duration::ZERO, Ok(token)));
            self
        }

        fn then_ok_after(mut self, delay: Duration, token: T) -> Self {
            self.script.push_back((delay, Ok(token)));
            self
        }

        fn then_err_after(mut self, delay: Duration) -> Self {
            self.script.push_back((delay, Err(FetchFailed)));
            self
        }

        fn calls(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait]
    impl<T: Send + Sync + 'static> AsyncTokenSource for ScriptedSource<T> {
        type Token = T;
        type Error = FetchFailed;

        async fn request_token(&mut self) -> Result<T, FetchFailed> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, response) = self.script.pop_front().expect("source called too often");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            response
        }
    }

    fn failing_source(
        calls: Arc<AtomicUsize>,
    ) -> impl AsyncTokenSource<Token = String, Error = FetchFailed> {
        sources::from_fn(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<String, _>(FetchFailed)
            }
        })
    }

    #[derive(Debug, PartialEq)]
    struct Grant {
        access_token: &'static str,
        expires_in: u64,
    }

    fn clock() -> TestClock {
        TestClock::new(UnixTime(1_000_000))
    }

    mod when_token_is_fresh {
        use super::*;

        #[tokio::test]
        async fn reuses_token_within_max_age() {
            let clock = clock();
            let source = ScriptedSource::new().then_ok("token1").then_ok("token2");
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock.clone());

            assert_eq!(*cache.fetch().await.unwrap(), "token1");

            clock.advance(DurationMillis(50));
            assert_eq!(*cache.fetch().await.unwrap(), "token1");
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            clock.advance(DurationMillis(101));
            assert_eq!(*cache.fetch().await.unwrap(), "token2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn returns_the_identical_token() {
            let cache = TokenCache::new(ConstTokenSource::<String>::new("token"))
                .with_max_age(DurationMillis(100))
                .with_clock(clock());

            let first = cache.fetch().await.unwrap();
            let second = cache.fetch().await.unwrap();
            assert!(Arc::ptr_eq(&first, &second));
        }

        #[tokio::test]
        async fn peek_returns_cached_token_without_requesting() {
            let source = ScriptedSource::new().then_ok("token1");
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock());

            assert!(cache.peek().is_none());
            assert_eq!(calls.load(Ordering::SeqCst), 0);

            cache.fetch().await.unwrap();
            assert_eq!(cache.peek().as_deref(), Some(&"token1"));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn records_expiry_from_time_obtained() {
            let clock = clock();
            let cache = TokenCache::new(ConstTokenSource::<String>::new("token"))
                .with_max_age(DurationMillis(100))
                .with_clock(clock.clone());

            assert_eq!(cache.expires_at(), None);
            cache.fetch().await.unwrap();
            assert_eq!(cache.expires_at(), Some(clock.now() + DurationMillis(100)));
        }
    }

    mod when_max_age_is_derived_from_token {
        use super::*;

        #[tokio::test]
        async fn uses_lifetime_declared_by_each_token() {
            let clock = clock();
            let source = ScriptedSource::new()
                .then_ok(Grant {
                    access_token: "token1",
                    expires_in: 50,
                })
                .then_ok(Grant {
                    access_token: "token2",
                    expires_in: 100,
                });
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age_fn(|g: &Grant| DurationMillis(g.expires_in))
                .with_clock(clock.clone());

            assert_eq!(cache.fetch().await.unwrap().access_token, "token1");

            clock.advance(DurationMillis(20));
            assert_eq!(cache.fetch().await.unwrap().access_token, "token1");

            clock.advance(DurationMillis(41));
            assert_eq!(cache.fetch().await.unwrap().access_token, "token2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn derived_max_age_takes_precedence_over_fixed() {
            let clock = clock();
            let source = ScriptedSource::new()
                .then_ok(Grant {
                    access_token: "token1",
                    expires_in: 10,
                })
                .then_ok(Grant {
                    access_token: "token2",
                    expires_in: 10,
                });
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(1_000))
                .with_max_age_fn(|g: &Grant| DurationMillis(g.expires_in))
                .with_clock(clock.clone());

            cache.fetch().await.unwrap();
            clock.advance(DurationMillis(11));
            assert_eq!(cache.fetch().await.unwrap().access_token, "token2");
        }
    }

    mod when_token_is_stale {
        use super::*;

        #[tokio::test]
        async fn token_is_stale_at_its_expiry_instant() {
            let clock = clock();
            let source = ScriptedSource::new().then_ok("token1").then_ok("token2");
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock.clone());

            cache.fetch().await.unwrap();
            clock.advance(DurationMillis(100));
            assert!(cache.peek().is_none());
            assert_eq!(*cache.fetch().await.unwrap(), "token2");
        }

        #[tokio::test]
        async fn without_max_age_every_fetch_requests_a_token() {
            let source = ScriptedSource::new().then_ok("token1").then_ok("token2");
            let calls = source.calls();
            let cache = TokenCache::new(source).with_clock(clock());

            assert_eq!(*cache.fetch().await.unwrap(), "token1");
            assert_eq!(*cache.fetch().await.unwrap(), "token2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }
    }

    mod when_fetches_are_concurrent {
        use super::*;

        #[tokio::test]
        async fn requests_token_once_for_simultaneous_misses() {
            let source = ScriptedSource::new().then_ok_after(Duration::from_millis(50), "token1");
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock());

            let (first, second) = tokio::join!(cache.fetch(), cache.fetch());

            assert_eq!(*first.unwrap(), "token1");
            assert_eq!(*second.unwrap(), "token1");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn waiters_share_result_even_when_immediately_stale() {
            let source = ScriptedSource::new().then_ok_after(Duration::from_millis(20), "token1");
            let calls = source.calls();
            let cache = TokenCache::new(source).with_clock(clock());

            let (a, b, c) = tokio::join!(cache.fetch(), cache.fetch(), cache.fetch());
            let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

            assert!(Arc::ptr_eq(&a, &b));
            assert!(Arc::ptr_eq(&b, &c));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn requests_token_once_across_threads() {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let cache = TokenCache::new(sources::from_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, FetchFailed>(String::from("token1"))
                }
            }))
            .with_max_age(DurationMillis::from_secs(60));

            let tasks: Vec<_> = (0..16)
                .map(|_| {
                    let cache = cache.clone();
                    tokio::spawn(async move { cache.fetch().await })
                })
                .collect();

            for task in tasks {
                assert_eq!(*task.await.unwrap().unwrap(), "token1");
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn abandoned_request_does_not_block_later_callers() {
            let source = ScriptedSource::new()
                .then_ok_after(Duration::from_millis(200), "token1")
                .then_ok("token2");
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock());

            let abandoned =
                tokio::time::timeout(Duration::from_millis(10), cache.fetch()).await;
            assert!(abandoned.is_err());

            assert_eq!(*cache.fetch().await.unwrap(), "token2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }
    }

    mod when_source_fails {
        use super::*;

        #[tokio::test]
        async fn error_is_propagated_verbatim() {
            let calls = Arc::new(AtomicUsize::new(0));
            let cache = TokenCache::new(failing_source(Arc::clone(&calls)))
                .with_max_age(DurationMillis(100))
                .with_clock(clock());

            for _ in 0..3 {
                let err = cache.fetch().await.unwrap_err();
                assert_eq!(err.to_string(), "unable to fetch token");
            }
        }

        #[tokio::test]
        async fn waiters_share_the_failure_and_next_fetch_retries() {
            let calls = Arc::new(AtomicUsize::new(0));
            let cache = TokenCache::new(failing_source(Arc::clone(&calls)))
                .with_max_age(DurationMillis(100))
                .with_clock(clock());

            let (first, second) = tokio::join!(cache.fetch(), cache.fetch());
            let (first, second) = (first.unwrap_err(), second.unwrap_err());

            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            cache.fetch().await.unwrap_err();
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn late_arrivals_share_the_outstanding_failure() {
            let calls = Arc::new(AtomicUsize::new(0));
            let cache = TokenCache::new(failing_source(Arc::clone(&calls)))
                .with_max_age(DurationMillis(100))
                .with_clock(clock());

            let (first, second, third) = tokio::join!(
                cache.fetch(),
                async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    cache.fetch().await
                },
                async {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    cache.fetch().await
                },
            );
            let first = first.unwrap_err();

            assert!(Arc::ptr_eq(&first, &second.unwrap_err()));
            assert!(Arc::ptr_eq(&first, &third.unwrap_err()));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn failed_refresh_leaves_stored_token_in_place() {
            let clock = clock();
            let source = ScriptedSource::new()
                .then_ok("token1")
                .then_err_after(Duration::ZERO)
                .then_ok("token2");
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock.clone());

            cache.fetch().await.unwrap();
            let expires_at = cache.expires_at();

            clock.advance(DurationMillis(150));
            cache.fetch().await.unwrap_err();
            assert_eq!(cache.expires_at(), expires_at);

            assert_eq!(*cache.fetch().await.unwrap(), "token2");
        }
    }

    mod when_reset {
        use super::*;

        #[tokio::test]
        async fn next_fetch_requests_new_token() {
            let source = ScriptedSource::new()
                .then_ok(Grant {
                    access_token: "token1",
                    expires_in: 50,
                })
                .then_ok(Grant {
                    access_token: "token2",
                    expires_in: 100,
                });
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age_fn(|g: &Grant| DurationMillis(g.expires_in))
                .with_clock(clock());

            assert_eq!(cache.fetch().await.unwrap().access_token, "token1");
            cache.reset();
            assert_eq!(cache.expires_at(), None);
            assert_eq!(cache.fetch().await.unwrap().access_token, "token2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn outstanding_request_still_stores_its_token() {
            let source = ScriptedSource::new().then_ok_after(Duration::from_millis(30), "token1");
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock());

            let (token, ()) = tokio::join!(cache.fetch(), async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cache.reset();
            });

            assert_eq!(*token.unwrap(), "token1");
            assert_eq!(cache.peek().as_deref(), Some(&"token1"));
            assert_eq!(*cache.fetch().await.unwrap(), "token1");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    mod when_cloned {
        use super::*;

        #[tokio::test]
        async fn clones_share_the_stored_token() {
            let source = ScriptedSource::new().then_ok("token1").then_ok("token2");
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock());
            let other = cache.clone();

            let first = cache.fetch().await.unwrap();
            let second = other.fetch().await.unwrap();

            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(other.expires_at(), cache.expires_at());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn reset_through_one_clone_is_seen_by_all() {
            let source = ScriptedSource::new().then_ok("token1").then_ok("token2");
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock());
            let other = cache.clone();

            assert_eq!(*cache.fetch().await.unwrap(), "token1");
            other.reset();

            assert!(cache.peek().is_none());
            assert_eq!(*cache.fetch().await.unwrap(), "token2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn clones_share_a_single_flight() {
            let source = ScriptedSource::new().then_ok_after(Duration::from_millis(20), "token1");
            let calls = source.calls();
            let cache = TokenCache::new(source)
                .with_max_age(DurationMillis(100))
                .with_clock(clock());
            let other = cache.clone();

            let (first, second) = tokio::join!(cache.fetch(), other.fetch());

            assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    mod when_layered {
        use super::*;

        #[tokio::test]
        async fn cache_can_serve_as_a_source() {
            let source = ScriptedSource::new().then_ok("token1");
            let calls = source.calls();
            let inner = TokenCache::new(source)
                .with_max_age(DurationMillis(1_000))
                .with_clock(clock());
            let outer = TokenCache::new(inner).with_clock(clock());

            assert_eq!(**outer.fetch().await.unwrap(), "token1");
            assert_eq!(**outer.fetch().await.unwrap(), "token1");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn debug_does_not_reveal_token() {
        let cache = TokenCache::new(ConstTokenSource::<String>::new("secret")).with_clock(clock());
        let rendered = format!("{cache:?}");
        assert!(rendered.starts_with("TokenCache {"));
        assert!(!rendered.contains("secret"));
    }
}
