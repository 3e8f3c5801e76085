//! Middleware to automatically attach authorization to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to resolve a
//! credential for each outbound request and write it into a header. The
//! credential comes from a [`TokenSource`], which is either a static value or
//! an asynchronous fetch, typically a [`TokenCache`].
//!
//! By default the credential is written to the `Authorization` header as
//! `Bearer <token>`, replacing any value already present.
//!
//! ```
//! use latchkey_clock::DurationMillis;
//! use latchkey_reqwest::AccessTokenMiddleware;
//! use latchkey_tokens::{sources, TokenCache};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! let cache = TokenCache::new(sources::from_fn(|| async {
//!     Ok::<_, std::io::Error>(String::from("token"))
//! }))
//! .with_max_age(DurationMillis::from_secs(300));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(cache.clone()))
//!     .build();
//!
//! // Clones share the stored token, so the kept clone can force a refresh
//! cache.reset();
//! ```
//!
//! Both the header and the way the credential is rendered into it can be
//! changed. This is useful when the credential is a structured value:
//!
//! ```
//! use latchkey_reqwest::{AccessTokenMiddleware, TokenSource};
//! use latchkey_tokens::TokenResponse;
//! use reqwest::header::HeaderName;
//!
//! let middleware = AccessTokenMiddleware::with_formatter(
//!     TokenSource::from_static(TokenResponse::new("abc", None)),
//!     |t: &TokenResponse| format!("Token {}", t.access_token),
//! )
//! .with_header(HeaderName::from_static("x-api-key"));
//! ```
//!
//! The middleware can also be configured to add a credential only
//! conditionally. This can be useful in the event that you want to use a
//! single common middleware stack with multiple potential backends and want to
//! ensure that specific credentials are used for specific backends.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a credential to a request.
//!
//! ```
//! use latchkey_reqwest::{AccessTokenMiddleware, AllowedHosts, HttpsOnly, TokenSource};
//! use predicates::prelude::PredicateBooleanExt;
//!
//! AccessTokenMiddleware::new(TokenSource::from_static(String::from("token")))
//!     .with_predicate(HttpsOnly.and(AllowedHosts::new(["api.example.com"])));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{error, fmt, future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use latchkey_clock::Clock;
use latchkey_tokens::{AsyncTokenSource, TokenCache};
use predicates::{prelude::*, reflection};
use reqwest::{
    header::{self, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue},
    Request, Response,
};
use reqwest_middleware::{Middleware, Next};

/// A boxed error produced while resolving a credential
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

type TokenFuture<T> = Pin<Box<dyn Future<Output = Result<Arc<T>, BoxError>> + Send>>;

type FetchFn<T> = dyn Fn() -> TokenFuture<T> + Send + Sync;

type Formatter<T> = dyn Fn(&T) -> String + Send + Sync;

/// Where the credential attached to each request comes from
pub enum TokenSource<T> {
    /// A fixed credential, used as-is
    Static(Arc<T>),
    /// A credential obtained anew for each request
    Fetch(Arc<FetchFn<T>>),
}

impl<T> TokenSource<T> {
    /// A source that always yields `token`
    pub fn from_static(token: T) -> Self {
        Self::Static(Arc::new(token))
    }

    /// A source that calls `f` for each request
    pub fn from_fn<F, Fut, E>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        T: 'static,
    {
        Self::Fetch(Arc::new(move || -> TokenFuture<T> {
            let fut = f();
            Box::pin(async move {
                fut.await
                    .map(Arc::new)
                    .map_err(Into::<BoxError>::into)
            })
        }))
    }

    /// Resolves the current credential
    ///
    /// # Errors
    ///
    /// Returns the fetch error unmodified if the credential could not be
    /// obtained.
    pub async fn resolve(&self) -> Result<Arc<T>, BoxError> {
        match self {
            Self::Static(token) => Ok(Arc::clone(token)),
            Self::Fetch(fetch) => fetch().await,
        }
    }
}

impl<S, C> From<TokenCache<S, C>> for TokenSource<S::Token>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Fetches through the cache on each request
    ///
    /// Keep a clone of the cache to [`reset()`][TokenCache::reset] it later.
    fn from(cache: TokenCache<S, C>) -> Self {
        let cache = Arc::new(cache);
        Self::Fetch(Arc::new(move || -> TokenFuture<S::Token> {
            let cache = Arc::clone(&cache);
            Box::pin(async move { cache.fetch().await.map_err(BoxError::from) })
        }))
    }
}

impl<T> Clone for TokenSource<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(token) => Self::Static(Arc::clone(token)),
            Self::Fetch(fetch) => Self::Fetch(Arc::clone(fetch)),
        }
    }
}

impl<T> fmt::Debug for TokenSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("Static(***)"),
            Self::Fetch(_) => f.write_str("Fetch(..)"),
        }
    }
}

/// An error while attaching a credential to a request
#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    /// The credential could not be obtained
    #[error("{0}")]
    Token(#[source] BoxError),
    /// The formatted credential cannot be used as a header value
    #[error("formatted credential is not a valid header value")]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
}

/// Formats a credential as a bearer token, `Bearer <token>`
pub fn bearer<T: AsRef<str> + ?Sized>(token: &T) -> String {
    let token = token.as_ref();
    let mut value = String::with_capacity(token.len() + 7);
    value.push_str("Bearer ");
    value.push_str(token);
    value
}

/// A middleware that injects a credential into outgoing requests
pub struct AccessTokenMiddleware<T, P = AlwaysAttach> {
    token_source: TokenSource<T>,
    header: HeaderName,
    formatter: Arc<Formatter<T>>,
    predicate: P,
}

impl<T> AccessTokenMiddleware<T, AlwaysAttach>
where
    T: AsRef<str> + Send + Sync + 'static,
{
    /// Construct a new middleware from a token source
    ///
    /// The credential is written to the `Authorization` header as a bearer
    /// token on every request. To change this behavior, see
    /// [`with_header()`][Self::with_header()],
    /// [`with_header_formatter()`][Self::with_header_formatter()] and
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(token_source: impl Into<TokenSource<T>>) -> Self {
        Self::with_formatter(token_source, bearer::<T>)
    }
}

impl<T> AccessTokenMiddleware<T, AlwaysAttach> {
    /// Construct a new middleware that renders credentials with `formatter`
    pub fn with_formatter<F>(token_source: impl Into<TokenSource<T>>, formatter: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        Self {
            token_source: token_source.into(),
            header: header::AUTHORIZATION,
            formatter: Arc::new(formatter),
            predicate: AlwaysAttach,
        }
    }
}

impl<T, P> AccessTokenMiddleware<T, P> {
    /// Replaces the header the credential is written to
    pub fn with_header(self, header: HeaderName) -> Self {
        Self { header, ..self }
    }

    /// Replaces the function that renders the credential into a header value
    pub fn with_header_formatter<F>(self, formatter: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        Self {
            formatter: Arc::new(formatter),
            ..self
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> AccessTokenMiddleware<T, Q> {
        AccessTokenMiddleware {
            token_source: self.token_source,
            header: self.header,
            formatter: self.formatter,
            predicate,
        }
    }

    /// The header the credential is written to
    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    async fn header_value(&self) -> Result<HeaderValue, AuthorizationError> {
        let token = self
            .token_source
            .resolve()
            .await
            .map_err(AuthorizationError::Token)?;

        let formatted = (self.formatter)(&*token);
        let mut value = HeaderValue::from_maybe_shared(Bytes::from(formatted))?;
        value.set_sensitive(true);

        tracing::trace!(header = %self.header, "obtained credential");
        Ok(value)
    }

    /// Writes the credential into `headers`, replacing any existing value
    ///
    /// # Errors
    ///
    /// Fails if the credential could not be obtained or if its formatted
    /// form is not a valid header value. `headers` is left unmodified.
    pub async fn apply(&self, headers: &mut HeaderMap) -> Result<(), AuthorizationError> {
        let value = self.header_value().await?;
        headers.insert(self.header.clone(), value);
        Ok(())
    }

    /// Writes the credential into the request's headers and returns the request
    ///
    /// # Errors
    ///
    /// Fails if the credential could not be obtained or if its formatted
    /// form is not a valid header value.
    pub async fn decorate(&self, mut req: Request) -> Result<Request, AuthorizationError> {
        self.apply(req.headers_mut()).await?;
        Ok(req)
    }
}

impl<T, P: Clone> Clone for AccessTokenMiddleware<T, P> {
    fn clone(&self) -> Self {
        Self {
            token_source: self.token_source.clone(),
            header: self.header.clone(),
            formatter: Arc::clone(&self.formatter),
            predicate: self.predicate.clone(),
        }
    }
}

impl<T, P: fmt::Debug> fmt::Debug for AccessTokenMiddleware<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenMiddleware")
            .field("token_source", &self.token_source)
            .field("header", &self.header)
            .field("predicate", &self.predicate)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<T, P> Middleware for AccessTokenMiddleware<T, P>
where
    T: Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let req = if self.predicate.eval(&req) {
            self.decorate(req)
                .await
                .map_err(reqwest_middleware::Error::middleware)?
        } else {
            tracing::trace!(url = %req.url(), "predicate declined to attach credential");
            req
        };

        next.run(req, extensions).await
    }
}

/// Attach a credential to every request
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAttach;

impl Predicate<Request> for AlwaysAttach {
    #[inline]
    fn eval(&self, _: &Request) -> bool {
        true
    }
}

impl reflection::PredicateReflection for AlwaysAttach {}
impl fmt::Display for AlwaysAttach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("always")
    }
}

/// Only attach a credential to requests sent over HTTPS
///
/// Keeps credentials off plaintext connections.
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach a credential to requests for hosts the credential is meant for
///
/// A middleware stack is often shared by clients of several backends. Scoping
/// the credential to its audience keeps it from being sent to the others.
#[derive(Clone, Debug)]
pub struct AllowedHosts {
    hosts: Vec<String>,
}

impl AllowedHosts {
    /// Allows exactly the given hosts
    pub fn new<I>(hosts: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    /// Adds another host to the allowed set
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    fn allows(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

impl Predicate<Request> for AllowedHosts {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str().map_or(false, |host| self.allows(host))
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            let host = req.url().host_str().unwrap_or("<none>").to_owned();
            reflection::Case::new(Some(self), result)
                .add_product(reflection::Product::new("host", host))
        })
    }
}

impl reflection::PredicateReflection for AllowedHosts {}
impl fmt::Display for AllowedHosts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host in [{}]", self.hosts.join(", "))
    }
}
