//! Token sources

use async_trait::async_trait;
use std::{convert::Infallible, error, fmt, future::Future};

/// An asynchronous source for tokens
///
/// A source is the underlying fetch operation that a
/// [`TokenCache`][crate::TokenCache] deduplicates. The cache holds the source
/// exclusively while a request is outstanding, so implementations may freely
/// mutate their own state.
#[async_trait]
pub trait AsyncTokenSource: Send + Sync {
    /// The token produced by this source
    type Token: Send + Sync + 'static;

    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a token from an asynchronous source
    async fn request_token(&mut self) -> Result<Self::Token, Self::Error>;
}

/// A token source backed by an asynchronous function
///
/// Construct with [`from_fn`].
pub struct FnTokenSource<F> {
    f: F,
}

/// Wraps an asynchronous function as a token source
///
/// ```
/// use latchkey_tokens::sources::{self, AsyncTokenSource};
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() {
/// let mut source = sources::from_fn(|| async { Ok::<_, std::io::Error>("token") });
/// assert_eq!(source.request_token().await.unwrap(), "token");
/// # }
/// ```
pub fn from_fn<F, Fut, T, E>(f: F) -> FnTokenSource<F>
where
    F: FnMut() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send + Sync + 'static,
    E: error::Error + Send + Sync + 'static,
{
    FnTokenSource { f }
}

impl<F> fmt::Debug for FnTokenSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnTokenSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, T, E> AsyncTokenSource for FnTokenSource<F>
where
    F: FnMut() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send + Sync + 'static,
    E: error::Error + Send + Sync + 'static,
{
    type Token = T;
    type Error = E;

    async fn request_token(&mut self) -> Result<T, E> {
        (self.f)().await
    }
}

/// A token source that always returns the same token
#[derive(Clone, Debug)]
pub struct ConstTokenSource<T> {
    token: T,
}

impl<T> ConstTokenSource<T> {
    /// Constructs a source that hands out clones of `token`
    pub fn new(token: impl Into<T>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl<T> AsyncTokenSource for ConstTokenSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Token = T;
    type Error = Infallible;

    async fn request_token(&mut self) -> Result<T, Infallible> {
        Ok(self.token.clone())
    }
}
