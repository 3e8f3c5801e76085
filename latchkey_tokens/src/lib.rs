//! Single-flight caching of access tokens
//!
//! Clients that attach credentials to outgoing requests often obtain those
//! credentials from a remote authority. Asking the authority for a new token
//! on every request is wasteful, and when many requests start at once, they
//! would all ask at the same time.
//!
//! A [`TokenCache`] sits in front of an [`AsyncTokenSource`] and solves both
//! problems. It keeps the most recent token until it expires, and when a new
//! token is needed, it makes sure that only one request to the source is
//! outstanding. Everyone who asked in the meantime receives the result of that
//! one request, including any error.
//!
//! How long a token may be reused is determined by an [`ExpiryPolicy`], which
//! either applies a fixed maximum age or derives one from each token, for
//! example from a server-declared `expires_in`.
//!
//! ```
//! use latchkey_clock::DurationMillis;
//! use latchkey_tokens::{sources, TokenCache};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = TokenCache::new(sources::from_fn(|| async {
//!     // Ask the issuing authority for a token here
//!     Ok::<_, std::io::Error>(String::from("my-token"))
//! }))
//! .with_max_age(DurationMillis::from_secs(300));
//!
//! let token = cache.fetch().await?;
//! assert_eq!(token.as_str(), "my-token");
//!
//! // Forget the token, such as after the authority has rejected it
//! cache.reset();
//! # Ok(())
//! # }
//! ```
//!
//! Expiry is evaluated lazily whenever a token is requested. Nothing is
//! refreshed in the background, tokens are never persisted, and failed requests
//! are not retried; the next call to [`fetch()`][TokenCache::fetch] after a
//! failure simply asks the source again.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod cache;
mod lifetime;
pub mod sources;
mod tokens;

pub use cache::TokenCache;
pub use lifetime::ExpiryPolicy;
pub use sources::AsyncTokenSource;
pub use tokens::TokenResponse;
