use latchkey_clock::DurationMillis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A token body as returned by an OAuth2-style token endpoint
///
/// Useful as the token type of a [`TokenCache`][crate::TokenCache] when the
/// issuing authority declares the token's lifetime:
///
/// ```
/// use latchkey_tokens::{sources, TokenCache, TokenResponse};
///
/// let cache = TokenCache::new(sources::from_fn(|| async {
///     serde_json::from_str::<TokenResponse>(r#"{"access_token":"abc","expires_in":3600}"#)
/// }))
/// .with_max_age_fn(TokenResponse::expires_in);
/// ```
///
/// Formatting with `{:?}` does not reveal the access token unless the
/// alternate flag is given, in which case only a short prefix is shown.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The access token
    pub access_token: String,

    /// The type of token, usually `Bearer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// The lifetime of the token in seconds, if declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Constructs a token body with a declared lifetime in seconds
    pub fn new(access_token: impl Into<String>, expires_in: Option<u64>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: None,
            expires_in,
        }
    }

    /// How long the token may be reused, according to the issuing authority
    ///
    /// A token without a declared lifetime is treated as immediately stale.
    pub fn expires_in(&self) -> DurationMillis {
        self.expires_in
            .map(DurationMillis::from_secs)
            .unwrap_or(DurationMillis::ZERO)
    }
}

impl AsRef<str> for TokenResponse {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &Redacted(&self.access_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

struct Redacted<'a>(&'a str);

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const REVEALED: usize = 4;

        if !f.alternate() {
            return f.write_str("***ACCESS TOKEN***");
        }

        match self.0.char_indices().nth(REVEALED) {
            Some((idx, _)) => write!(f, "\"{}…\"", &self.0[..idx]),
            None => f.write_str("\"…\""),
        }
    }
}
