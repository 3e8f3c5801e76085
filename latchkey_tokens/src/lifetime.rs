use latchkey_clock::{DurationMillis, UnixTime};
use std::{fmt, sync::Arc};

type MaxAgeFn<T> = dyn Fn(&T) -> DurationMillis + Send + Sync;

/// Configuration for determining how long a fetched token may be reused
///
/// A policy either applies a fixed maximum age to every token or derives the
/// maximum age from the token itself, such as from a server-declared
/// `expires_in`. When both are configured, the derived age takes precedence.
/// With no configuration at all, tokens have a maximum age of zero and are
/// never reused.
///
/// ```
/// use latchkey_clock::DurationMillis;
/// use latchkey_tokens::ExpiryPolicy;
///
/// let fixed = ExpiryPolicy::<&str>::fixed(DurationMillis(100));
/// assert_eq!(fixed.compute_expiry(&"token"), DurationMillis(100));
///
/// let derived = ExpiryPolicy::from_fn(|t: &(&str, u64)| DurationMillis(t.1));
/// assert_eq!(derived.compute_expiry(&("token", 50)), DurationMillis(50));
/// ```
pub struct ExpiryPolicy<T> {
    max_age: DurationMillis,
    max_age_fn: Option<Arc<MaxAgeFn<T>>>,
}

impl<T> ExpiryPolicy<T> {
    /// Constructs a policy that treats tokens as immediately stale
    pub fn new() -> Self {
        Self {
            max_age: DurationMillis::ZERO,
            max_age_fn: None,
        }
    }

    /// Constructs a policy that applies the same maximum age to every token
    pub fn fixed(max_age: impl Into<DurationMillis>) -> Self {
        Self::new().with_max_age(max_age)
    }

    /// Constructs a policy that derives the maximum age from each token
    pub fn from_fn<F>(max_age_fn: F) -> Self
    where
        F: Fn(&T) -> DurationMillis + Send + Sync + 'static,
    {
        Self::new().with_max_age_fn(max_age_fn)
    }

    /// Sets the fixed maximum age
    ///
    /// Ignored if a derived maximum age has been configured.
    pub fn with_max_age(self, max_age: impl Into<DurationMillis>) -> Self {
        Self {
            max_age: max_age.into(),
            ..self
        }
    }

    /// Sets a function to derive the maximum age from a token
    pub fn with_max_age_fn<F>(self, max_age_fn: F) -> Self
    where
        F: Fn(&T) -> DurationMillis + Send + Sync + 'static,
    {
        Self {
            max_age_fn: Some(Arc::new(max_age_fn)),
            ..self
        }
    }

    /// Computes how long `token` may be reused
    pub fn compute_expiry(&self, token: &T) -> DurationMillis {
        match &self.max_age_fn {
            Some(f) => f(token),
            None => self.max_age,
        }
    }

    /// Computes the instant at which `token`, obtained at `obtained`, expires
    #[inline]
    pub fn expires_at(&self, obtained: UnixTime, token: &T) -> UnixTime {
        obtained + self.compute_expiry(token)
    }
}

impl<T> Default for ExpiryPolicy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ExpiryPolicy<T> {
    fn clone(&self) -> Self {
        Self {
            max_age: self.max_age,
            max_age_fn: self.max_age_fn.clone(),
        }
    }
}

impl<T> fmt::Debug for ExpiryPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = f.debug_struct("ExpiryPolicy");
        if self.max_age_fn.is_some() {
            s.field("max_age", &"<derived>");
        } else {
            s.field("max_age", &self.max_age);
        }
        s.finish()
    }
}
