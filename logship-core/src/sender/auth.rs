//! Authorization token supply

use chrono::{DateTime, Utc};
use std::sync::RwLock;

/// Supplies the bearer token attached to ingestion requests.
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` to send the request without authorization.
    fn token(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Shared, settable token cache.
///
/// One writer (the host's sign-in flow) sets or clears the token; any number
/// of senders read it. Expired tokens are never handed out.
#[derive(Debug, Default)]
pub struct TokenCache {
    current: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token, optionally valid only until `expires_at`.
    pub fn set(&self, value: impl Into<String>, expires_at: Option<DateTime<Utc>>) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(CachedToken {
                value: value.into(),
                expires_at,
            });
        }
    }

    /// Forget the current token (sign-out).
    pub fn clear(&self) {
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
    }

    /// Return the cache to its initial state, even if a writer panicked.
    pub fn reset(&self) {
        match self.current.write() {
            Ok(mut current) => *current = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    /// Expiry of the current token, if any.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.current
            .read()
            .ok()
            .and_then(|c| c.as_ref().and_then(|t| t.expires_at))
    }
}

impl TokenProvider for TokenCache {
    fn token(&self) -> Option<String> {
        let current = self.current.read().ok()?;
        let token = current.as_ref()?;
        match token.expires_at {
            Some(expires_at) if expires_at <= Utc::now() => None,
            _ => Some(token.value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_and_clear() {
        let cache = TokenCache::new();
        assert!(cache.token().is_none());

        cache.set("tok-1", None);
        assert_eq!(cache.token().as_deref(), Some("tok-1"));

        cache.set("tok-2", Some(Utc::now() + Duration::hours(1)));
        assert_eq!(cache.token().as_deref(), Some("tok-2"));
        assert!(cache.expires_at().is_some());

        cache.clear();
        assert!(cache.token().is_none());
    }

    #[test]
    fn test_expired_token_is_hidden() {
        let cache = TokenCache::new();
        cache.set("old", Some(Utc::now() - Duration::seconds(1)));
        assert!(cache.token().is_none());
    }

    #[test]
    fn test_reset() {
        let cache = TokenCache::new();
        cache.set("tok", None);
        cache.reset();
        assert!(cache.token().is_none());
        assert!(cache.expires_at().is_none());
    }
}
