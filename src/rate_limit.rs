//! Sliding-window quotas per client and endpoint category.
//!
//! Windows live in a [`DashMap`] keyed by [`ClientKey`], so checks for
//! different clients only contend when they hash to the same shard. A
//! denial on a sensitive category (login, admin) blocks the whole address
//! for `block_duration`, across every category.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::client::ClientKey;
use crate::config::{CategoryRule, DEFAULT_CATEGORY, RateLimitConfig};
use crate::error::{AdmissionError, ConfigError};

/// Informational projection of a client's quota, rendered as response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which the oldest counted request leaves the window.
    pub reset: i64,
    pub window_secs: u64,
}

pub struct RateLimiter {
    categories: HashMap<String, CategoryRule>,
    default_rule: CategoryRule,
    exact_routes: HashMap<String, String>,
    // longest prefix first
    prefix_routes: Vec<(String, String)>,
    block_duration: Duration,
    windows: DashMap<ClientKey, VecDeque<Instant>>,
    blocked: DashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let categories: HashMap<String, CategoryRule> = config
            .categories
            .into_iter()
            .map(|rule| (rule.name.clone(), rule))
            .collect();
        let default_rule = categories
            .get(DEFAULT_CATEGORY)
            .cloned()
            .ok_or(ConfigError::MissingDefault)?;

        let mut exact_routes = HashMap::new();
        let mut prefix_routes = Vec::new();
        for route in config.routes {
            if route.prefix {
                prefix_routes.push((route.path, route.category));
            } else {
                exact_routes.insert(route.path, route.category);
            }
        }
        prefix_routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Ok(Self {
            categories,
            default_rule,
            exact_routes,
            prefix_routes,
            block_duration: config.block_duration,
            windows: DashMap::new(),
            blocked: DashMap::new(),
        })
    }

    /// Category for an endpoint path. Exact routes win over prefixes.
    pub fn resolve_category(&self, path: &str) -> &str {
        if let Some(category) = self.exact_routes.get(path) {
            return category;
        }
        self.prefix_routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, category)| category.as_str())
            .unwrap_or(DEFAULT_CATEGORY)
    }

    pub fn rule(&self, category: &str) -> &CategoryRule {
        self.categories.get(category).unwrap_or(&self.default_rule)
    }

    pub fn check(&self, key: &ClientKey) -> Result<(), AdmissionError> {
        self.check_at(key, Instant::now())
    }

    /// Admission decision as of `now`. Allowed checks are recorded.
    pub fn check_at(&self, key: &ClientKey, now: Instant) -> Result<(), AdmissionError> {
        if let Some(until) = self.blocked_until(&key.address, now) {
            debug!(client = %key, "rejected, address blocked");
            return Err(AdmissionError::TemporarilyBlocked {
                address: key.address.clone(),
                retry_after: until - now,
            });
        }

        let rule = self.rule(&key.category);
        let window = rule.window();

        let mut entries = self.windows.entry(key.clone()).or_default();
        evict_expired(&mut entries, now, window);

        if entries.len() >= rule.limit as usize {
            let retry_after = entries
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            // release the shard before touching the block table
            drop(entries);

            if rule.sensitive {
                self.blocked
                    .insert(key.address.clone(), now + self.block_duration);
                warn!(
                    address = %key.address,
                    category = %rule.name,
                    block_secs = self.block_duration.as_secs(),
                    "sensitive quota exceeded, blocking address"
                );
            }
            return Err(AdmissionError::RateLimited {
                category: rule.name.clone(),
                limit: rule.limit,
                window,
                retry_after,
            });
        }

        entries.push_back(now);
        Ok(())
    }

    pub fn headers(&self, key: &ClientKey) -> RateLimitHeaders {
        self.headers_at(key, Instant::now())
    }

    /// Read-only view of the quota; never records or evicts.
    pub fn headers_at(&self, key: &ClientKey, now: Instant) -> RateLimitHeaders {
        let rule = self.rule(&key.category);
        let window = rule.window();

        let (count, oldest) = match self.windows.get(key) {
            Some(entries) => {
                let live: Vec<Instant> = entries
                    .iter()
                    .copied()
                    .filter(|t| now.duration_since(*t) < window)
                    .collect();
                (live.len(), live.first().copied())
            }
            None => (0, None),
        };

        let until_reset = oldest
            .map(|t| window.saturating_sub(now.duration_since(t)))
            .unwrap_or(window);

        RateLimitHeaders {
            limit: rule.limit,
            remaining: rule.limit.saturating_sub(count as u32),
            reset: Utc::now().timestamp() + until_reset.as_secs_f64().ceil() as i64,
            window_secs: rule.window_secs,
        }
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.blocked_until(address, Instant::now()).is_some()
    }

    /// Lift a block early. Returns whether one was in place.
    pub fn unblock(&self, address: &str) -> bool {
        self.blocked.remove(address).is_some()
    }

    /// Number of client keys currently holding a window.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop windows with nothing left inside them and expired blocks.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len() + self.blocked.len();
        self.windows.retain(|key, entries| {
            evict_expired(entries, now, self.rule(&key.category).window());
            !entries.is_empty()
        });
        self.blocked.retain(|_, until| *until > now);
        let removed = before.saturating_sub(self.windows.len() + self.blocked.len());
        if removed > 0 {
            debug!(removed, remaining = self.windows.len(), "swept idle rate limit state");
        }
        removed
    }

    fn blocked_until(&self, address: &str, now: Instant) -> Option<Instant> {
        let until = self.blocked.get(address).map(|entry| *entry)?;
        if until > now {
            return Some(until);
        }
        self.blocked.remove_if(address, |_, until| *until <= now);
        None
    }
}

fn evict_expired(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = entries.front() {
        if now.duration_since(*front) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteRule;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            categories: vec![
                CategoryRule::new(DEFAULT_CATEGORY, 5, 60),
                CategoryRule::new("chat", 3, 60),
                CategoryRule::new("login", 2, 300).sensitive(),
            ],
            routes: vec![
                RouteRule::exact("/api/auth/login", "login"),
                RouteRule::prefix("/api/", "chat"),
                RouteRule::prefix("/api/auth/", "login"),
            ],
            block_duration: Duration::from_secs(3600),
        })
        .unwrap()
    }

    #[test]
    fn denies_after_limit_within_window() {
        let limiter = limiter();
        let key = ClientKey::new("10.0.0.1", "chat");
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at(&key, now).is_ok());
        }
        let err = limiter.check_at(&key, now).unwrap_err();
        assert!(matches!(err, AdmissionError::RateLimited { limit: 3, .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn allows_again_once_window_elapses() {
        let limiter = limiter();
        let key = ClientKey::new("10.0.0.1", "chat");
        let start = Instant::now();

        for _ in 0..3 {
            limiter.check_at(&key, start).unwrap();
        }
        assert!(limiter.check_at(&key, start + Duration::from_secs(59)).is_err());
        assert!(limiter.check_at(&key, start + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn sensitive_denial_blocks_every_category() {
        let limiter = limiter();
        let login = ClientKey::new("10.0.0.9", "login");
        let chat = ClientKey::new("10.0.0.9", "chat");
        let now = Instant::now();

        limiter.check_at(&login, now).unwrap();
        limiter.check_at(&login, now).unwrap();
        assert!(matches!(
            limiter.check_at(&login, now),
            Err(AdmissionError::RateLimited { .. })
        ));

        // chat has untouched quota but the address is blocked
        let err = limiter.check_at(&chat, now).unwrap_err();
        assert!(matches!(err, AdmissionError::TemporarilyBlocked { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3600)));

        let later = now + Duration::from_secs(3601);
        assert!(limiter.check_at(&chat, later).is_ok());
    }

    #[test]
    fn non_sensitive_denial_does_not_block() {
        let limiter = limiter();
        let chat = ClientKey::new("10.0.0.2", "chat");
        let other = ClientKey::new("10.0.0.2", DEFAULT_CATEGORY);
        let now = Instant::now();

        for _ in 0..4 {
            let _ = limiter.check_at(&chat, now);
        }
        assert!(!limiter.is_blocked("10.0.0.2"));
        assert!(limiter.check_at(&other, now).is_ok());
    }

    #[test]
    fn unmatched_category_uses_default_rule() {
        let limiter = limiter();
        let key = ClientKey::new("10.0.0.3", "reports");
        let now = Instant::now();
        for _ in 0..5 {
            limiter.check_at(&key, now).unwrap();
        }
        assert!(limiter.check_at(&key, now).is_err());
    }

    #[test]
    fn exact_route_beats_prefix_and_longest_prefix_wins() {
        let limiter = limiter();
        assert_eq!(limiter.resolve_category("/api/auth/login"), "login");
        assert_eq!(limiter.resolve_category("/api/auth/refresh"), "login");
        assert_eq!(limiter.resolve_category("/api/generate"), "chat");
        assert_eq!(limiter.resolve_category("/health"), DEFAULT_CATEGORY);
    }

    #[test]
    fn headers_do_not_consume_quota() {
        let limiter = limiter();
        let key = ClientKey::new("10.0.0.4", "chat");
        let now = Instant::now();

        limiter.check_at(&key, now).unwrap();
        let first = limiter.headers_at(&key, now);
        let second = limiter.headers_at(&key, now);
        assert_eq!(first.remaining, 2);
        assert_eq!(second.remaining, 2);
        assert_eq!(first.limit, 3);
        assert_eq!(first.window_secs, 60);
        assert!(first.reset >= Utc::now().timestamp());

        limiter.check_at(&key, now).unwrap();
        limiter.check_at(&key, now).unwrap();
        let _ = limiter.check_at(&key, now);
        assert_eq!(limiter.headers_at(&key, now).remaining, 0);
    }

    #[test]
    fn sweep_drops_idle_keys_and_expired_blocks() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.check_at(&ClientKey::new("a", "chat"), now).unwrap();
        limiter.check_at(&ClientKey::new("b", "chat"), now).unwrap();
        for _ in 0..3 {
            let _ = limiter.check_at(&ClientKey::new("c", "login"), now);
        }
        assert_eq!(limiter.tracked_keys(), 3);

        assert_eq!(limiter.sweep_at(now + Duration::from_secs(30)), 0);
        // chat windows expired, login window (300s) still live
        assert_eq!(limiter.sweep_at(now + Duration::from_secs(61)), 2);
        assert_eq!(limiter.tracked_keys(), 1);

        assert_eq!(limiter.sweep_at(now + Duration::from_secs(3601)), 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn unblock_lifts_block() {
        let limiter = limiter();
        let login = ClientKey::new("10.0.0.5", "login");
        for _ in 0..3 {
            let _ = limiter.check(&login);
        }
        assert!(limiter.is_blocked("10.0.0.5"));
        assert!(limiter.unblock("10.0.0.5"));
        assert!(!limiter.is_blocked("10.0.0.5"));
    }
}
