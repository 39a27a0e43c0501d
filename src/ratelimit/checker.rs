//! Limit checks for each dimension.
//!
//! Path, user and user-path share one counter algorithm: the first hit of a key
//! starts a window of the configured length, later hits increment the count
//! and keep the remaining TTL of the stored entry. The window therefore ends a
//! fixed time after the first hit, not after the latest one.

use std::collections::BTreeSet;
use std::time::Duration;

use axum::extract::{MatchedPath, OriginalUri};
use axum::http::request::Parts;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use super::decision::{DimensionState, Quota};
use super::identity::{client_user, reach};
use super::settings::{Dimension, Limit, Settings};
use super::store::{Cached, Segment, StoredValue};
use crate::error::Result;
use crate::middleware::AuthFailure;

/// Number of hex characters kept from a rejected token's digest.
const TOKEN_DIGEST_LEN: usize = 6;

/// Request facts the checks key their counters on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Resolved client IP
    pub ip: String,
    /// Authenticated user, if any
    pub user: Option<String>,
    /// Full request path or route template
    pub path: String,
}

impl Subject {
    /// Gather the subject of `request` for `settings`.
    pub fn from_request(request: &Parts, settings: &Settings, ip: &str) -> Self {
        let template = request
            .extensions
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string());

        // nested routers strip their prefix from `uri`
        let path = match template {
            Some(template) if settings.ignore_path_params => template,
            _ => request
                .extensions
                .get::<OriginalUri>()
                .map_or(&request.uri, |original| &original.0)
                .path()
                .to_string(),
        };

        Self {
            ip: ip.to_string(),
            user: client_user(request, settings),
            path,
        }
    }

    /// Identity used by the user dimensions, or `None` when whitelisted.
    pub fn identity(&self, settings: &Settings) -> Option<&str> {
        let user_whitelisted = self
            .user
            .as_deref()
            .is_some_and(|user| settings.user_whitelist.contains(user));

        if settings.ip_whitelist.contains(&self.ip) || user_whitelisted {
            return None;
        }

        match &self.user {
            Some(user) if !settings.address_only => Some(user.as_str()),
            _ => Some(self.ip.as_str()),
        }
    }

    /// Counter key for `dimension`, or `None` when the client is exempt.
    pub fn key(&self, dimension: Dimension, settings: &Settings) -> Option<String> {
        match dimension {
            Dimension::Path => Some(self.path.clone()),
            Dimension::User => self.identity(settings).map(str::to_string),
            Dimension::UserPath => self
                .identity(settings)
                .map(|identity| format!("{}:{}", identity, self.path)),
            Dimension::Auth => Some(self.ip.clone()),
        }
    }
}

/// Count a request against one of the counted dimensions.
///
/// Disabled dimensions and whitelisted clients never touch the store.
pub async fn check_requests(
    dimension: Dimension,
    segment: &Segment,
    settings: &Settings,
    subject: &Subject,
) -> Result<DimensionState> {
    let Limit::Max(limit) = settings.limit(dimension) else {
        return Ok(DimensionState::Disabled);
    };

    let Some(key) = subject.key(dimension, settings) else {
        debug!(dimension = %dimension, ip = %subject.ip, "Whitelisted client, skipping limit");
        return Ok(DimensionState::Whitelisted);
    };

    let quota = increment(segment, &key, limit, settings.window(dimension)).await?;

    trace!(
        dimension = %dimension,
        key = %key,
        limit = quota.limit,
        remaining = quota.remaining,
        "Counted request"
    );

    Ok(DimensionState::Counted(quota))
}

async fn increment(segment: &Segment, key: &str, limit: u64, window: Duration) -> Result<Quota> {
    let (count, ttl) = match segment.get(key).await? {
        Some(Cached {
            value: StoredValue::Count(stored),
            ttl,
            stale: false,
        }) => (stored.saturating_add(1), ttl),
        _ => (1, window),
    };

    segment.set(key, StoredValue::Count(count), ttl).await?;

    Ok(Quota {
        limit,
        remaining: clamp_remaining(limit, count),
        reset_at: reset_at(ttl),
    })
}

/// Read-only gate: how many more distinct bad tokens this IP may present.
///
/// Nothing recorded for the IP leaves the dimension `Pending`.
pub async fn check_auth(segment: &Segment, settings: &Settings, ip: &str) -> Result<DimensionState> {
    let Limit::Max(limit) = settings.auth_limit else {
        return Ok(DimensionState::Disabled);
    };

    let state = match segment.get(ip).await? {
        Some(Cached {
            value: StoredValue::Tokens(tokens),
            ttl,
            stale: false,
        }) => {
            let distinct: BTreeSet<&String> = tokens.iter().collect();
            DimensionState::Counted(auth_quota(limit, distinct.len(), ttl))
        }
        _ => DimensionState::Pending,
    };

    Ok(state)
}

/// Record a rejected auth token for the IP.
///
/// Returns the allowance after recording, or `None` when the auth limit is
/// disabled or the failure carried no token.
pub async fn record_auth_failure(
    segment: &Segment,
    settings: &Settings,
    ip: &str,
    failure: &AuthFailure,
) -> Result<Option<Quota>> {
    let Limit::Max(limit) = settings.auth_limit else {
        return Ok(None);
    };

    let Some(token) = failed_auth_token(failure, &settings.auth_token) else {
        return Ok(None);
    };

    let digest = token_digest(&token);

    let (mut tokens, ttl) = match segment.get(ip).await? {
        Some(Cached {
            value: StoredValue::Tokens(stored),
            ttl,
            stale: false,
        }) => (stored.into_iter().collect::<BTreeSet<_>>(), ttl),
        _ => (BTreeSet::new(), settings.window(Dimension::Auth)),
    };
    tokens.insert(digest);

    let size = tokens.len();
    segment
        .set(ip, StoredValue::Tokens(tokens.into_iter().collect()), ttl)
        .await?;

    debug!(ip = %ip, tokens = size, limit = limit, "Recorded failed auth token");

    Ok(Some(auth_quota(limit, size, ttl)))
}

fn auth_quota(limit: u64, tokens: usize, ttl: Duration) -> Quota {
    Quota {
        limit,
        remaining: signed(limit) - signed(tokens as u64),
        reset_at: reset_at(ttl),
    }
}

/// Token presented by a failed authentication, looked up in the artifacts
/// first and the error data second.
pub fn failed_auth_token(failure: &AuthFailure, field: &str) -> Option<String> {
    [&failure.artifacts, &failure.error_data]
        .into_iter()
        .flatten()
        .filter_map(|source| reach(source, field))
        .find_map(|token| match token {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Short digest identifying a token without retaining it.
pub fn token_digest(token: &str) -> String {
    let mut digest = hex::encode(Sha1::digest(token.as_bytes()));
    digest.truncate(TOKEN_DIGEST_LEN);
    digest
}

fn clamp_remaining(limit: u64, count: u64) -> i64 {
    (signed(limit) - signed(count)).max(-1)
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn reset_at(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::identity::{IpWhitelist, UserWhitelist};
    use crate::ratelimit::store::{CounterStore, MemoryStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    /// Serves every key as a stale entry and remembers the TTLs written.
    #[derive(Default)]
    struct StaleStore {
        written: Mutex<Vec<(String, StoredValue, Duration)>>,
    }

    #[async_trait]
    impl CounterStore for StaleStore {
        async fn get(&self, segment: &str, _key: &str) -> Result<Option<Cached>> {
            let value = if segment == "auth" {
                StoredValue::Tokens(vec!["aaaaaa".to_string(), "bbbbbb".to_string()])
            } else {
                StoredValue::Count(40)
            };
            Ok(Some(Cached {
                value,
                ttl: Duration::from_millis(5),
                stale: true,
            }))
        }

        async fn set(
            &self,
            _segment: &str,
            key: &str,
            value: StoredValue,
            ttl: Duration,
        ) -> Result<()> {
            self.written.lock().push((key.to_string(), value, ttl));
            Ok(())
        }
    }

    fn segment(name: &str) -> Segment {
        Segment::new(Arc::new(MemoryStore::new()), name)
    }

    fn subject(user: Option<&str>) -> Subject {
        Subject {
            ip: "127.0.0.1".to_string(),
            user: user.map(str::to_string),
            path: "/users/123".to_string(),
        }
    }

    fn quota(state: DimensionState) -> Quota {
        *state.quota().expect("dimension was counted")
    }

    #[tokio::test]
    async fn test_path_counts_down_then_rejects() {
        let segment = segment("path");
        let settings = Settings {
            path_limit: Limit::Max(2),
            ..Settings::default()
        };
        let subject = subject(None);

        let mut remaining = Vec::new();
        for _ in 0..4 {
            let state = check_requests(Dimension::Path, &segment, &settings, &subject)
                .await
                .unwrap();
            remaining.push(quota(state).remaining);
        }

        assert_eq!(remaining, vec![1, 0, -1, -1]);
    }

    #[tokio::test]
    async fn test_ttl_inherited() {
        let segment = segment("path");
        let settings = Settings::default();
        let subject = subject(None);

        let first = quota(
            check_requests(Dimension::Path, &segment, &settings, &subject)
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = quota(
            check_requests(Dimension::Path, &segment, &settings, &subject)
                .await
                .unwrap(),
        );

        assert!((second.reset_at - first.reset_at).abs() <= 100);
    }

    #[tokio::test]
    async fn test_window_restarts_after_expiry() {
        let segment = segment("user");
        let settings = Settings {
            user_limit: Limit::Max(2),
            user_cache: crate::ratelimit::CacheSettings {
                expires_in: Some(50),
                ..Default::default()
            },
            ..Settings::default()
        };
        let subject = subject(Some("1"));

        for _ in 0..3 {
            check_requests(Dimension::User, &segment, &settings, &subject)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let state = check_requests(Dimension::User, &segment, &settings, &subject)
            .await
            .unwrap();
        assert_eq!(quota(state).remaining, 1);
    }

    #[tokio::test]
    async fn test_disabled_dimension_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let segment = Segment::new(store.clone(), "userPath");
        let settings = Settings::default();

        let state = check_requests(Dimension::UserPath, &segment, &settings, &subject(None))
            .await
            .unwrap();

        assert_eq!(state, DimensionState::Disabled);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_whitelisted_user_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let segment = Segment::new(store.clone(), "user");
        let settings = Settings {
            user_whitelist: UserWhitelist::new([1]),
            ..Settings::default()
        };

        let state = check_requests(Dimension::User, &segment, &settings, &subject(Some("1")))
            .await
            .unwrap();

        assert_eq!(state, DimensionState::Whitelisted);
        assert!(store.is_empty());
    }

    #[test]
    fn test_identity_rules() {
        let settings = Settings::default();
        assert_eq!(subject(Some("7")).identity(&settings), Some("7"));
        assert_eq!(subject(None).identity(&settings), Some("127.0.0.1"));

        let address_only = Settings {
            address_only: true,
            ..Settings::default()
        };
        assert_eq!(subject(Some("7")).identity(&address_only), Some("127.0.0.1"));

        let ip_whitelisted = Settings {
            ip_whitelist: IpWhitelist::new(["127.0.0.0/24"]),
            ..Settings::default()
        };
        assert_eq!(subject(Some("7")).identity(&ip_whitelisted), None);
    }

    #[test]
    fn test_user_path_key() {
        let settings = Settings::default();
        assert_eq!(
            subject(Some("7")).key(Dimension::UserPath, &settings),
            Some("7:/users/123".to_string())
        );
        assert_eq!(
            subject(None).key(Dimension::UserPath, &settings),
            Some("127.0.0.1:/users/123".to_string())
        );
    }

    #[test]
    fn test_token_digest() {
        // sha1("one") = fe05bcdcdc4928012781a5f1a2a77cbb5398e106
        assert_eq!(token_digest("one"), "fe05bc");
        assert_eq!(token_digest("one").len(), TOKEN_DIGEST_LEN);
    }

    #[test]
    fn test_failed_auth_token_lookup() {
        let failure = AuthFailure {
            artifacts: Some(json!({ "authToken": "abc" })),
            error_data: Some(json!({ "authToken": "ignored" })),
        };
        assert_eq!(failed_auth_token(&failure, "authToken"), Some("abc".to_string()));

        let failure = AuthFailure {
            artifacts: None,
            error_data: Some(json!({ "authToken": "from-error" })),
        };
        assert_eq!(
            failed_auth_token(&failure, "authToken"),
            Some("from-error".to_string())
        );

        let failure = AuthFailure {
            artifacts: Some(json!({ "authToken": "" })),
            error_data: None,
        };
        assert_eq!(failed_auth_token(&failure, "authToken"), None);
    }

    #[tokio::test]
    async fn test_auth_failures_accumulate_distinct_tokens() {
        let segment = segment("auth");
        let settings = Settings::default();

        assert_eq!(
            check_auth(&segment, &settings, "127.0.0.1").await.unwrap(),
            DimensionState::Pending
        );

        for token in ["one", "two", "two", "three"] {
            let failure = AuthFailure {
                artifacts: Some(json!({ "authToken": token })),
                error_data: None,
            };
            record_auth_failure(&segment, &settings, "127.0.0.1", &failure)
                .await
                .unwrap();
        }

        let state = check_auth(&segment, &settings, "127.0.0.1").await.unwrap();
        assert_eq!(quota(state).remaining, 2);
        assert_eq!(quota(state).limit, 5);
        assert_eq!(
            check_auth(&segment, &settings, "127.0.0.2").await.unwrap(),
            DimensionState::Pending
        );
    }

    #[tokio::test]
    async fn test_auth_failure_without_token_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let segment = Segment::new(store.clone(), "auth");

        let remaining = record_auth_failure(
            &segment,
            &Settings::default(),
            "127.0.0.1",
            &AuthFailure::default(),
        )
        .await
        .unwrap();

        assert_eq!(remaining, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_auth_disabled() {
        let store = Arc::new(MemoryStore::new());
        let segment = Segment::new(store.clone(), "auth");
        let settings = Settings {
            auth_limit: Limit::Disabled,
            ..Settings::default()
        };
        let failure = AuthFailure {
            artifacts: Some(json!({ "authToken": "one" })),
            error_data: None,
        };

        assert_eq!(
            record_auth_failure(&segment, &settings, "127.0.0.1", &failure)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            check_auth(&segment, &settings, "127.0.0.1").await.unwrap(),
            DimensionState::Disabled
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stale_counter_restarts_window() {
        let store = Arc::new(StaleStore::default());
        let segment = Segment::new(store.clone(), "path");
        let settings = Settings::default();

        let state = check_requests(Dimension::Path, &segment, &settings, &subject(None))
            .await
            .unwrap();
        assert_eq!(quota(state).remaining, 49);

        let written = store.written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1, StoredValue::Count(1));
        assert_eq!(written[0].2, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_stale_tokens_ignored() {
        let store = Arc::new(StaleStore::default());
        let segment = Segment::new(store.clone(), "auth");
        let settings = Settings::default();

        assert_eq!(
            check_auth(&segment, &settings, "127.0.0.1").await.unwrap(),
            DimensionState::Pending
        );

        let failure = AuthFailure {
            artifacts: Some(json!({ "authToken": "one" })),
            error_data: None,
        };
        let recorded = record_auth_failure(&segment, &settings, "127.0.0.1", &failure)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.remaining, 4);

        let written = store.written.lock();
        assert_eq!(written[0].1, StoredValue::Tokens(vec![token_digest("one")]));
        assert_eq!(written[0].2, Duration::from_secs(60));
    }

    #[test]
    fn test_original_uri_keeps_nest_prefix() {
        let mut parts = axum::http::Request::get("/users")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        parts
            .extensions
            .insert(OriginalUri("/v1/users".parse().unwrap()));

        let subject = Subject::from_request(&parts, &Settings::default(), "127.0.0.1");
        assert_eq!(subject.path, "/v1/users");
    }
}
