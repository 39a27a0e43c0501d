//! Limiter options, per-route overrides and their resolution.
//!
//! Global [`Settings`] are validated once when a limiter is built. A route may
//! carry [`RouteSettings`] that are merged over the globals at build time, so a
//! request only has to look up the pre-resolved snapshot for its route.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::request::Parts;
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::json;

use super::identity::{IpWhitelist, UserWhitelist};
use crate::error::{Result, TollgateError};

/// Prefix for default counter segment names.
pub const SEGMENT_PREFIX: &str = "tollgate";

/// One axis of rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Requests per request path (or route template)
    Path,
    /// Requests per user, or per IP for anonymous clients
    User,
    /// Requests per user and path combination
    UserPath,
    /// Distinct rejected auth tokens per IP
    Auth,
}

impl Dimension {
    /// Every dimension.
    pub const ALL: [Dimension; 4] = [
        Dimension::Path,
        Dimension::User,
        Dimension::UserPath,
        Dimension::Auth,
    ];

    /// Dimensions that count requests and report quota headers.
    pub const COUNTED: [Dimension; 3] = [Dimension::Path, Dimension::User, Dimension::UserPath];

    /// Option-style name of this dimension.
    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Path => "path",
            Dimension::User => "user",
            Dimension::UserPath => "userPath",
            Dimension::Auth => "auth",
        }
    }

    /// Window used when the cache options leave `expiresIn` unset.
    pub fn default_window(&self) -> Duration {
        match self {
            Dimension::User => Duration::from_millis(10 * 60 * 1000),
            _ => Duration::from_millis(60 * 1000),
        }
    }

    fn default_limit(&self) -> Limit {
        match self {
            Dimension::Path => Limit::Max(50),
            Dimension::User => Limit::Max(300),
            Dimension::UserPath => Limit::Disabled,
            Dimension::Auth => Limit::Max(5),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A per-dimension limit: either disabled (`false`) or a maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// The dimension is neither counted nor reported
    Disabled,
    /// Maximum allowed within one window
    Max(u64),
}

impl Limit {
    /// Whether the dimension is enabled.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Limit::Max(_))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Flag(bool),
    Count(u64),
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawLimit::deserialize(deserializer)? {
            RawLimit::Flag(false) => Ok(Limit::Disabled),
            RawLimit::Flag(true) => Err(D::Error::custom(
                "limit must be false or a non-negative integer",
            )),
            RawLimit::Count(max) => Ok(Limit::Max(max)),
        }
    }
}

/// Counter store options for one dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheSettings {
    /// Name of a registered backing store; the limiter's default store if unset
    pub cache: Option<String>,
    /// Segment name; `tollgate-<dimension>` if unset
    pub segment: Option<String>,
    /// Window length in milliseconds
    pub expires_in: Option<u64>,
}

/// Custom client IP extraction from the trusted proxy header value.
///
/// Returning `None` falls back to the connection's remote address.
#[derive(Clone)]
pub struct ProxyIpExtractor(Arc<dyn Fn(&str) -> Option<String> + Send + Sync>);

impl ProxyIpExtractor {
    pub fn new<F>(extract: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self(Arc::new(extract))
    }

    pub fn extract(&self, header_value: &str) -> Option<String> {
        (self.0)(header_value)
    }
}

impl fmt::Debug for ProxyIpExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProxyIpExtractor(..)")
    }
}

/// Builds the response returned when a request is over a limit.
#[derive(Clone)]
pub struct LimitExceededResponder(Arc<dyn Fn(&Parts) -> Response + Send + Sync>);

impl LimitExceededResponder {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&Parts) -> Response + Send + Sync + 'static,
    {
        Self(Arc::new(respond))
    }

    pub fn respond(&self, request: &Parts) -> Response {
        (self.0)(request)
    }
}

impl Default for LimitExceededResponder {
    fn default() -> Self {
        Self::new(limit_exceeded_response)
    }
}

impl fmt::Debug for LimitExceededResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LimitExceededResponder(..)")
    }
}

/// The default rejection: `429 Too Many Requests` with a JSON error body.
pub fn limit_exceeded_response(_request: &Parts) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "statusCode": 429,
            "error": "Too Many Requests",
            "message": "Rate limit exceeded",
        })),
    )
        .into_response()
}

/// Effective limiter options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    /// Master switch
    pub enabled: bool,
    /// Always identify clients by IP, ignoring authenticated users
    pub address_only: bool,
    /// Emit `X-RateLimit-*` response headers
    pub headers: bool,
    /// Addresses or ranges exempt from user and user-path limits
    pub ip_whitelist: IpWhitelist,
    /// Users exempt from user and user-path limits
    pub user_whitelist: UserWhitelist,
    /// Dot-path into the credentials naming the user identity
    pub user_attribute: String,
    /// Honor the proxy header for the client IP
    pub trust_proxy: bool,
    /// Header carrying the forwarded client IP
    pub proxy_header_name: String,
    #[serde(skip)]
    pub get_ip_from_proxy_header: Option<ProxyIpExtractor>,
    /// Key path counters by route template instead of the literal path
    pub ignore_path_params: bool,
    pub path_limit: Limit,
    pub path_cache: CacheSettings,
    pub user_limit: Limit,
    pub user_cache: CacheSettings,
    pub user_path_limit: Limit,
    pub user_path_cache: CacheSettings,
    pub auth_limit: Limit,
    pub auth_cache: CacheSettings,
    /// Field holding the token to record on authentication failure
    pub auth_token: String,
    /// Account rejected auth tokens when a response is an authentication failure
    pub check_unauthorized: bool,
    #[serde(skip)]
    pub limit_exceeded_response: Option<LimitExceededResponder>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            address_only: false,
            headers: true,
            ip_whitelist: IpWhitelist::default(),
            user_whitelist: UserWhitelist::default(),
            user_attribute: "id".to_string(),
            trust_proxy: false,
            proxy_header_name: "x-forwarded-for".to_string(),
            get_ip_from_proxy_header: None,
            ignore_path_params: false,
            path_limit: Dimension::Path.default_limit(),
            path_cache: CacheSettings::default(),
            user_limit: Dimension::User.default_limit(),
            user_cache: CacheSettings::default(),
            user_path_limit: Dimension::UserPath.default_limit(),
            user_path_cache: CacheSettings::default(),
            auth_limit: Dimension::Auth.default_limit(),
            auth_cache: CacheSettings::default(),
            auth_token: "authToken".to_string(),
            check_unauthorized: true,
            limit_exceeded_response: None,
        }
    }
}

impl Settings {
    /// The limit configured for `dimension`.
    pub fn limit(&self, dimension: Dimension) -> Limit {
        match dimension {
            Dimension::Path => self.path_limit,
            Dimension::User => self.user_limit,
            Dimension::UserPath => self.user_path_limit,
            Dimension::Auth => self.auth_limit,
        }
    }

    /// The cache options configured for `dimension`.
    pub fn cache(&self, dimension: Dimension) -> &CacheSettings {
        match dimension {
            Dimension::Path => &self.path_cache,
            Dimension::User => &self.user_cache,
            Dimension::UserPath => &self.user_path_cache,
            Dimension::Auth => &self.auth_cache,
        }
    }

    /// Window length for `dimension`.
    pub fn window(&self, dimension: Dimension) -> Duration {
        self.cache(dimension)
            .expires_in
            .map(Duration::from_millis)
            .unwrap_or_else(|| dimension.default_window())
    }

    /// Counter segment name for `dimension`.
    pub fn segment(&self, dimension: Dimension) -> String {
        self.cache(dimension)
            .segment
            .clone()
            .unwrap_or_else(|| format!("{}-{}", SEGMENT_PREFIX, dimension.name()))
    }

    /// The rejection responder, falling back to the default 429.
    pub fn responder(&self) -> LimitExceededResponder {
        self.limit_exceeded_response.clone().unwrap_or_default()
    }

    /// Check option values that cannot be expressed through types.
    pub fn validate(&self) -> Result<()> {
        if self.user_attribute.is_empty() {
            return Err(TollgateError::Config("userAttribute must not be empty".to_string()));
        }

        if self.auth_token.is_empty() {
            return Err(TollgateError::Config("authToken must not be empty".to_string()));
        }

        HeaderName::from_bytes(self.proxy_header_name.as_bytes()).map_err(|e| {
            TollgateError::Config(format!(
                "proxyHeaderName {:?} is not a valid header name: {}",
                self.proxy_header_name, e
            ))
        })?;

        for dimension in Dimension::ALL {
            let cache = self.cache(dimension);
            if cache.expires_in == Some(0) {
                return Err(TollgateError::Config(format!(
                    "{}Cache.expiresIn must be greater than zero",
                    dimension
                )));
            }
            if cache.segment.as_deref() == Some("") {
                return Err(TollgateError::Config(format!(
                    "{}Cache.segment must not be empty",
                    dimension
                )));
            }
        }

        Ok(())
    }

    /// Merge a route's overrides over these settings.
    ///
    /// A numeric `userLimit` override is ignored: the user counter is shared by
    /// every route, so a route may only switch it off.
    pub fn resolve(&self, route: &RouteSettings) -> Settings {
        let mut settings = self.clone();

        if let Some(enabled) = route.enabled {
            settings.enabled = enabled;
        }
        if let Some(address_only) = route.address_only {
            settings.address_only = address_only;
        }
        if let Some(headers) = route.headers {
            settings.headers = headers;
        }
        if let Some(ip_whitelist) = &route.ip_whitelist {
            settings.ip_whitelist = ip_whitelist.clone();
        }
        if let Some(user_whitelist) = &route.user_whitelist {
            settings.user_whitelist = user_whitelist.clone();
        }
        if let Some(user_attribute) = &route.user_attribute {
            settings.user_attribute = user_attribute.clone();
        }
        if let Some(trust_proxy) = route.trust_proxy {
            settings.trust_proxy = trust_proxy;
        }
        if let Some(proxy_header_name) = &route.proxy_header_name {
            settings.proxy_header_name = proxy_header_name.clone();
        }
        if let Some(extractor) = &route.get_ip_from_proxy_header {
            settings.get_ip_from_proxy_header = Some(extractor.clone());
        }
        if let Some(ignore_path_params) = route.ignore_path_params {
            settings.ignore_path_params = ignore_path_params;
        }
        if let Some(path_limit) = route.path_limit {
            settings.path_limit = path_limit;
        }
        if route.user_limit == Some(Limit::Disabled) {
            settings.user_limit = Limit::Disabled;
        }
        if let Some(user_path_limit) = route.user_path_limit {
            settings.user_path_limit = user_path_limit;
        }
        if let Some(auth_limit) = route.auth_limit {
            settings.auth_limit = auth_limit;
        }
        if let Some(auth_token) = &route.auth_token {
            settings.auth_token = auth_token.clone();
        }
        if let Some(check_unauthorized) = route.check_unauthorized {
            settings.check_unauthorized = check_unauthorized;
        }
        if let Some(responder) = &route.limit_exceeded_response {
            settings.limit_exceeded_response = Some(responder.clone());
        }

        settings
    }
}

/// Per-route overrides of the global [`Settings`].
///
/// Cache options cannot be overridden per route; cache keys found in route
/// configuration are accepted, reported when the limiter is built, and dropped.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteSettings {
    pub enabled: Option<bool>,
    pub address_only: Option<bool>,
    pub headers: Option<bool>,
    pub ip_whitelist: Option<IpWhitelist>,
    pub user_whitelist: Option<UserWhitelist>,
    pub user_attribute: Option<String>,
    pub trust_proxy: Option<bool>,
    pub proxy_header_name: Option<String>,
    #[serde(skip)]
    pub get_ip_from_proxy_header: Option<ProxyIpExtractor>,
    pub ignore_path_params: Option<bool>,
    pub path_limit: Option<Limit>,
    pub user_limit: Option<Limit>,
    pub user_path_limit: Option<Limit>,
    pub auth_limit: Option<Limit>,
    pub auth_token: Option<String>,
    pub check_unauthorized: Option<bool>,
    #[serde(skip)]
    pub limit_exceeded_response: Option<LimitExceededResponder>,
    /// Ignored: counter segments are shared by every route
    pub path_cache: Option<CacheSettings>,
    /// Ignored
    pub user_cache: Option<CacheSettings>,
    /// Ignored
    pub user_path_cache: Option<CacheSettings>,
    /// Ignored
    pub auth_cache: Option<CacheSettings>,
}

impl RouteSettings {
    /// Parse route overrides from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Dimensions whose cache options were present in the route configuration.
    pub fn stripped_cache_overrides(&self) -> Vec<Dimension> {
        [
            (Dimension::Path, self.path_cache.is_some()),
            (Dimension::User, self.user_cache.is_some()),
            (Dimension::UserPath, self.user_path_cache.is_some()),
            (Dimension::Auth, self.auth_cache.is_some()),
        ]
        .into_iter()
        .filter_map(|(dimension, present)| present.then_some(dimension))
        .collect()
    }

    /// Use a custom rejection response on this route.
    pub fn with_limit_exceeded_response<F>(mut self, respond: F) -> Self
    where
        F: Fn(&Parts) -> Response + Send + Sync + 'static,
    {
        self.limit_exceeded_response = Some(LimitExceededResponder::new(respond));
        self
    }

    /// Use a custom proxy header parser on this route.
    pub fn with_ip_from_proxy_header<F>(mut self, extract: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.get_ip_from_proxy_header = Some(ProxyIpExtractor::new(extract));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();

        assert!(settings.enabled);
        assert!(settings.headers);
        assert!(!settings.address_only);
        assert!(settings.check_unauthorized);
        assert_eq!(settings.user_attribute, "id");
        assert_eq!(settings.proxy_header_name, "x-forwarded-for");
        assert_eq!(settings.path_limit, Limit::Max(50));
        assert_eq!(settings.user_limit, Limit::Max(300));
        assert_eq!(settings.user_path_limit, Limit::Disabled);
        assert_eq!(settings.auth_limit, Limit::Max(5));
        assert_eq!(settings.window(Dimension::Path), Duration::from_secs(60));
        assert_eq!(settings.window(Dimension::User), Duration::from_secs(600));
        assert_eq!(settings.window(Dimension::UserPath), Duration::from_secs(60));
        assert_eq!(settings.window(Dimension::Auth), Duration::from_secs(60));
        assert_eq!(settings.segment(Dimension::UserPath), "tollgate-userPath");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
pathLimit: false
userLimit: 2
userCache:
  expiresIn: 500
userWhitelist:
  - 1
  - admin
ipWhitelist:
  - 10.0.0.0/8
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(settings.path_limit, Limit::Disabled);
        assert_eq!(settings.user_limit, Limit::Max(2));
        assert_eq!(settings.window(Dimension::User), Duration::from_millis(500));
        assert_eq!(settings.segment(Dimension::User), "tollgate-user");
        assert!(settings.user_whitelist.contains("1"));
        assert!(settings.user_whitelist.contains("admin"));
        assert!(settings.ip_whitelist.contains("10.1.2.3"));
        // untouched options keep their defaults
        assert_eq!(settings.auth_limit, Limit::Max(5));
        assert!(settings.headers);
    }

    #[test]
    fn test_true_limit_rejected() {
        let result = serde_yaml::from_str::<Settings>("pathLimit: true");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let settings = Settings {
            path_cache: CacheSettings {
                expires_in: Some(0),
                ..CacheSettings::default()
            },
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_header_name() {
        let settings = Settings {
            proxy_header_name: "bad header".to_string(),
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_resolve_overrides() {
        let route = RouteSettings::from_yaml(
            r#"
pathLimit: 2
userPathLimit: 10
headers: false
addressOnly: true
"#,
        )
        .unwrap();
        let settings = Settings::default().resolve(&route);

        assert_eq!(settings.path_limit, Limit::Max(2));
        assert_eq!(settings.user_path_limit, Limit::Max(10));
        assert!(!settings.headers);
        assert!(settings.address_only);
        assert_eq!(settings.user_limit, Limit::Max(300));
    }

    #[test]
    fn test_resolve_numeric_user_limit_dropped() {
        let route = RouteSettings {
            user_limit: Some(Limit::Max(1)),
            ..RouteSettings::default()
        };
        let settings = Settings::default().resolve(&route);
        assert_eq!(settings.user_limit, Limit::Max(300));

        let route = RouteSettings {
            user_limit: Some(Limit::Disabled),
            ..RouteSettings::default()
        };
        let settings = Settings::default().resolve(&route);
        assert_eq!(settings.user_limit, Limit::Disabled);
    }

    #[test]
    fn test_route_cache_overrides_stripped() {
        let route = RouteSettings::from_yaml(
            r#"
pathLimit: 5
pathCache:
  segment: elsewhere
  expiresIn: 1
"#,
        )
        .unwrap();
        assert_eq!(route.stripped_cache_overrides(), vec![Dimension::Path]);

        let settings = Settings::default().resolve(&route);
        assert_eq!(settings.segment(Dimension::Path), "tollgate-path");
        assert_eq!(settings.window(Dimension::Path), Duration::from_secs(60));
    }

    #[test]
    fn test_limit_is_enabled() {
        assert!(Limit::Max(0).is_enabled());
        assert!(!Limit::Disabled.is_enabled());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let result = serde_yaml::from_str::<Settings>("pathlimit: 2\nuserLimt: 1\n");
        assert!(result.is_err());

        let result = serde_yaml::from_str::<Settings>("pathCache:\n  expiresin: 10\n");
        assert!(result.is_err());

        let result = RouteSettings::from_yaml("userPathLimt: 3");
        assert!(matches!(result, Err(TollgateError::Yaml(_))));
    }
}
