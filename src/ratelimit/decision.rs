//! Per-request decision record and quota headers.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use super::settings::{Dimension, Settings};

/// Quota reported for one counted dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Configured maximum
    pub limit: u64,
    /// Allowance left in the window; request counters floor it at -1
    pub remaining: i64,
    /// Window expiry, epoch milliseconds
    pub reset_at: i64,
}

impl Quota {
    /// Whether this request went over the limit.
    pub fn exceeded(&self) -> bool {
        self.remaining < 0
    }
}

/// What happened to one dimension while processing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DimensionState {
    /// Not checked, or nothing recorded yet
    #[default]
    Pending,
    /// The dimension's limit is `false`
    Disabled,
    /// The client is exempt through a whitelist
    Whitelisted,
    /// The counter was updated
    Counted(Quota),
}

impl DimensionState {
    pub fn quota(&self) -> Option<&Quota> {
        match self {
            DimensionState::Counted(quota) => Some(quota),
            _ => None,
        }
    }
}

/// State carried across the hooks of a single request.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    settings: Arc<Settings>,
    client_ip: String,
    path: DimensionState,
    user: DimensionState,
    user_path: DimensionState,
    auth: DimensionState,
}

impl DecisionRecord {
    pub fn new(settings: Arc<Settings>, client_ip: String) -> Self {
        Self {
            settings,
            client_ip,
            path: DimensionState::Pending,
            user: DimensionState::Pending,
            user_path: DimensionState::Pending,
            auth: DimensionState::Pending,
        }
    }

    /// The effective settings for this request.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// The client IP resolved when the request entered the limiter.
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn state(&self, dimension: Dimension) -> DimensionState {
        match dimension {
            Dimension::Path => self.path,
            Dimension::User => self.user,
            Dimension::UserPath => self.user_path,
            Dimension::Auth => self.auth,
        }
    }

    pub fn record(&mut self, dimension: Dimension, state: DimensionState) {
        match dimension {
            Dimension::Path => self.path = state,
            Dimension::User => self.user = state,
            Dimension::UserPath => self.user_path = state,
            Dimension::Auth => self.auth = state,
        }
    }

    /// Whether any request-counting dimension is over its limit.
    ///
    /// The auth dimension is gated separately, before authentication.
    pub fn exceeded(&self) -> bool {
        Dimension::COUNTED
            .iter()
            .filter_map(|dimension| self.state(*dimension).quota().copied())
            .any(|quota| quota.exceeded())
    }

    /// Write `X-RateLimit-*` headers for every counted dimension.
    ///
    /// Disabled, whitelisted and unchecked dimensions emit nothing.
    pub fn stamp(&self, headers: &mut HeaderMap) {
        for dimension in Dimension::COUNTED {
            let state = self.state(dimension);
            let (Some(quota), Some([limit, remaining, reset])) =
                (state.quota(), header_names(dimension))
            else {
                continue;
            };
            headers.insert(limit, HeaderValue::from(quota.limit));
            headers.insert(remaining, HeaderValue::from(quota.remaining));
            headers.insert(reset, HeaderValue::from(quota.reset_at));
        }
    }
}

fn header_names(dimension: Dimension) -> Option<[HeaderName; 3]> {
    let names = match dimension {
        Dimension::Path => [
            HeaderName::from_static("x-ratelimit-pathlimit"),
            HeaderName::from_static("x-ratelimit-pathremaining"),
            HeaderName::from_static("x-ratelimit-pathreset"),
        ],
        Dimension::User => [
            HeaderName::from_static("x-ratelimit-userlimit"),
            HeaderName::from_static("x-ratelimit-userremaining"),
            HeaderName::from_static("x-ratelimit-userreset"),
        ],
        Dimension::UserPath => [
            HeaderName::from_static("x-ratelimit-userpathlimit"),
            HeaderName::from_static("x-ratelimit-userpathremaining"),
            HeaderName::from_static("x-ratelimit-userpathreset"),
        ],
        Dimension::Auth => return None,
    };
    Some(names)
}
