//! The rate limiter and its request lifecycle hooks.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::MatchedPath;
use axum::http::request::Parts;
use axum::response::Response;
use tracing::{debug, info, warn};

use super::checker::{self, Subject};
use super::decision::DecisionRecord;
use super::identity::client_ip;
use super::settings::{
    Dimension, LimitExceededResponder, ProxyIpExtractor, RouteSettings, Settings,
};
use super::store::{CounterStore, MemoryStore, Segment};
use crate::config::LimiterConfig;
use crate::error::{Result, TollgateError};
use crate::middleware::AuthFailure;

/// A registered rate limiter.
///
/// Each instance owns its counter segments, so two limiters built without a
/// shared store never see each other's counters.
pub struct RateLimiter {
    /// Global settings, used for routes without overrides
    settings: Arc<Settings>,
    /// Pre-resolved settings keyed by route template
    routes: HashMap<String, Arc<Settings>>,
    path: Segment,
    user: Segment,
    user_path: Segment,
    auth: Segment,
}

impl RateLimiter {
    /// Start building a limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// A limiter with default settings and a private in-memory store.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// The global settings.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// The counter segment used for `dimension`.
    pub fn segment(&self, dimension: Dimension) -> &Segment {
        match dimension {
            Dimension::Path => &self.path,
            Dimension::User => &self.user,
            Dimension::UserPath => &self.user_path,
            Dimension::Auth => &self.auth,
        }
    }

    /// Effective settings for a request, by its matched route template.
    pub fn settings_for(&self, request: &Parts) -> Arc<Settings> {
        request
            .extensions
            .get::<MatchedPath>()
            .and_then(|matched| self.routes.get(matched.as_str()))
            .unwrap_or(&self.settings)
            .clone()
    }

    /// Open the decision record for a request entering the limiter.
    pub fn begin(&self, request: &Parts) -> DecisionRecord {
        let settings = self.settings_for(request);
        let ip = client_ip(request, &settings);
        DecisionRecord::new(settings, ip)
    }

    /// Whether the pre-response hook may need the request to build a rejection.
    pub(crate) fn needs_request_snapshot(&self, settings: &Settings) -> bool {
        settings.enabled && settings.check_unauthorized && settings.auth_limit.is_enabled()
    }

    /// Runs before authentication.
    ///
    /// Rejects clients that already presented more distinct bad tokens than
    /// the auth limit allows, without letting them attempt authentication.
    pub async fn on_pre_auth(
        &self,
        request: &Parts,
        record: &mut DecisionRecord,
    ) -> Result<Option<Response>> {
        let settings = record.settings().clone();
        if !settings.enabled {
            return Ok(None);
        }

        let auth = checker::check_auth(&self.auth, &settings, record.client_ip()).await?;
        record.record(Dimension::Auth, auth);

        if auth.quota().is_some_and(|quota| quota.exceeded()) {
            debug!(ip = %record.client_ip(), "Too many failed auth tokens");
            return Ok(Some(settings.responder().respond(request)));
        }

        Ok(None)
    }

    /// Runs once authentication has been resolved.
    ///
    /// Counts the request against the path, user and user-path dimensions
    /// concurrently and rejects it if any of them is over its limit.
    pub async fn on_post_auth(
        &self,
        request: &Parts,
        record: &mut DecisionRecord,
    ) -> Result<Option<Response>> {
        let settings = record.settings().clone();
        if !settings.enabled {
            return Ok(None);
        }

        let subject = Subject::from_request(request, &settings, record.client_ip());

        let (path, user, user_path) = tokio::try_join!(
            checker::check_requests(Dimension::Path, &self.path, &settings, &subject),
            checker::check_requests(Dimension::User, &self.user, &settings, &subject),
            checker::check_requests(Dimension::UserPath, &self.user_path, &settings, &subject),
        )?;

        record.record(Dimension::Path, path);
        record.record(Dimension::User, user);
        record.record(Dimension::UserPath, user_path);

        if record.exceeded() {
            debug!(
                ip = %subject.ip,
                user = ?subject.user,
                path = %subject.path,
                "Rate limit exceeded"
            );
            return Ok(Some(settings.responder().respond(request)));
        }

        Ok(None)
    }

    /// Runs before the response is sent.
    ///
    /// Records the token of a failed authentication (turning the response into
    /// a rejection once the IP is over the auth limit) and stamps the quota
    /// headers. `request` is only consulted when a rejection must be built.
    pub async fn on_pre_response(
        &self,
        request: Option<&Parts>,
        record: &DecisionRecord,
        mut response: Response,
    ) -> Result<Response> {
        let settings = record.settings();

        let failure = response.extensions().get::<AuthFailure>().cloned();
        if let (Some(request), Some(failure)) = (request, failure) {
            if self.needs_request_snapshot(settings) {
                let recorded = checker::record_auth_failure(
                    &self.auth,
                    settings,
                    record.client_ip(),
                    &failure,
                )
                .await?;

                if recorded.is_some_and(|quota| quota.exceeded()) {
                    debug!(ip = %record.client_ip(), "Failed auth token limit exceeded");
                    response = settings.responder().respond(request);
                }
            }
        }

        if settings.headers {
            record.stamp(response.headers_mut());
        }

        Ok(response)
    }
}

/// Builder for [`RateLimiter`].
#[derive(Default)]
pub struct RateLimiterBuilder {
    settings: Settings,
    routes: HashMap<String, RouteSettings>,
    store: Option<Arc<dyn CounterStore>>,
    named_stores: HashMap<String, Arc<dyn CounterStore>>,
}

impl RateLimiterBuilder {
    /// Replace the global settings.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Take global settings and route overrides from configuration.
    pub fn config(mut self, config: LimiterConfig) -> Self {
        self.settings = config.defaults;
        self.routes.extend(config.routes);
        self
    }

    /// Override settings for the route with template `path`.
    pub fn route(mut self, path: impl Into<String>, settings: RouteSettings) -> Self {
        self.routes.insert(path.into(), settings);
        self
    }

    /// Default backing store for every dimension.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a store selectable through a dimension's `cache` option.
    pub fn named_store(mut self, name: impl Into<String>, store: Arc<dyn CounterStore>) -> Self {
        self.named_stores.insert(name.into(), store);
        self
    }

    /// Global custom rejection response.
    pub fn limit_exceeded_response<F>(mut self, respond: F) -> Self
    where
        F: Fn(&Parts) -> Response + Send + Sync + 'static,
    {
        self.settings.limit_exceeded_response = Some(LimitExceededResponder::new(respond));
        self
    }

    /// Global custom proxy header parser.
    pub fn ip_from_proxy_header<F>(mut self, extract: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.settings.get_ip_from_proxy_header = Some(ProxyIpExtractor::new(extract));
        self
    }

    /// Validate the options and create the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        let settings = self.settings;
        settings.validate()?;

        let default_store: Arc<dyn CounterStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };

        let segment = |dimension: Dimension| -> Result<Segment> {
            let store = match &settings.cache(dimension).cache {
                Some(name) => self.named_stores.get(name).cloned().ok_or_else(|| {
                    TollgateError::Config(format!(
                        "{}Cache.cache refers to unknown store {:?}",
                        dimension, name
                    ))
                })?,
                None => default_store.clone(),
            };
            Ok(Segment::new(store, settings.segment(dimension)))
        };

        let path = segment(Dimension::Path)?;
        let user = segment(Dimension::User)?;
        let user_path = segment(Dimension::UserPath)?;
        let auth = segment(Dimension::Auth)?;

        let mut routes = HashMap::with_capacity(self.routes.len());
        for (template, overrides) in self.routes {
            let stripped = overrides.stripped_cache_overrides();
            if !stripped.is_empty() {
                warn!(
                    route = %template,
                    dimensions = ?stripped,
                    "Ignoring cache options in route settings"
                );
            }

            let resolved = settings.resolve(&overrides);
            resolved.validate().map_err(|e| {
                TollgateError::Config(format!("route {}: {}", template, e))
            })?;
            routes.insert(template, Arc::new(resolved));
        }

        info!(
            routes = routes.len(),
            path_segment = %path.name(),
            user_segment = %user.name(),
            "Rate limiter initialized"
        );

        Ok(RateLimiter {
            settings: Arc::new(settings),
            routes,
            path,
            user,
            user_path,
            auth,
        })
    }
}
