//! Tollgate - HTTP Request Rate Limiting
//!
//! This crate implements a rate limiter for axum routers. Requests are
//! counted per path, per user (or IP), per user and path, and rejected
//! authentication tokens are counted per IP. Each dimension uses a fixed
//! window and reports its quota through `X-RateLimit-*` response headers.
//!
//! ```ignore
//! let limiter = Arc::new(
//!     RateLimiter::builder()
//!         .route("/login", RouteSettings { auth_limit: Some(Limit::Max(3)), ..Default::default() })
//!         .build()?,
//! );
//!
//! let app = Router::new()
//!     .route("/login", post(login))
//!     .route_layer(from_fn_with_state(limiter.clone(), middleware::post_auth))
//!     .route_layer(from_fn(authenticate))
//!     .route_layer(from_fn_with_state(limiter, middleware::pre_auth));
//! ```

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod server;
