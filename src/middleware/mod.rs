//! axum integration.
//!
//! The limiter hooks into a router as two route layers around the
//! application's authentication layer:
//!
//! ```text
//! pre_auth -> (authentication) -> post_auth -> handler
//! ```
//!
//! [`pre_auth`] runs the pre-auth check on the way in and the pre-response
//! step on the way out. [`post_auth`] counts the request once the
//! authentication layer has attached [`Credentials`] (or not). An
//! authentication layer reports a rejected token by attaching an
//! [`AuthFailure`] to its error response.

mod extensions;
mod hooks;

pub use extensions::{AuthFailure, Credentials, RecordHandle};
pub use hooks::{post_auth, pre_auth};
