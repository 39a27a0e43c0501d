//! Middleware functions for `axum::middleware::from_fn_with_state`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::extensions::RecordHandle;
use crate::ratelimit::RateLimiter;

/// Outer layer: pre-auth check, then the pre-response step.
///
/// Must wrap the authentication layer. A rejected request skips everything
/// inside this layer but still receives quota headers.
pub async fn pre_auth(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let mut record = limiter.begin(&parts);

    let rejection = match limiter.on_pre_auth(&parts, &mut record).await {
        Ok(rejection) => rejection,
        Err(e) => return e.into_response(),
    };

    let snapshot = limiter
        .needs_request_snapshot(record.settings())
        .then(|| parts.clone());
    let handle = RecordHandle::new(record);

    let response = match rejection {
        Some(rejection) => rejection,
        None => {
            let mut request = Request::from_parts(parts, body);
            request.extensions_mut().insert(handle.clone());
            next.run(request).await
        }
    };

    let record = handle.snapshot();
    match limiter
        .on_pre_response(snapshot.as_ref(), &record, response)
        .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Inner layer: counts the request once authentication has run.
///
/// Requests that did not pass through [`pre_auth`] are forwarded untouched.
pub async fn post_auth(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(handle) = request.extensions().get::<RecordHandle>().cloned() else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let mut record = handle.snapshot();
    let outcome = limiter.on_post_auth(&parts, &mut record).await;
    handle.replace(record);

    match outcome {
        Ok(Some(rejection)) => rejection,
        Ok(None) => next.run(Request::from_parts(parts, body)).await,
        Err(e) => e.into_response(),
    }
}
