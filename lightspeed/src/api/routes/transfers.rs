//! Transfer submission routes.
//!
//! Every route runs admission before answering: the bearer token is resolved,
//! the request validated, the needed tools checked and a gate slot taken.
//! Only then is a `200` returned whose body is the session's NDJSON progress
//! stream.

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::auth::extract_bearer_token;
use crate::api::error::ApiResult;
use crate::api::models::{CompressRequest, DownloadRequest};
use crate::api::server::AppState;
use crate::transfer::{ProgressReceiver, TransferRequest};
use crate::Error;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Create the transfers router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/transfers", post(create_transfer))
        .route("/download", post(create_download))
        .route("/compress", post(create_compress))
}

async fn create_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    submit::<TransferRequest>(state, headers, body).await
}

async fn create_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    submit::<DownloadRequest>(state, headers, body).await
}

async fn create_compress(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    submit::<CompressRequest>(state, headers, body).await
}

/// Authenticate, admit and start a transfer described by a `B` body.
///
/// The body is parsed after authentication so unauthenticated callers learn
/// nothing about request validity.
async fn submit<B>(state: AppState, headers: HeaderMap, body: Bytes) -> ApiResult<Response>
where
    B: DeserializeOwned + Into<TransferRequest> + Send,
{
    let token = extract_bearer_token(&headers)?;
    let identity = state.identity.resolve(token).await?;

    let request: TransferRequest = serde_json::from_slice::<B>(&body)
        .map_err(|e| Error::invalid_request(format!("Malformed request body: {e}")))?
        .into();
    let admission = state.pipeline.admit(request)?;
    debug!(
        user = %identity.user,
        mode = %admission.request().mode,
        held = state.pipeline.gate().held(),
        "Transfer admitted"
    );

    let receiver = state.pipeline.start(admission, identity);
    Ok(ndjson_response(receiver))
}

fn ndjson_response(receiver: ProgressReceiver) -> Response {
    let mut response = (StatusCode::OK, Body::from_stream(receiver.into_stream())).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
