use crate::{
    Result,
    jwks::{Jwks, KeyManager},
};
use axum::{
    Json,
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH, LAST_MODIFIED},
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, instrument};

const CACHE_POLICY: &str = "public, max-age=300";
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// `If-None-Match` matches when any listed tag (weak or strong) equals `etag`, or on `*`.
fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == etag)
}

#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Published verification keys", body = Jwks),
        (status = 304, description = "Client copy is current")
    ),
    tag = "jwks"
)]
#[instrument(skip_all)]
pub async fn jwks(headers: HeaderMap, keys: Extension<Arc<KeyManager>>) -> Result<Response> {
    let (jwks, tag) = keys.build_jwks().await?;

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&tag.etag) {
        response_headers.insert(ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&tag.last_modified.format(HTTP_DATE).to_string()) {
        response_headers.insert(LAST_MODIFIED, value);
    }
    response_headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_POLICY));

    if etag_matches(&headers, &tag.etag) {
        debug!(etag = tag.etag, "jwks not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }
    Ok((StatusCode::OK, response_headers, Json(jwks)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_if_none_match(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn etag_matching() {
        assert!(etag_matches(&with_if_none_match("\"abc\""), "\"abc\""));
        assert!(etag_matches(&with_if_none_match("\"x\", W/\"abc\""), "\"abc\""));
        assert!(etag_matches(&with_if_none_match("*"), "\"abc\""));
        assert!(!etag_matches(&with_if_none_match("\"abd\""), "\"abc\""));
        assert!(!etag_matches(&HeaderMap::new(), "\"abc\""));
    }
}
