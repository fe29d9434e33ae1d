//! HTTP surface over [`crate::service::AuthService`] and the key manager.

use crate::{jwks::KeyManager, service::AuthService};
use anyhow::Result;
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::options,
};
use std::{fmt, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub mod error;
pub mod handlers;
mod openapi;

pub use error::ErrorBody;
pub use handlers::{AdminToken, health::HealthProbes};
pub use openapi::openapi;

const REQUEST_ID: &str = "x-request-id";

/// Everything the handlers pull out of request extensions.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AuthService>,
    pub keys: Arc<KeyManager>,
    pub health: Arc<HealthProbes>,
    pub admin: Option<Arc<AdminToken>>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("service", &self.service)
            .field("admin", &self.admin.is_some())
            .finish_non_exhaustive()
    }
}

/// Documented routes; admin routes only when an admin token is configured.
#[must_use]
pub fn router(admin_enabled: bool) -> OpenApiRouter {
    let router = openapi::api_router();
    if admin_enabled {
        router.merge(openapi::admin_router())
    } else {
        router
    }
}

/// The served application: routes plus request-id, tracing and state layers.
#[must_use]
pub fn app(state: &AppState) -> Router {
    let (router, _openapi) = router(state.admin.is_some()).split_for_parts();
    let router = router.route("/health", options(handlers::health::health));

    let router = match &state.admin {
        Some(admin) => router.layer(Extension(admin.clone())),
        None => router,
    };

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static(REQUEST_ID),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                REQUEST_ID,
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(state.service.clone()))
            .layer(Extension(state.keys.clone()))
            .layer(Extension(state.health.clone())),
    )
}

/// Start the server
/// # Errors
/// Return error if failed to bind or serve
pub async fn serve(port: u16, state: AppState) -> Result<()> {
    let app = app(&state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
