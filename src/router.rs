//! 路由表与中间件层装配。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{Method, Request};
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::admission::AdmissionController;
use crate::auth;
use crate::commit::UploadCommitPipeline;
use crate::config::MULTIPART_OVERHEAD_BYTES;
use crate::http::{self, connect_ip, resolve_client_ip};
use crate::status::{self, method_not_allowed, preflight};
use crate::tokens::TokenStore;
use crate::tracker::ConnectionTracker;
use crate::upload;

/// Shared components handed to every request.
#[derive(Clone)]
pub struct Services {
    pub tokens: Arc<TokenStore>,
    pub tracker: ConnectionTracker,
    pub admission: Arc<AdmissionController>,
    pub pipeline: Arc<UploadCommitPipeline>,
}

/// 构建完整路由；每条路由都先经过认证中间件。
pub fn build_router(services: Services, cors: bool) -> Router {
    let body_limit = services
        .pipeline
        .max_upload_size()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let mut app = Router::new()
        .route(
            "/status",
            get(status::get_status)
                .options(|| async { preflight("GET") })
                .fallback(|method: Method| async move { method_not_allowed(&method, "GET, OPTIONS") }),
        )
        .route(
            "/upload",
            post(upload::handle_upload)
                .options(|| async { preflight("POST") })
                .fallback(|method: Method| async move {
                    method_not_allowed(&method, "POST, OPTIONS")
                })
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .fallback(status::not_found)
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = resolve_client_ip(request.headers(), connect_ip(request))
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(services.tokens))
        .layer(Extension(services.tracker))
        .layer(Extension(services.admission))
        .layer(Extension(services.pipeline));

    if cors {
        app = app.layer(middleware::from_fn(http::allow_any_origin));
    }
    app
}
