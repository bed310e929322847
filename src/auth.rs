//! 认证中间件：来源 IP 限流与令牌校验。

use axum::extract::{Extension, Query};
use axum::http::{Method, Request, header};
use axum::{body::Body as AxumBody, middleware, response::Response};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::error;

use crate::error::ApiError;
use crate::http::{connect_ip, resolve_client_ip};
use crate::tokens::{AuthError, TokenStore};
use crate::tracker::{ConnectionTracker, TrackerError, Verdict};

/// Best-effort client address of the current request.
#[derive(Debug, Clone, Copy)]
pub struct ClientIdentity(pub Option<IpAddr>);

/// Token that passed [`authenticate`] for the current request.
#[derive(Debug, Clone)]
pub struct AuthenticatedToken(pub String);

#[derive(Deserialize)]
pub(crate) struct TokenQuery {
    token: Option<String>,
}

/// 认证中间件：校验查询参数中的令牌，并把结果计入来源的连接尝试。
///
/// 未携带查询令牌的 multipart 上传放行到处理器，由其读到表单字段 `token`
/// 后再调用 [`authenticate`]，在此之前不会计数，也不会触碰文件系统。
pub async fn auth_middleware(
    Extension(tokens): Extension<Arc<TokenStore>>,
    Extension(tracker): Extension<ConnectionTracker>,
    Query(query): Query<TokenQuery>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let identity = resolve_client_ip(req.headers(), connect_ip(&req));
    req.extensions_mut().insert(ClientIdentity(identity));

    let token = query.token.filter(|value| !value.is_empty());
    if token.is_none() && is_multipart_upload(&req) {
        return Ok(next.run(req).await);
    }

    let token = authenticate(&tokens, &tracker, identity, token).await?;
    req.extensions_mut().insert(AuthenticatedToken(token));
    Ok(next.run(req).await)
}

/// 校验令牌并作为一次尝试提交给限流器；令牌有效时计数在同一步内清零。
pub async fn authenticate(
    tokens: &TokenStore,
    tracker: &ConnectionTracker,
    identity: Option<IpAddr>,
    token: Option<String>,
) -> Result<String, ApiError> {
    let checked = tokens.check(token.as_deref());
    match tracker.validate(identity, checked.is_ok()).await {
        Ok(Verdict::Allow) => {}
        Ok(Verdict::Deny { .. }) => return Err(AuthError::TooManyAttempts.into()),
        Err(TrackerError::UnidentifiedSource) => {
            error!("connection attempt from non identified source");
        }
        Err(err) => return Err(err.into()),
    }

    checked?;
    token.ok_or_else(|| AuthError::MissingToken.into())
}

fn is_multipart_upload(req: &Request<AxumBody>) -> bool {
    req.method() == Method::POST
        && req.uri().path() == "/upload"
        && req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("multipart/form-data"))
}
