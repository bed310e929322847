//! 存活探测、CORS 预检与兜底处理器。

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;

use crate::error::ApiError;

#[derive(Serialize)]
pub struct StatusResponse {
    ok: bool,
}

/// 返回服务存活状态。
pub async fn get_status() -> JsonResponse<StatusResponse> {
    JsonResponse(StatusResponse { ok: true })
}

/// 预检响应：`allow` 为该路径支持的方法。
pub fn preflight(allow: &'static str) -> Response {
    let mut headers = HeaderMap::new();
    let methods = HeaderValue::from_static(allow);
    headers.insert(header::ALLOW, methods.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    (StatusCode::NO_CONTENT, headers).into_response()
}

pub fn method_not_allowed(method: &Method, allow: &'static str) -> ApiError {
    ApiError::MethodNotAllowed {
        method: method.to_string(),
        allow,
    }
}

/// 未知路径。
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("\"{}\" is not found", uri.path()))
}
