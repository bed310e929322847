//! HTTP 辅助工具：客户端 IP 解析与 CORS 响应头。

use axum::body::Body as AxumBody;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::{middleware, response::Response};
use std::net::{IpAddr, SocketAddr};

/// 从 `x-real-ip` 解析客户端 IP。
pub fn extract_real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 从 `x-forwarded-for` 中取第一个可解析的 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())?
        .split(',')
        .map(str::trim)
        .find_map(|value| value.parse::<IpAddr>().ok())
}

/// 综合代理头与连接信息计算客户端 IP，均不可用时返回 `None`。
pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    extract_real_ip(headers)
        .or_else(|| extract_forwarded_ip(headers))
        .or(connect_ip)
}

/// 取请求的对端地址（由 `into_make_service_with_connect_info` 注入）。
pub fn connect_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// 为所有响应添加 `Access-Control-Allow-Origin: *`。
pub async fn allow_any_origin(request: Request<AxumBody>, next: middleware::Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}
