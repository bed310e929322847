//! TLS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use std::path::Path;
use tracing::{info, warn};

use crate::config::Args;

/// 同时提供证书与私钥时构建 Rustls 配置，否则不启用 HTTPS。
pub async fn build_rustls_config(args: &Args) -> Result<Option<RustlsConfig>, std::io::Error> {
    match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            let config = RustlsConfig::from_pem_file(Path::new(cert), Path::new(key)).await?;
            info!(cert, key, "loaded TLS certificate");
            Ok(Some(config))
        }
        (None, None) => Ok(None),
        _ => {
            warn!("both --cert and --key are required for TLS, HTTPS listener disabled");
            Ok(None)
        }
    }
}
