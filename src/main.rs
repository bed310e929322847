//! simple-uploader server binary.
//!
//! Accepts authenticated single-file uploads on `POST /upload` and stores them
//! under `{document_root}/{token}/{filename}`. The main entry point loads the
//! token file, starts the connection tracker, builds the Axum router, and runs
//! the HTTP listener plus an optional HTTPS one.

mod admission;
mod atomic;
mod auth;
mod commit;
mod config;
mod error;
mod http;
mod logging;
mod router;
mod status;
mod tls;
mod tokens;
mod tracker;
mod upload;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use crate::admission::{AdmissionController, AdmissionLimits};
use crate::commit::UploadCommitPipeline;
use crate::config::{Args, DISK_USAGE_TTL_SECS, SHUTDOWN_GRACE_SECS};
use crate::router::{Services, build_router};
use crate::tokens::TokenStore;
use crate::tracker::{ConnectionTracker, TrackerConfig};

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);
    info!("starting up simple-uploader");

    let document_root = PathBuf::from(&args.document_root);
    if !tokio::fs::metadata(&document_root)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
    {
        error!(root = %document_root.display(), "missing data directory");
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("missing data directory {}", document_root.display()),
        ));
    }

    let tokens = TokenStore::load(Path::new(&args.tokens))
        .await
        .inspect_err(|err| error!(error = %err, "unable to open tokens file"))?;

    let services = Services {
        tokens: Arc::new(tokens),
        tracker: ConnectionTracker::spawn(TrackerConfig::new(args.max_attempts)),
        admission: Arc::new(AdmissionController::new(
            AdmissionLimits {
                min_free_percent: args.disk_free,
                max_files: args.waiting_files,
            },
            Duration::from_secs(DISK_USAGE_TTL_SECS),
        )),
        pipeline: Arc::new(UploadCommitPipeline::new(
            document_root.clone(),
            args.upload_limit,
        )),
    };
    let app = build_router(services, args.cors);

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.port);
    let tls_config = tls::build_rustls_config(&args).await?;
    let handle = Handle::new();

    info!(
        %http_addr,
        tokens_file = %args.tokens,
        upload_limit = args.upload_limit,
        root = %document_root.display(),
        cors = args.cors,
        disk_free = args.disk_free,
        waiting_files = args.waiting_files,
        "start listening"
    );

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());
    let https_server = async {
        match tls_config {
            Some(config) => {
                let https_addr = SocketAddr::new(host, args.tls_port);
                info!(%https_addr, "start listening TLS");
                axum_server::bind_rustls(https_addr, config)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle.clone()) => {}
    }

    info!("simple-uploader terminated");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
