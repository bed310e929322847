//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_DOCUMENT_ROOT: &str = "/var/html/simple_uploader/data";
pub const DEFAULT_TOKENS_FILE: &str = "/etc/simple_uploader/tokens";
pub const DEFAULT_UPLOAD_LIMIT: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_DISK_FREE_PERCENT: u8 = 15;
pub const DEFAULT_WAITING_FILES: u64 = 1000;

pub const TRACKER_SWEEP_INTERVAL_SECS: u64 = 10 * 60;
pub const TRACKER_RETENTION_SECS: u64 = 30 * 60;
pub const TRACKER_COOLDOWN_SECS: u64 = 290;
pub const TRACKER_THROTTLE_SECS: u64 = 4;
pub const TRACKER_MAILBOX_CAPACITY: usize = 1024;
pub const DISK_USAGE_TTL_SECS: u64 = 30;
pub const TOKEN_LOG_PREFIX_LEN: usize = 8;
pub const PUBLIC_MOUNT: &str = "/files";
pub const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(
    name = "simple-uploader",
    version = VERSION_INFO,
    about = "Token protected single-endpoint upload server"
)]
pub struct Args {
    #[arg(
        env = "UPLOADER_ROOT",
        default_value = DEFAULT_DOCUMENT_ROOT,
        help = "Document root receiving uploaded files"
    )]
    pub document_root: String,
    #[arg(
        short = 'b',
        long = "ip",
        env = "UPLOADER_IP",
        default_value = "0.0.0.0",
        help = "IP address to bind"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "UPLOADER_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'P',
        long,
        env = "UPLOADER_TLS_PORT",
        default_value_t = 8443,
        help = "HTTPS port, used when both --cert and --key are set"
    )]
    pub tls_port: u16,
    #[arg(
        long,
        env = "UPLOADER_UPLOAD_LIMIT",
        default_value_t = DEFAULT_UPLOAD_LIMIT,
        help = "Max size of an uploaded file in bytes"
    )]
    pub upload_limit: u64,
    #[arg(
        short = 't',
        long,
        env = "UPLOADER_TOKENS",
        default_value = DEFAULT_TOKENS_FILE,
        help = "File containing the accepted tokens, one per line"
    )]
    pub tokens: String,
    #[arg(
        long,
        env = "UPLOADER_MAX_ATTEMPTS",
        default_value_t = DEFAULT_MAX_ATTEMPTS,
        help = "Connection attempts allowed within the cooldown window"
    )]
    pub max_attempts: u32,
    #[arg(
        long,
        env = "UPLOADER_LOG_LEVEL",
        default_value = "info",
        help = "Logging level, overridden by RUST_LOG"
    )]
    pub log_level: String,
    #[arg(short = 'c', long, env = "UPLOADER_TLS_CERT", help = "TLS cert path")]
    pub cert: Option<String>,
    #[arg(short = 'k', long, env = "UPLOADER_TLS_KEY", help = "TLS key path")]
    pub key: Option<String>,
    #[arg(
        long,
        env = "UPLOADER_CORS",
        help = "Add Access-Control-Allow-Origin: * to responses"
    )]
    pub cors: bool,
    #[arg(
        long,
        env = "UPLOADER_DISK_FREE",
        default_value_t = DEFAULT_DISK_FREE_PERCENT,
        value_parser = clap::value_parser!(u8).range(0..=100),
        help = "Minimum percent of free disk space to accept new files"
    )]
    pub disk_free: u8,
    #[arg(
        long,
        env = "UPLOADER_WAITING_FILES",
        default_value_t = DEFAULT_WAITING_FILES,
        help = "Maximum number of files waiting in a token directory"
    )]
    pub waiting_files: u64,
}
