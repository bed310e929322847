//! 日志初始化：支持环境变量覆盖与命令行默认级别。

use tracing::warn;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化 tracing 日志订阅；`RUST_LOG` 优先于 `default_level`。
pub fn init_logging(default_level: &str) {
    let mut invalid_level = None;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(default_level).unwrap_or_else(|err| {
            invalid_level = Some(err.to_string());
            EnvFilter::new("info")
        })
    });
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(error) = invalid_level {
        warn!(level = default_level, error = %error, "failed to parse logging level, using info");
    }
}
