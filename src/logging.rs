use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. `RUST_LOG` wins over `log_level`.
pub fn setup_logging(log_level: &str, format: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("head_router={}", level)));

    let registry = tracing_subscriber::registry().with(env_filter);

    // 根据格式选择输出层
    match format {
        "json" => registry.with(fmt::layer().json().with_target(true)).try_init()?,
        "compact" => registry
            .with(fmt::layer().with_target(true).compact())
            .try_init()?,
        _ => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()?,
    }

    Ok(())
}
