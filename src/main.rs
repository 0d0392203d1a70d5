use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use head_router::{
    Aggregator, Config, Generator, HttpReporter, MetricsCollector, Registry, Shutdown,
    logging::setup_logging, monitor, publisher, server,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

// 版本信息常量
const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_TIME: &str = env!("BUILD_TIME");
const GIT_HASH: &str = env!("GIT_HASH");
const GIT_BRANCH: &str = env!("GIT_BRANCH");
const RUST_VERSION: &str = env!("RUST_VERSION");
const TARGET_ARCH: &str = env!("TARGET_ARCH");
const BUILD_PROFILE: &str = env!("BUILD_PROFILE");

fn get_version_info() -> String {
    format!(
        "Head Router v{}\n\
        Build Information:\n\
        ├─ Build Time: {}\n\
        ├─ Git Hash: {}\n\
        ├─ Git Branch: {}\n\
        ├─ Rust Version: {}\n\
        ├─ Target Architecture: {}\n\
        └─ Build Profile: {}",
        VERSION, BUILD_TIME, GIT_HASH, GIT_BRANCH, RUST_VERSION, TARGET_ARCH, BUILD_PROFILE
    )
}

fn build_cli() -> Command {
    Command::new("head-router")
        .version(VERSION)
        .about(
            "Block height monitor and health-aware routing config generator for RPC provider pools",
        )
        .long_about(
            "Head Router tracks the chain head reported by every RPC provider and keeps a reverse\n\
            proxy routing configuration up to date, so block-sensitive methods are only sent to\n\
            providers that have caught up with the highest block seen for their service.",
        )
        .arg(
            Arg::new("version-info")
                .long("version-info")
                .help("Show detailed version and build information")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Set log level (trace, debug, info, warn, error)")
                .global(true),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the ingestion endpoint, aggregator and configuration publisher")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Specify configuration file path")
                        .default_value("config.toml"),
                ),
        )
        .subcommand(
            Command::new("monitor")
                .about("Follow provider heads and post them to a remote ingestion endpoint")
                .arg(
                    Arg::new("url")
                        .value_name("URL")
                        .help("Ingestion endpoint serving the provider list")
                        .required(true),
                )
                .arg(
                    Arg::new("reconnect-delay-ms")
                        .long("reconnect-delay-ms")
                        .value_name("MS")
                        .help("Delay before reconnecting a dropped subscription")
                        .value_parser(clap::value_parser!(u64).range(1..))
                        .default_value("100"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = build_cli().get_matches();

    // 处理版本信息显示
    if matches.get_flag("version-info") {
        println!("{}", get_version_info());
        return Ok(());
    }

    match matches.subcommand() {
        Some(("serve", sub)) => serve(sub).await,
        Some(("monitor", sub)) => run_monitor(sub).await,
        _ => {
            build_cli().print_help()?;
            Ok(())
        }
    }
}

async fn serve(matches: &ArgMatches) -> Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .context("Missing configuration path")?;

    // 加载配置
    let config = Config::load(config_path).await?;
    config.validate()?;

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.logging.level);
    setup_logging(log_level, &config.logging.format)?;

    info!("Starting Head Router v{}", VERSION);
    info!("Build: {} ({})", GIT_HASH, BUILD_TIME);
    info!("Branch: {} | Profile: {}", GIT_BRANCH, BUILD_PROFILE);
    info!(
        "Configuration loaded from {} ({} services)",
        config_path,
        config.services.len()
    );

    let registry = Arc::new(Registry::load(&config.services)?);
    for group in registry.groups() {
        info!(
            "  Service {}: {} providers, {} methods ({:?})",
            group.name,
            group.providers.len(),
            group.methods.len(),
            group.association
        );
    }

    let metrics = if config.metrics.enabled {
        Some(Arc::new(MetricsCollector::new()?))
    } else {
        None
    };

    let shutdown = Shutdown::new();
    let generator = Generator::new(registry.clone(), config.routing.clone());
    let (channel, receiver) = publisher::handoff();
    let (aggregator, handle) = Aggregator::new(generator, Box::new(channel), metrics.clone());
    let aggregator_task = aggregator
        .with_skip_unchanged(config.publisher.skip_unchanged)
        .spawn(shutdown.subscribe());

    let consumer_task = tokio::spawn(publisher::run_consumer(
        receiver,
        config.publisher.output.as_ref().map(PathBuf::from),
        shutdown.subscribe(),
    ));

    // 启动时先生成一次完整配置
    handle.refresh()?;

    let monitor_tasks = if config.monitor.embedded {
        monitor::spawn_monitors(
            registry
                .providers()
                .iter()
                .map(|provider| (provider.index, provider.wsurl.clone())),
            config.monitor.reconnect_delay(),
            Arc::new(handle.clone()),
            &shutdown.subscribe(),
        )
    } else {
        Vec::new()
    };
    info!("Started {} embedded head monitors", monitor_tasks.len());

    let mut stop = shutdown.subscribe();
    let (_, server_future) = server::bind(config.server.bind, handle, metrics, async move {
        let _ = stop.wait_for(|stopped| *stopped).await;
    })?;
    let server_task = tokio::spawn(server_future);

    let signal = shutdown.wait_for_signal().await;
    info!("Received {}, stopping", signal);

    for task in monitor_tasks {
        let _ = task.await;
    }
    if let Err(e) = server_task.await {
        error!("Ingestion server task failed: {}", e);
    }
    if let Err(e) = consumer_task.await {
        error!("Configuration consumer task failed: {}", e);
    }
    let _ = aggregator_task.await;

    info!("Head Router shutdown complete");
    Ok(())
}

async fn run_monitor(matches: &ArgMatches) -> Result<()> {
    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    setup_logging(log_level, "pretty")?;

    let url = matches
        .get_one::<String>("url")
        .context("Missing ingestion URL")?;
    let url = Url::parse(url).with_context(|| format!("Invalid ingestion URL: {}", url))?;
    let delay = matches
        .get_one::<u64>("reconnect-delay-ms")
        .copied()
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(100));

    info!("Starting head monitors v{} against {}", VERSION, url);

    let providers = monitor::fetch_providers(&url)
        .await
        .with_context(|| format!("Failed to fetch provider list from {}", url))?;
    if providers.is_empty() {
        warn!("Provider list at {} is empty", url);
    }

    let shutdown = Shutdown::new();
    let tasks = monitor::spawn_monitors(
        providers
            .into_iter()
            .enumerate()
            .map(|(index, provider)| (index, provider.wsurl)),
        delay,
        Arc::new(HttpReporter::new(url)),
        &shutdown.subscribe(),
    );
    info!("Monitoring {} providers", tasks.len());

    let signal = shutdown.wait_for_signal().await;
    info!("Received {}, stopping monitors", signal);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
