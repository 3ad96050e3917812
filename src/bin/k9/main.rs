#![deny(clippy::all)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use k9::{
    config::{self, log_level::LogLevel},
    logger,
    policy::{loader, PolicyEngine},
    proxy::{transformer::SeriesTransformer, ProxyServer},
    signal,
    tags::{host::HostTagCache, HostTagSource},
    DEFAULT_CONFIG_PATH,
};

#[derive(Debug, Parser)]
#[command(
    name = "k9",
    about = "k9 - prunes Datadog series submissions on their way out",
    disable_version_flag = true
)]
struct Cli {
    /// Path to the main configuration file
    #[arg(short = 'c', value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level override, one of DEBUG, INFO, WARN, ERROR or FATAL
    #[arg(short = 'l', value_name = "LEVEL")]
    log_level: Option<String>,

    /// Shortcut for -l DEBUG
    #[arg(short = 'd')]
    debug: bool,

    /// Print the version and exit
    #[arg(short = 'v')]
    version: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.version {
        println!("k9 {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let cli_level = match cli_log_level(&cli) {
        Ok(level) => level,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    let config = match config::get_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            init_logging(cli_level.unwrap_or_default());
            fatal(&format!("Error loading configuration: {err}"));
        }
    };
    init_logging(cli_level.unwrap_or(config.log_level));

    // build the initial pruning policies
    let (tree, loaded) = loader::build_tree(&config.pruning_configs);
    if loaded == 0 {
        fatal("No pruning config could be loaded, refusing to start");
    }
    info!("Loaded {loaded} pruning config file(s)");
    let engine = Arc::new(PolicyEngine::new(tree));

    let host_tags = Arc::new(
        HostTagCache::start(
            &config.dd_url,
            &config.api_key,
            &config.application_key,
            Duration::from_secs(config.host_tags_caching_interval),
        )
        .await,
    );

    let transformer = SeriesTransformer::new(
        Arc::clone(&engine),
        Some(Arc::clone(&host_tags) as Arc<dyn HostTagSource>),
    );
    let mut proxy = ProxyServer::new(config.dd_url.clone(), Some(Arc::new(transformer)));
    if let Err(err) = proxy.start(config.listen_port).await {
        fatal(&format!("Unable to start the proxy: {err}"));
    }

    let pruning_configs = config.pruning_configs.clone();
    let dispatched = signal::dispatch(
        move || {
            let (tree, loaded) = loader::build_tree(&pruning_configs);
            if loaded == 0 {
                warn!("No pruning config could be loaded, keeping the previous policies");
            } else {
                engine.reset(tree);
                info!("Reloaded {loaded} pruning config file(s)");
            }
        },
        || async move {
            if let Err(err) = proxy.stop().await {
                error!("Error stopping the proxy: {err}");
            }
            host_tags.stop();
        },
    )
    .await;

    if let Err(err) = dispatched {
        fatal(&format!("Unable to listen for signals: {err}"));
    }
}

fn cli_log_level(cli: &Cli) -> Result<Option<LogLevel>, String> {
    if cli.debug {
        return Ok(Some(LogLevel::Debug));
    }
    match &cli.log_level {
        Some(value) => LogLevel::from_str(value).map(Some),
        None => Ok(None),
    }
}

fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .event_format(logger::Formatter)
        .with_env_filter(EnvFilter::default().add_directive(level.as_level_filter().into()))
        .init();
}

fn fatal(message: &str) -> ! {
    error!("FATAL: {message}");
    process::exit(1);
}
