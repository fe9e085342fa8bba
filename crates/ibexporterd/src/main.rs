//! ibexporterd - InfiniBand fabric exporter for Prometheus.
//!
//! Runs `ibqueryerrors` on every `/metrics` request, keeps exported counters
//! monotonic across hardware resets and optionally clears counters that
//! approach saturation with `perfquery`.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod handlers;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use ibexporter_core::command::SystemRunner;
use ibexporter_core::config::{DEFAULT_PORT, ExporterConfig};
use ibexporter_core::names::NodeNameMap;
use ibexporter_core::reset::DEFAULT_HIGH_WATER_RATIO;
use ibexporter_core::{Scraper, VERSION};

#[derive(Parser)]
#[command(name = "ibexporterd", about = "Prometheus exporter for InfiniBand fabric counters", version = VERSION)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT, env = "IBEXPORTER_PORT")]
    port: u16,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    listen_address: IpAddr,

    /// Reset counters of a port once one of them reaches the high-water mark.
    #[arg(long, env = "CAN_RESET_COUNTER")]
    can_reset_counter: bool,

    /// Read the ibqueryerrors report from this file instead of running it.
    #[arg(long, value_name = "PATH")]
    from_file: Option<PathBuf>,

    /// Node name map used to name GUIDs (ibnetdiscover format).
    #[arg(long, value_name = "PATH", env = "NODE_NAME_MAP")]
    node_name_map: Option<PathBuf>,

    /// Local CA to query through.
    #[arg(long)]
    ca_name: Option<String>,

    /// Timeout for ibqueryerrors and perfquery, in seconds.
    #[arg(long, default_value = "60")]
    command_timeout: u64,

    /// Fraction of a counter's range at which the port is reset.
    #[arg(long, default_value_t = DEFAULT_HIGH_WATER_RATIO)]
    high_water_ratio: f64,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber. Default level is INFO.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["ibexporterd", "ibexporter_core"] {
        match format!("{}={}", target, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("invalid log directive for {}: {}", target, e),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_config(args: &Args) -> ExporterConfig {
    ExporterConfig {
        can_reset_counter: args.can_reset_counter,
        input_file: args.from_file.clone(),
        node_name_map: args.node_name_map.clone(),
        ca_name: args.ca_name.clone(),
        command_timeout: Duration::from_secs(args.command_timeout),
        high_water_ratio: args.high_water_ratio,
        ..ExporterConfig::default()
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = build_config(&args);
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        process::exit(1);
    }

    let names = match &config.node_name_map {
        Some(path) => match NodeNameMap::load(path) {
            Ok(names) => {
                info!(path = %path.display(), entries = names.len(), "loaded node name map");
                Some(names)
            }
            Err(e) => {
                error!(error = %e, "failed to load node name map");
                process::exit(1);
            }
        },
        None => None,
    };

    if config.can_reset_counter {
        info!(ratio = config.high_water_ratio, "counter resets enabled");
    }
    if let Some(path) = &config.input_file {
        warn!(path = %path.display(), "reading report from file, counters will not change");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    let addr = SocketAddr::new(args.listen_address, args.port);
    let scraper = Arc::new(Scraper::new(config, SystemRunner::new(), names));
    if let Err(e) = runtime.block_on(serve(addr, scraper)) {
        error!(error = %e, "server error");
        process::exit(1);
    }
}

async fn serve(addr: SocketAddr, scraper: Arc<Scraper<SystemRunner>>) -> std::io::Result<()> {
    let app = handlers::router(scraper);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(version = VERSION, %addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
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
    info!("received shutdown signal");
}
