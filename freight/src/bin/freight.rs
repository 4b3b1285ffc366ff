//! The freight agent binary: flag parsing, task wiring, signal handling.

use std::{env, net::SocketAddr, path::PathBuf};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    sync::mpsc,
    task::JoinSet,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use freight::{
    config::{self, Config},
    reporter, scrape,
    shutdown::Shutdown,
    statsd,
};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("statsd listener returned an error: {0}")]
    Statsd(#[from] statsd::Error),
    #[error("scrape poller returned an error: {0}")]
    Scrape(#[from] scrape::Error),
    #[error("reporter returned an error: {0}")]
    Reporter(#[from] reporter::Error),
}

#[derive(Parser, Debug)]
#[command(version, about = "Forward statsd and Prometheus measurements upstream")]
struct Args {
    /// Path to a YAML configuration file; flags override its values
    #[arg(long)]
    config_path: Option<PathBuf>,
    /// Target for metric set uploads
    #[arg(long, env = "FREIGHT_UPLOAD_URL")]
    upload_url: Option<String>,
    /// Prometheus URL to scrape
    #[arg(long)]
    scrape_url: Option<String>,
    /// Seconds between Prometheus scrapes
    #[arg(long)]
    scrape_interval_seconds: Option<u64>,
    /// UDP address for the statsd listener, `host:port` or bare `:port`
    #[arg(long)]
    statsd_addr: Option<String>,
    /// Seconds between metric set flushes
    #[arg(long)]
    flush_interval_seconds: Option<u64>,
    /// Capacity of the measurement inbox
    #[arg(long)]
    inbox_capacity: Option<usize>,
    /// Address to expose the agent's own metrics on, in Prometheus format
    #[arg(long)]
    telemetry_addr: Option<SocketAddr>,
    /// Verbose trace logging
    #[arg(long)]
    debug: bool,
}

fn assemble_config(args: &Args) -> Result<Config, config::Error> {
    let mut config = match &args.config_path {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    if let Some(url) = &args.upload_url {
        config.upload_url = Some(url.clone());
    }
    if let Some(url) = &args.scrape_url {
        config.scrape_url = Some(url.clone());
    }
    if let Some(seconds) = args.scrape_interval_seconds {
        config.scrape_interval_seconds = seconds;
    }
    if let Some(addr) = &args.statsd_addr {
        config.statsd_addr = Some(addr.clone());
    }
    if let Some(seconds) = args.flush_interval_seconds {
        config.flush_interval_seconds = seconds;
    }
    if let Some(capacity) = args.inbox_capacity {
        config.inbox_capacity = capacity;
    }
    if let Some(addr) = args.telemetry_addr {
        config.telemetry_addr = Some(addr);
    }
    if args.debug {
        config.debug = true;
    }

    // Platforms hand the application a PORT; default the statsd listener to
    // it when nothing else was asked for.
    if config.statsd_addr.is_none() {
        if let Ok(port) = env::var("PORT") {
            if !port.is_empty() {
                config.statsd_addr = Some(format!(":{port}"));
            }
        }
    }

    config.validate()?;
    Ok(config)
}

async fn inner_main(config: Config) -> Result<(), Error> {
    let shutdown = Shutdown::new();

    // The agent's own telemetry, scrapeable like any other process's.
    if let Some(addr) = config.telemetry_addr {
        let builder = PrometheusBuilder::new().with_http_listener(addr);
        tokio::spawn(async move {
            builder
                .install()
                .expect("failed to install prometheus recorder");
        });
    }

    let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);

    let mut servers: JoinSet<Result<(), Error>> = JoinSet::new();

    if let Some(statsd_config) = config.statsd()? {
        let listener = statsd::Listener::new(statsd_config, inbox_tx.clone(), shutdown.clone());
        servers.spawn(async move { listener.run().await.map_err(Error::from) });
    }

    if let Some(scrape_config) = config.scrape() {
        let poller = scrape::Prometheus::new(
            scrape_config,
            config.scrape_interval(),
            inbox_tx.clone(),
            shutdown.clone(),
        );
        servers.spawn(async move { poller.run().await.map_err(Error::from) });
    }

    let upload_url = config
        .upload_url
        .clone()
        .ok_or(config::Error::MissingUploadUrl)?;
    let reporter = reporter::Reporter::new(
        upload_url,
        config.flush_interval(),
        inbox_rx,
        shutdown.clone(),
    );
    servers.spawn(async move { reporter.run().await.map_err(Error::from) });

    // Each source holds its own inbox handle; dropping ours lets the
    // reporter observe closure if every source stops.
    drop(inbox_tx);

    wait_for_signal().await;
    info!("received shutdown signal, stopping");
    shutdown.signal();

    while let Some(result) = servers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("server exited with error: {err}"),
            Err(err) => warn!("server task panicked: {err}"),
        }
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    let config = assemble_config(&args)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.debug {
            EnvFilter::new("freight=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(inner_main(config))
}
