//! Aranet Collector - Sync Aranet4 history into Prometheus.
//!
//! Run with: `cargo run -p aranet-collector -- --addr "Aranet4 17C3C"`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use aranet_collector::{
    AppState, Collector, Config, MockSource, ReadingSource, ServiceSource, SourceKind,
    spawn_terminal_prompt, web,
};
use aranet_promsync::Syncer;

/// Aranet Collector - Periodically sync Aranet4 history into Prometheus.
#[derive(Parser, Debug)]
#[command(name = "aranet-collector")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Status page listen address (overrides config).
    #[arg(short, long)]
    listen: Option<String>,

    /// Prometheus base URL (overrides config).
    #[arg(long)]
    prometheus_url: Option<String>,

    /// Metric name prefix (overrides config).
    #[arg(long)]
    prefix: Option<String>,

    /// Value of the job label (overrides config).
    #[arg(long)]
    job: Option<String>,

    /// Value of the instance label (overrides config).
    #[arg(long)]
    instance: Option<String>,

    /// Device address or name (overrides config).
    #[arg(short, long)]
    addr: Option<String>,

    /// Seconds between refreshes (overrides config).
    #[arg(short, long)]
    interval: Option<u64>,

    /// Log writes instead of sending them.
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Reading source (overrides config).
    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    /// aranet-service base URL (overrides config).
    #[arg(long)]
    service_url: Option<String>,

    /// Make the mock source require pairing with this passkey.
    #[arg(long, requires = "source")]
    mock_passkey: Option<u32>,

    /// Do not prompt for the passkey on the terminal.
    #[arg(long)]
    no_terminal_prompt: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.server.bind = listen.clone();
        }
        if let Some(url) = &self.prometheus_url {
            config.prometheus.url = url.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.prometheus.prefix = prefix.clone();
        }
        if let Some(job) = &self.job {
            config.prometheus.job = job.clone();
        }
        if let Some(instance) = &self.instance {
            config.prometheus.instance = Some(instance.clone());
        }
        if let Some(addr) = &self.addr {
            config.device.address = addr.clone();
        }
        if let Some(interval) = self.interval {
            config.collector.interval_secs = interval;
        }
        if self.dry_run {
            config.prometheus.dry_run = true;
        }
        if let Some(source) = self.source {
            config.device.source = source;
        }
        if let Some(url) = &self.service_url {
            config.device.service_url = url.clone();
        }
        if self.no_terminal_prompt {
            config.pairing.terminal_prompt = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("aranet_collector={level}").parse()?)
                .add_directive(format!("aranet_promsync={level}").parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    args.apply(&mut config);
    config.validate()?;

    let syncer = Arc::new(Syncer::new(config.sync_config()).context("creating sync engine")?);
    if config.prometheus.dry_run {
        warn!("dry run, samples will be logged and not written");
    }

    let state = AppState::new(config.clone());
    let source: Arc<dyn ReadingSource> = match config.device.source {
        SourceKind::Service => Arc::new(
            ServiceSource::new(
                &config.device.service_url,
                &config.device.address,
                config.collector.acquire_timeout(),
            )
            .context("creating service source")?,
        ),
        SourceKind::Mock => {
            let mut source = MockSource::demo();
            if let Some(passkey) = args.mock_passkey {
                source =
                    source.with_pairing(state.mediator.clone(), passkey, config.pairing.timeout());
            }
            Arc::new(source)
        }
    };

    let collector = Arc::new(
        Collector::new(Arc::clone(&state), syncer, Arc::clone(&source))
            .context("creating collector")?,
    );

    if config.pairing.terminal_prompt {
        spawn_terminal_prompt(state.mediator.clone());
    }

    let collector_task = tokio::spawn(Arc::clone(&collector).run());

    let app = Router::new()
        .merge(web::router())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = config.server.socket_addr()?;
    info!(
        "Starting status page on {} for {} via {}",
        addr,
        config.device.address,
        source.describe()
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await?;

    collector_task.await?;
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
    state.collector.signal_stop();
}
