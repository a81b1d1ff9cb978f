use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_controller::{Controller, ControllerConfig, LogErrorReporter};
use vigil_core::LabelSelector;
use vigil_kubehub::KubePodNotifier;
use vigil_queue::{controller_rate_limiter, RateLimitConfig};
use vigil_sink::{HttpStatusSink, LogStatusSink, SinkConfig, StatusSink};

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Report container status of selected pods to a cluster-status endpoint")]
struct Cli {
    /// Concurrent reconcile workers
    #[arg(long, env = "VIGIL_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "namespace", short = 'n')]
    namespace: Option<String>,

    /// Failures tolerated per pod before it is dropped from the queue
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Give up if the initial pod list has not arrived by then
    #[arg(long, default_value_t = 120)]
    sync_timeout_secs: u64,

    /// Buffered notifications between the watcher and the cache
    #[arg(long, default_value_t = 1024)]
    queue_cap: usize,

    /// Only pods with this `key=value` label are reported
    #[arg(long, default_value = "status-controller-vcluster=cluster-manager")]
    selector: LabelSelector,

    /// Label whose value is sent as the report id
    #[arg(long, default_value = "status-controller")]
    id_label: String,

    /// Endpoint receiving `PATCH {name,id,status}`
    #[arg(long, env = "VIGIL_STATUS_URL", required_unless_present = "dry_run")]
    status_url: Option<String>,

    #[arg(long, env = "VIGIL_STATUS_TOKEN", hide_env_values = true)]
    status_token: Option<String>,

    /// Skip TLS verification of the status endpoint (local clusters)
    #[arg(long, env = "VIGIL_INSECURE_TLS", action = ArgAction::SetTrue)]
    insecure_tls: bool,

    #[arg(long, default_value_t = 5)]
    backoff_base_ms: u64,

    #[arg(long, default_value_t = 1000)]
    backoff_max_secs: u64,

    /// Overall retry rate across all pods
    #[arg(long, default_value_t = 10.0)]
    qps: f64,

    #[arg(long, default_value_t = 100)]
    burst: u32,

    /// Log node readiness changes
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    watch_nodes: bool,

    /// Log status reports instead of sending them
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            channel_cap: self.queue_cap,
            selector: self.selector.clone(),
            id_label: self.id_label.clone(),
        }
    }

    fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            qps: self.qps,
            burst: self.burst,
        }
    }

    fn status_sink(&self) -> Result<Arc<dyn StatusSink>> {
        if self.dry_run {
            info!("dry run: status reports are only logged");
            return Ok(Arc::new(LogStatusSink));
        }
        let url = self.status_url.clone().context("--status-url is required")?;
        let mut cfg = SinkConfig::new(url);
        cfg.token = self.status_token.clone();
        cfg.insecure_tls = self.insecure_tls;
        if cfg.insecure_tls {
            warn!("TLS verification of the status endpoint is disabled");
        }
        Ok(Arc::new(HttpStatusSink::new(cfg)?))
    }
}

/// Log filter from `VIGIL_LOG` (any `EnvFilter` directive), `info` when unset or invalid.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("VIGIL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Serve Prometheus metrics on `VIGIL_METRICS_ADDR` when it is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") else { return };
    let sock: SocketAddr = match addr.parse() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr = %addr, error = %e, "ignoring VIGIL_METRICS_ADDR; expected host:port");
            return;
        }
    };
    match PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(%sock, "metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

/// Cancel `stop` on Ctrl-C or SIGTERM.
async fn cancel_on_signal(stop: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl-C; shutting down"),
        _ = terminate => info!("received SIGTERM; shutting down"),
        _ = stop.cancelled() => return,
    }
    stop.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let sink = cli.status_sink()?;
    let client = kube::Client::try_default().await.context("connecting to the cluster")?;

    let stop = CancellationToken::new();
    tokio::spawn(cancel_on_signal(stop.clone()));

    if cli.watch_nodes {
        let (client, stop) = (client.clone(), stop.clone());
        tokio::spawn(async move {
            if let Err(e) = vigil_kubehub::watch_nodes(client, stop).await {
                warn!(error = %e, "node watcher stopped");
            }
        });
    }

    let notifier = Arc::new(KubePodNotifier::new(client, cli.namespace.clone()));
    let controller = Controller::new(
        cli.controller_config(),
        controller_rate_limiter(cli.rate_limit()),
        sink,
        Arc::new(LogErrorReporter),
    );
    let res = controller.run(notifier, stop.clone()).await;
    stop.cancel();
    res?;
    Ok(())
}
