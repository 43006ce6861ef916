//! Orzbob control-plane server.
//!
//! Wires the provider, token manager, quota/throttle/metering services,
//! and the HTTP API together, spawns the background loops, and serves
//! until SIGINT/SIGTERM. Services stop in reverse dependency order with a
//! final metering flush before exit.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use orzbob::api::{self, AppState, ServerContext};
use orzbob::auth::github::GitHubClient;
use orzbob::auth::token::TokenManager;
use orzbob::auth::users::UserStore;
use orzbob::billing::alerts::{self, BudgetAlertService};
use orzbob::billing::meter::{self, MeteringService};
use orzbob::billing::polar::PolarClient;
use orzbob::billing::quota::{self, InstanceQuota, QuotaEngine};
use orzbob::billing::{record_instance_usage, InstanceStarts};
use orzbob::config::Config;
use orzbob::email::SmtpSender;
use orzbob::heartbeat::{self, HeartbeatRegistry, ReaperDeps};
use orzbob::metrics::Metrics;
use orzbob::provider::docker::DockerProvider;
use orzbob::provider::fake::FakeProvider;
use orzbob::provider::Provider;
use orzbob::terminal::{EchoBinder, TerminalBinder};
use orzbob::throttle::{self, PauseHandler, PauseReason, ThrottleLimits, ThrottleService};

/// Control plane for short-lived developer sandboxes.
#[derive(Debug, Parser)]
#[command(name = "orzbob", version)]
struct Cli {
    /// TCP port to bind. Overrides config and `PORT`.
    #[arg(long)]
    port: Option<u16>,

    /// Sandbox provider: `fake` or `docker`. Overrides config.
    #[arg(long)]
    provider: Option<String>,
}

/// Pauses a sandbox by tearing its container down, after recording the
/// accrued runtime. Failure leaves the throttle tracker unpaused so the
/// next tick retries.
struct SandboxPauseHandler {
    provider: Arc<dyn Provider>,
    heartbeats: Arc<HeartbeatRegistry>,
    instance_quota: Arc<InstanceQuota>,
    metering: Arc<MeteringService>,
    quota: Arc<QuotaEngine>,
    starts: Arc<InstanceStarts>,
    metrics: Metrics,
}

#[async_trait]
impl PauseHandler for SandboxPauseHandler {
    async fn pause(&self, instance_id: &str, reason: PauseReason) -> Result<()> {
        let instance = self
            .provider
            .get_instance(instance_id)
            .await
            .context("pause target lookup failed")?;

        record_instance_usage(
            &self.metering,
            &self.quota,
            &self.starts,
            &instance,
            Utc::now(),
        )
        .await;

        self.provider
            .delete_instance(instance_id)
            .await
            .context("pause teardown failed")?;

        self.heartbeats.remove(instance_id).await;
        if let Some(org_id) = instance.org_id() {
            self.instance_quota.release(org_id).await;
        }
        self.metrics.instances_paused.inc();

        info!(instance_id, reason = %reason, "instance paused");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(provider) = cli.provider {
        config.provider.kind = provider;
    }

    let paths = config.paths();
    let _logging_guard = orzbob::logging::init(&paths.logs_dir)?;
    info!(version = env!("CARGO_PKG_VERSION"), "orzbob control plane starting");

    let metrics = Metrics::new().context("failed to build metric registry")?;

    // Token key material: fresh per process unless PEM is configured.
    let tokens = match &config.token.private_key_path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read token key {path}"))?;
            TokenManager::from_pem(config.token.issuer.clone(), &pem)?
        }
        None => TokenManager::generate(config.token.issuer.clone())?,
    };

    // Provider + terminal binder.
    let (provider, binder): (Arc<dyn Provider>, Arc<dyn TerminalBinder>) =
        match config.provider.kind.as_str() {
            "fake" => (Arc::new(FakeProvider::new()), Arc::new(EchoBinder)),
            "docker" => {
                let docker = Arc::new(
                    DockerProvider::new(config.provider.runner_image.clone())
                        .context("failed to connect to Docker")?,
                );
                (docker.clone(), docker)
            }
            other => anyhow::bail!("unknown provider {other:?}: expected fake or docker"),
        };
    info!(provider = %provider.kind(), "provider ready");

    // Billing stack.
    let polar: Option<Arc<dyn orzbob::billing::polar::BillingMeter>> = match &config.polar {
        Some(polar_config) => Some(Arc::new(
            PolarClient::new(polar_config).context("failed to build Polar client")?,
        )),
        None => {
            warn!("no Polar credentials configured; metering stays local");
            None
        }
    };

    let snapshot_path = (config.quota.snapshot_interval_secs > 0)
        .then(|| paths.quota_snapshot.clone());
    let quota_engine = Arc::new(QuotaEngine::new(polar.clone(), snapshot_path));
    let instance_quota = Arc::new(InstanceQuota::new(config.quota.free_max_instances));
    let metering = Arc::new(MeteringService::new(
        polar,
        quota_engine.clone(),
        metrics.clone(),
        Duration::from_secs(config.metering.flush_interval_secs),
    ));

    let users = Arc::new(UserStore::load(&paths.users_file)?);
    let heartbeats = Arc::new(HeartbeatRegistry::new());
    let starts = Arc::new(InstanceStarts::new());

    let pause_handler = Arc::new(SandboxPauseHandler {
        provider: provider.clone(),
        heartbeats: heartbeats.clone(),
        instance_quota: instance_quota.clone(),
        metering: metering.clone(),
        quota: quota_engine.clone(),
        starts: starts.clone(),
        metrics: metrics.clone(),
    });
    let throttle = Arc::new(ThrottleService::new(
        ThrottleLimits::from_config(&config.throttle),
        Some(pause_handler),
    ));

    let context: AppState = Arc::new(ServerContext {
        base_url: config.server.base_url.clone(),
        instance_ttl: Duration::from_secs(config.token.instance_ttl_secs),
        user_ttl: Duration::from_secs(
            u64::try_from(config.token.user_ttl_days)
                .unwrap_or(90)
                .saturating_mul(86_400),
        ),
        provider: provider.clone(),
        binder,
        tokens,
        users: users.clone(),
        identity: Arc::new(GitHubClient::new()),
        heartbeats: heartbeats.clone(),
        quota: quota_engine.clone(),
        instance_quota: instance_quota.clone(),
        throttle: throttle.clone(),
        metering: metering.clone(),
        starts: starts.clone(),
        metrics: metrics.clone(),
        started_at: Instant::now(),
    });

    // Background services, each joined on the shutdown channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut services = Vec::new();

    services.push((
        "idle reaper",
        tokio::spawn(heartbeat::run_reaper(
            ReaperDeps {
                provider: provider.clone(),
                heartbeats: heartbeats.clone(),
                metering: metering.clone(),
                quota: quota_engine.clone(),
                starts: starts.clone(),
                instance_quota: instance_quota.clone(),
                throttle: throttle.clone(),
                metrics: metrics.clone(),
            },
            config.reaper.clone(),
            shutdown_rx.clone(),
        )),
    ));

    services.push((
        "throttle",
        tokio::spawn(throttle::run_throttle(
            throttle.clone(),
            Duration::from_secs(config.throttle.check_interval_secs),
            shutdown_rx.clone(),
        )),
    ));

    if config.quota.snapshot_interval_secs > 0 {
        services.push((
            "quota persister",
            tokio::spawn(quota::run_persister(
                quota_engine.clone(),
                Duration::from_secs(config.quota.snapshot_interval_secs),
                shutdown_rx.clone(),
            )),
        ));
    }

    if let Some(smtp_config) = &config.smtp {
        let sender = Arc::new(SmtpSender::new(smtp_config)?);
        let alert_service = Arc::new(BudgetAlertService::new(
            quota_engine.clone(),
            users.clone(),
            sender,
            config.alerts.plan_url.clone(),
        ));
        services.push((
            "budget alerts",
            tokio::spawn(alerts::run_alerts(
                alert_service,
                Duration::from_secs(config.alerts.check_interval_secs),
                shutdown_rx.clone(),
            )),
        ));
    } else {
        warn!("no SMTP configured; budget alerts disabled");
    }

    // Metering flusher stops last: its shutdown path issues the final flush.
    services.push((
        "metering flusher",
        tokio::spawn(meter::run_flusher(metering.clone(), shutdown_rx.clone())),
    ));

    // HTTP server.
    let app = api::router(context);
    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    // The drain after the stop signal is bounded by the shutdown deadline:
    // attach sockets are long-lived and must not hold shutdown hostage.
    let shutdown_deadline = Duration::from_secs(config.server.shutdown_timeout_secs.max(1));
    let (signal_tx, mut signal_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_tx.send(true).ok();
    });

    let mut drain_rx = signal_rx.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            drain_rx.wait_for(|signaled| *signaled).await.ok();
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.context("server error")?;
        }
        _ = signal_rx.wait_for(|signaled| *signaled) => {
            match tokio::time::timeout(shutdown_deadline, &mut server).await {
                Ok(result) => result.context("server error")?,
                Err(_) => warn!(
                    deadline_secs = shutdown_deadline.as_secs(),
                    "open connections did not drain in time"
                ),
            }
        }
    }

    // Stop services in reverse dependency order; the flusher was pushed
    // last and drains the metering queue on its way out.
    info!("shutting down background services");
    shutdown_tx.send(true).ok();
    for (name, handle) in services {
        match tokio::time::timeout(shutdown_deadline, handle).await {
            Ok(Ok(())) => info!(service = name, "stopped"),
            Ok(Err(e)) => error!(service = name, error = %e, "service task failed"),
            Err(_) => warn!(service = name, "service did not stop in time"),
        }
    }

    info!("orzbob control plane stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
