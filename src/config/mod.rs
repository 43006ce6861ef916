//! Configuration loading and management.
//!
//! Loads control-plane configuration from `./orzbob.toml` (or
//! `$ORZBOB_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level control-plane configuration loaded from TOML.
///
/// Path: `./orzbob.toml` or `$ORZBOB_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Sandbox provider settings.
    pub provider: ProviderConfig,
    /// Capability token settings.
    pub token: TokenConfig,
    /// Quota and billing-period settings.
    pub quota: QuotaConfig,
    /// Runtime throttling limits.
    pub throttle: ThrottleConfig,
    /// Idle reaping settings.
    pub reaper: ReaperConfig,
    /// Usage metering settings.
    pub metering: MeteringConfig,
    /// External billing meter (Polar) credentials. Absent disables metering
    /// submission and subscription lookups.
    pub polar: Option<PolarConfig>,
    /// SMTP transport for budget alert emails. Absent disables alerts.
    pub smtp: Option<SmtpConfig>,
    /// Budget alert cadence and links.
    pub alerts: AlertConfig,
    /// Filesystem root for persisted state.
    pub data_dir: Option<String>,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$ORZBOB_CONFIG_PATH` or `./orzbob.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config file path: `$ORZBOB_CONFIG_PATH` first, then
    /// `./orzbob.toml` in the working directory.
    fn config_path() -> PathBuf {
        std::env::var("ORZBOB_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("orzbob.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids mutating the
    /// process environment in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Server.
        if let Some(v) = env("BASE_URL") {
            self.server.base_url = v;
        }
        if let Some(v) = env("PORT") {
            match v.parse() {
                Ok(n) => self.server.port = n,
                Err(_) => tracing::warn!(var = "PORT", value = %v, "ignoring invalid env override"),
            }
        }

        // Provider.
        if let Some(v) = env("RUNNER_IMAGE") {
            self.provider.runner_image = v;
        }

        // Data dir.
        if let Some(v) = env("ORZBOB_DATA_DIR") {
            self.data_dir = Some(v);
        }

        // Polar (env var presence creates the section).
        let polar_token = env("POLAR_ACCESS_TOKEN").or_else(|| env("POLAR_API_KEY"));
        if let Some(access_token) = polar_token {
            let mut polar = self.polar.clone().unwrap_or_default();
            polar.access_token = access_token;
            if let Some(v) = env("POLAR_ORGANIZATION_ID") {
                polar.organization_id = v;
            }
            if let Some(v) = env("POLAR_PROJECT_ID") {
                polar.project_id = v;
            }
            if let Some(v) = env("POLAR_WEBHOOK_SECRET") {
                polar.webhook_secret = Some(v);
            }
            if let Some(v) = env("POLAR_METER_ID") {
                polar.meter_id = v;
            }
            self.polar = Some(polar);
        }

        // SMTP (env var presence creates the section).
        if let Some(host) = env("SMTP_HOST") {
            let mut smtp = self.smtp.clone().unwrap_or_default();
            smtp.host = host;
            if let Some(v) = env("SMTP_PORT") {
                match v.parse() {
                    Ok(n) => smtp.port = n,
                    Err(_) => {
                        tracing::warn!(var = "SMTP_PORT", value = %v, "ignoring invalid env override");
                    }
                }
            }
            if let Some(v) = env("SMTP_USERNAME") {
                smtp.username = v;
            }
            if let Some(v) = env("SMTP_PASSWORD") {
                smtp.password = v;
            }
            if let Some(v) = env("EMAIL_FROM_ADDRESS") {
                smtp.from_address = v;
            }
            if let Some(v) = env("EMAIL_FROM_NAME") {
                smtp.from_name = v;
            }
            self.smtp = Some(smtp);
        }
    }

    /// Resolve runtime filesystem paths from the configured data dir.
    pub fn paths(&self) -> RuntimePaths {
        RuntimePaths::resolve(self.data_dir.as_deref())
    }
}

// ── Sections ────────────────────────────────────────────────────

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to bind.
    pub port: u16,
    /// Externally reachable base URL, used to compose attach URLs.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Graceful shutdown deadline in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            base_url: "http://localhost:8080".to_owned(),
            request_timeout_secs: 60,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Sandbox provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider kind: `fake` or `docker`.
    pub kind: String,
    /// Image run inside each sandbox container.
    pub runner_image: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "fake".to_owned(),
            runner_image: "orzbob/runner:latest".to_owned(),
        }
    }
}

/// Capability token settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Issuer string stamped into and required of every token.
    pub issuer: String,
    /// Optional PEM file with a PKCS#8 P-256 private key. Absent generates
    /// a fresh process-lifetime key pair.
    pub private_key_path: Option<String>,
    /// Instance token lifetime in seconds. Kept short; clients fetch a
    /// fresh attach URL immediately before dialing.
    pub instance_ttl_secs: u64,
    /// User token lifetime in days.
    pub user_ttl_days: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "orzbob-control-plane".to_owned(),
            private_key_path: None,
            instance_ttl_secs: 120,
            user_ttl_days: 90,
        }
    }
}

/// Quota and billing-period settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum concurrently live instances per org on the free tier.
    pub free_max_instances: u32,
    /// Seconds between quota snapshot writes. Zero disables persistence.
    pub snapshot_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_max_instances: 3,
            snapshot_interval_secs: 300,
        }
    }
}

/// Runtime throttling limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Maximum continuous run in hours before a pause.
    pub continuous_limit_hours: u64,
    /// Maximum accumulated per-org runtime per UTC day, in hours.
    pub daily_limit_hours: u64,
    /// Idle window in minutes before a pause.
    pub idle_timeout_mins: u64,
    /// Seconds between throttle evaluation ticks.
    pub check_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            continuous_limit_hours: 8,
            daily_limit_hours: 24,
            idle_timeout_mins: 30,
            check_interval_secs: 60,
        }
    }
}

/// Idle reaping settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Minutes without a heartbeat before an instance is reaped.
    pub idle_timeout_mins: u64,
    /// Seconds between reaper sweeps.
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_timeout_mins: 30,
            interval_secs: 60,
        }
    }
}

/// Usage metering settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    /// Seconds between flushes of the in-memory sample queue.
    pub flush_interval_secs: u64,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
        }
    }
}

/// External billing meter (Polar) credentials and ids.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolarConfig {
    /// Bearer token for the Polar API.
    pub access_token: String,
    /// API base URL. Overridable for tests.
    pub base_url: Option<String>,
    /// Meter id usage is posted against.
    pub meter_id: String,
    /// Polar organization id for product lookups.
    pub organization_id: String,
    /// Polar project id.
    pub project_id: String,
    /// Webhook signing secret.
    pub webhook_secret: Option<String>,
}

/// SMTP transport settings for alert email.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// SMTP relay host.
    pub host: String,
    /// SMTP relay port.
    pub port: u16,
    /// SMTP username.
    pub username: String,
    /// SMTP password.
    pub password: String,
    /// From address on outgoing alerts.
    pub from_address: String,
    /// Display name on outgoing alerts.
    pub from_name: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from_address: "billing@orzbob.dev".to_owned(),
            from_name: "Orzbob Billing".to_owned(),
        }
    }
}

/// Budget alert cadence and links.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Seconds between alert evaluation passes.
    pub check_interval_secs: u64,
    /// Deep link to plan management included in alert emails.
    pub plan_url: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 3600,
            plan_url: "https://orzbob.dev/account/plan".to_owned(),
        }
    }
}

// ── Runtime paths ───────────────────────────────────────────────

/// Resolved filesystem locations for persisted state.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root data directory.
    pub root: PathBuf,
    /// Directory holding billing snapshots.
    pub billing_dir: PathBuf,
    /// Quota snapshot file.
    pub quota_snapshot: PathBuf,
    /// User store file.
    pub users_file: PathBuf,
    /// Log output directory.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Resolve paths under `data_dir`, defaulting to `/tmp/orzbob`.
    ///
    /// The user store keeps its historical location `/tmp/orzbob-users.json`
    /// when no data dir is configured.
    pub fn resolve(data_dir: Option<&str>) -> Self {
        match data_dir {
            Some(dir) => {
                let root = PathBuf::from(dir);
                Self {
                    billing_dir: root.join("billing"),
                    quota_snapshot: root.join("billing").join("quota_usage.json"),
                    users_file: root.join("users.json"),
                    logs_dir: root.join("logs"),
                    root,
                }
            }
            None => {
                let root = PathBuf::from("/tmp/orzbob");
                Self {
                    billing_dir: root.join("billing"),
                    quota_snapshot: root.join("billing").join("quota_usage.json"),
                    users_file: PathBuf::from("/tmp/orzbob-users.json"),
                    logs_dir: root.join("logs"),
                    root,
                }
            }
        }
    }
}
