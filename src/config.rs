//! Persistent pipeline configuration model and defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Loop cadence and queue behavior.
    pub pipeline: PipelineConfig,
    #[serde(default)]
    /// Backoff, circuit-breaker and dispatch quota tuning.
    pub rate: RateConfig,
    #[serde(default)]
    /// Durable result store settings.
    pub store: StoreConfig,
    #[serde(default)]
    /// Profile lookup endpoint and credentials.
    pub network: NetworkConfig,
    #[serde(default)]
    /// Label rendering preferences.
    pub labels: LabelConfig,
    #[serde(default)]
    /// Diagnostics panel and logging preferences.
    pub diagnostics: DiagnosticsConfig,
}

/// What to remember about a lookup that succeeded without a usable label.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPolicy {
    /// Remember the handle for the session so discovery stops re-queuing it.
    #[default]
    Suppress,
    /// Forget the outcome; the handle is queued again on its next discovery.
    Retry,
}

/// Loop cadence and queue behavior.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default = "default_drain_jitter_ms")]
    pub drain_jitter_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Drop the rest of the queue when the remote endpoint rejects a lookup.
    #[serde(default = "default_true")]
    pub clear_queue_on_rejection: bool,
    #[serde(default)]
    pub unknown_policy: UnknownPolicy,
}

/// Backoff, circuit-breaker and dispatch quota tuning.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RateConfig {
    /// Escalating per-handle delays; the last value repeats.
    #[serde(default = "default_backoff_sequence_secs")]
    pub backoff_sequence_secs: Vec<u64>,
    #[serde(default = "default_global_cooldown_secs")]
    pub global_cooldown_secs: u64,
    #[serde(default = "default_dispatch_quota_requests")]
    pub dispatch_quota_requests: u32,
    #[serde(default = "default_dispatch_quota_window_secs")]
    pub dispatch_quota_window_secs: u64,
}

/// Durable result store settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_expiry_days")]
    pub expiry_days: u32,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    /// Overrides the database location under the user data directory.
    #[serde(default)]
    pub database_file: Option<PathBuf>,
}

/// Profile lookup endpoint and credentials.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default)]
    pub csrf_token: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// How a resolved region is shown next to the handle.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LabelStyle {
    /// Region name, e.g. `Japan`.
    #[default]
    Name,
    /// Regional-indicator flag emoji.
    Flag,
}

/// Label rendering preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize, Default)]
pub struct LabelConfig {
    #[serde(default)]
    pub style: LabelStyle,
}

/// Diagnostics panel and logging preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_true")]
    pub panel_enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: default_discovery_interval_ms(),
            drain_interval_ms: default_drain_interval_ms(),
            drain_jitter_ms: default_drain_jitter_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            staleness_ms: default_staleness_ms(),
            max_pending: default_max_pending(),
            clear_queue_on_rejection: true,
            unknown_policy: UnknownPolicy::default(),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            backoff_sequence_secs: default_backoff_sequence_secs(),
            global_cooldown_secs: default_global_cooldown_secs(),
            dispatch_quota_requests: default_dispatch_quota_requests(),
            dispatch_quota_window_secs: default_dispatch_quota_window_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            expiry_days: default_expiry_days(),
            storage_key: default_storage_key(),
            database_file: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            bearer_token: String::new(),
            csrf_token: String::new(),
            cookie: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            panel_enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
            log_level: default_log_level(),
        }
    }
}

impl RateConfig {
    pub fn backoff_sequence(&self) -> Vec<Duration> {
        self.backoff_sequence_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }
}

impl StoreConfig {
    pub fn expiry_horizon(&self) -> Duration {
        Duration::from_secs(u64::from(self.expiry_days) * 24 * 60 * 60)
    }
}

impl DiagnosticsConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.log_level.trim().to_ascii_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

/// Clamps every knob into a range the pipeline can run with.
pub fn sanitize_config(config: Config) -> Config {
    let mut backoff_sequence_secs: Vec<u64> = config
        .rate
        .backoff_sequence_secs
        .iter()
        .map(|secs| (*secs).max(1))
        .collect();
    if backoff_sequence_secs.is_empty() {
        backoff_sequence_secs = default_backoff_sequence_secs();
    }
    // Escalation must never step back below an earlier delay.
    let mut floor = 0;
    for secs in backoff_sequence_secs.iter_mut() {
        *secs = (*secs).max(floor);
        floor = *secs;
    }

    let storage_key = if config.store.storage_key.trim().is_empty() {
        default_storage_key()
    } else {
        config.store.storage_key.trim().to_string()
    };

    Config {
        pipeline: PipelineConfig {
            discovery_interval_ms: config.pipeline.discovery_interval_ms.clamp(100, 60_000),
            drain_interval_ms: config.pipeline.drain_interval_ms.clamp(250, 600_000),
            drain_jitter_ms: config.pipeline.drain_jitter_ms.min(60_000),
            sweep_interval_ms: config.pipeline.sweep_interval_ms.clamp(500, 600_000),
            staleness_ms: config.pipeline.staleness_ms.clamp(1_000, 3_600_000),
            max_pending: config.pipeline.max_pending.clamp(1, 10_000),
            clear_queue_on_rejection: config.pipeline.clear_queue_on_rejection,
            unknown_policy: config.pipeline.unknown_policy,
        },
        rate: RateConfig {
            backoff_sequence_secs,
            global_cooldown_secs: config.rate.global_cooldown_secs.clamp(1, 3_600),
            dispatch_quota_requests: config.rate.dispatch_quota_requests.max(1),
            dispatch_quota_window_secs: config.rate.dispatch_quota_window_secs.clamp(1, 86_400),
        },
        store: StoreConfig {
            expiry_days: config.store.expiry_days.clamp(1, 365),
            storage_key,
            database_file: config.store.database_file,
        },
        network: NetworkConfig {
            timeout_ms: config.network.timeout_ms.clamp(500, 120_000),
            ..config.network
        },
        labels: config.labels,
        diagnostics: DiagnosticsConfig {
            poll_interval_ms: config.diagnostics.poll_interval_ms.clamp(250, 60_000),
            ..config.diagnostics
        },
    }
}

fn default_true() -> bool {
    true
}

fn default_discovery_interval_ms() -> u64 {
    1_000
}

fn default_drain_interval_ms() -> u64 {
    5_000
}

fn default_drain_jitter_ms() -> u64 {
    2_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

fn default_staleness_ms() -> u64 {
    30_000
}

fn default_max_pending() -> usize {
    256
}

fn default_backoff_sequence_secs() -> Vec<u64> {
    vec![60, 120, 300, 600, 900]
}

fn default_global_cooldown_secs() -> u64 {
    30
}

fn default_dispatch_quota_requests() -> u32 {
    900
}

fn default_dispatch_quota_window_secs() -> u64 {
    120
}

fn default_expiry_days() -> u32 {
    10
}

fn default_storage_key() -> String {
    "handle_label_cache".to_string()
}

fn default_endpoint() -> String {
    "https://x.com/i/api/graphql/zs_jFPFT78rBpXv9Z3U2YQ/AboutAccountQuery".to_string()
}

fn default_timeout_ms() -> u64 {
    8_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_string()
}
