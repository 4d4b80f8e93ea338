use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use tracing::trace;

use crate::dispatch::retry::RetryPolicy;
use crate::error::ConfigError;
use crate::util::{get_api_token, get_orchestrator_token};

/// Storage backend configuration for the dispatch queue
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory queue (entries are lost on restart)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default, survives restarts)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Dead letters older than this are purged
        dead_letter_retention_days: Option<u32>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            dead_letter_retention_days: Some(default_retention_days()),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./relay.db")
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub targets: Vec<TargetConfig>,

    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Storage configuration (optional - defaults to SQLite)
    pub storage: Option<StorageConfig>,

    /// Status API (optional - disabled when absent)
    pub api: Option<ApiSettings>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TargetConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: TargetKindConfig,
    /// Polling interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TargetKindConfig {
    HostResource {
        /// Mount point whose usage is reported as `disk`
        mount: Option<PathBuf>,
    },
    Process {
        /// Exact process name to look for
        name: String,
    },
    CustomProbe {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        expected_status: Option<Vec<u16>>,
        body_pattern: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Head,
}

/// Severity tiers for one metric
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Threshold {
    pub metric: String,
    pub critical: Option<Bound>,
    pub degraded: Option<Bound>,
}

/// Inclusive bounds; a value at or beyond either one triggers the tier
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Deserialize)]
pub struct Bound {
    pub above: Option<f64>,
    pub below: Option<f64>,
}

impl Bound {
    pub fn above(limit: f64) -> Self {
        Self {
            above: Some(limit),
            below: None,
        }
    }

    pub fn below(limit: f64) -> Self {
        Self {
            above: None,
            below: Some(limit),
        }
    }

    pub fn is_triggered_by(&self, value: f64) -> bool {
        self.above.is_some_and(|limit| value >= limit)
            || self.below.is_some_and(|limit| value <= limit)
    }

    fn is_valid(&self) -> bool {
        let finite = |limit: Option<f64>| limit.is_none_or(f64::is_finite);
        (self.above.is_some() || self.below.is_some()) && finite(self.above) && finite(self.below)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct OrchestratorConfig {
    pub endpoint_url: String,
    pub auth_token: Option<String>,
    /// Per-attempt timeout in seconds
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum delivery attempts per entry
    pub max_retries: u32,
    pub queue_capacity_per_target: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            queue_capacity_per_target: 100,
            batch_size: 32,
            poll_interval_ms: 1000,
            backoff_base_ms: 500,
            backoff_max_ms: 300_000,
            shutdown_grace_secs: 10,
        }
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Consecutive cycles a new state must persist before it is confirmed
    pub debounce_cycles: u32,
    /// Emit an `unknown -> x` event for the first confirmed state of a target
    pub announce_initial_state: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            debounce_cycles: 1,
            announce_initial_state: false,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub read_timeout_secs: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 5,
        }
    }
}

impl SamplerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_bind")]
    pub bind_addr: SocketAddr,
    pub auth_token: Option<String>,
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

fn default_api_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_enable_cors() -> bool {
    true
}

/// One day
const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// One hour
const MAX_SHUTDOWN_GRACE_SECS: u64 = 60 * 60;

/// A hundred years
const MAX_RETENTION_DAYS: u32 = 36_500;

fn default_interval() -> u64 {
    15
}

fn default_delivery_timeout() -> u64 {
    10
}

/// A fully validated target
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub id: String,
    pub kind: TargetKind,
    pub interval: Duration,
    pub thresholds: Vec<Threshold>,
}

#[derive(Debug, Clone)]
pub enum TargetKind {
    HostResource { mount: Option<PathBuf> },
    Process { name: String },
    CustomProbe(ProbeSpec),
}

#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub url: Url,
    pub method: HttpMethod,
    pub expected_status: Vec<u16>,
    pub body_pattern: Option<Regex>,
}

impl TargetKind {
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::HostResource { .. } => "host-resource",
            TargetKind::Process { .. } => "process",
            TargetKind::CustomProbe(_) => "custom-probe",
        }
    }

    /// Metric names the sampler reports for this kind
    pub fn known_metrics(&self) -> &'static [&'static str] {
        match self {
            TargetKind::HostResource { .. } => &["cpu", "memory", "disk"],
            TargetKind::Process { .. } => &["running", "cpu", "memory_mb"],
            TargetKind::CustomProbe(_) => &["up", "status_code", "latency_ms"],
        }
    }

    /// Rule applied when a target configures no thresholds
    fn default_thresholds(&self) -> Option<Vec<Threshold>> {
        let liveness = |metric: &str| Threshold {
            metric: metric.to_string(),
            critical: Some(Bound::below(0.0)),
            degraded: None,
        };
        match self {
            TargetKind::HostResource { .. } => None,
            TargetKind::Process { .. } => Some(vec![liveness("running")]),
            TargetKind::CustomProbe(_) => Some(vec![liveness("up")]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedOrchestrator {
    pub endpoint_url: Url,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub targets: Vec<ResolvedTarget>,
    pub orchestrator: ResolvedOrchestrator,
    pub dispatch: DispatchConfig,
    pub detector: DetectorConfig,
    pub sampler: SamplerConfig,
    pub storage: StorageConfig,
    pub api: Option<ApiSettings>,
}

impl Config {
    /// Validate everything up front so a bad target never starts running
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("no targets configured".into()));
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(self.targets.len());
        for target in self.targets {
            let target = target.resolve()?;
            if !seen.insert(target.id.clone()) {
                return Err(ConfigError::target(&target.id, "duplicate target id"));
            }
            targets.push(target);
        }

        let orchestrator = self.orchestrator.resolve()?;
        validate_dispatch(&self.dispatch)?;

        if let Some(StorageConfig::Sqlite {
            dead_letter_retention_days: Some(days),
            ..
        }) = &self.storage
        {
            if *days > MAX_RETENTION_DAYS {
                return Err(ConfigError::Invalid(format!(
                    "storage.dead_letter_retention_days must not exceed {MAX_RETENTION_DAYS}"
                )));
            }
        }

        if self.detector.debounce_cycles == 0 {
            return Err(ConfigError::Invalid(
                "detector.debounce_cycles must be at least 1".into(),
            ));
        }
        if self.sampler.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sampler.read_timeout_secs must be at least 1".into(),
            ));
        }

        Ok(ResolvedConfig {
            targets,
            orchestrator,
            dispatch: self.dispatch,
            detector: self.detector,
            sampler: self.sampler,
            storage: self.storage.unwrap_or_default(),
            api: self.api,
        })
    }
}

impl TargetConfig {
    fn resolve(self) -> Result<ResolvedTarget, ConfigError> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(ConfigError::Invalid("target id must not be empty".into()));
        }
        if self.interval == 0 {
            return Err(ConfigError::target(&id, "interval must be at least 1 second"));
        }
        if self.interval > MAX_INTERVAL_SECS {
            return Err(ConfigError::target(
                &id,
                format!("interval must not exceed {MAX_INTERVAL_SECS} seconds"),
            ));
        }

        let kind = match self.kind {
            TargetKindConfig::HostResource { mount } => TargetKind::HostResource { mount },
            TargetKindConfig::Process { name } => {
                if name.trim().is_empty() {
                    return Err(ConfigError::target(&id, "process name must not be empty"));
                }
                TargetKind::Process { name }
            }
            TargetKindConfig::CustomProbe {
                url,
                method,
                expected_status,
                body_pattern,
            } => {
                let url = parse_http_url(&url).map_err(|msg| ConfigError::target(&id, msg))?;
                let body_pattern = body_pattern
                    .map(|pattern| Regex::new(&pattern))
                    .transpose()
                    .map_err(|e| ConfigError::target(&id, format!("invalid body pattern: {e}")))?;
                let expected_status = expected_status.unwrap_or_else(|| vec![200]);
                if expected_status.is_empty() {
                    return Err(ConfigError::target(&id, "expected_status must not be empty"));
                }
                TargetKind::CustomProbe(ProbeSpec {
                    url,
                    method,
                    expected_status,
                    body_pattern,
                })
            }
        };

        let thresholds = if self.thresholds.is_empty() {
            kind.default_thresholds().ok_or_else(|| {
                ConfigError::target(&id, format!("{} targets need thresholds", kind.name()))
            })?
        } else {
            validate_thresholds(&id, &kind, &self.thresholds)?;
            self.thresholds
        };

        Ok(ResolvedTarget {
            id,
            kind,
            interval: Duration::from_secs(self.interval),
            thresholds,
        })
    }
}

fn validate_thresholds(
    id: &str,
    kind: &TargetKind,
    thresholds: &[Threshold],
) -> Result<(), ConfigError> {
    let mut metrics = HashSet::new();
    for threshold in thresholds {
        if !kind.known_metrics().contains(&threshold.metric.as_str()) {
            return Err(ConfigError::target(
                id,
                format!(
                    "unknown metric '{}' for {} (expected one of {:?})",
                    threshold.metric,
                    kind.name(),
                    kind.known_metrics()
                ),
            ));
        }
        if !metrics.insert(threshold.metric.as_str()) {
            return Err(ConfigError::target(
                id,
                format!("duplicate threshold for metric '{}'", threshold.metric),
            ));
        }
        if threshold.critical.is_none() && threshold.degraded.is_none() {
            return Err(ConfigError::target(
                id,
                format!("threshold for '{}' has no severity tier", threshold.metric),
            ));
        }
        let tiers = [threshold.critical, threshold.degraded];
        if tiers.iter().flatten().any(|bound| !bound.is_valid()) {
            return Err(ConfigError::target(
                id,
                format!(
                    "threshold for '{}' needs finite 'above' or 'below' bounds",
                    threshold.metric
                ),
            ));
        }
    }
    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
    let checks = [
        (dispatch.max_retries == 0, "dispatch.max_retries"),
        (
            dispatch.queue_capacity_per_target == 0,
            "dispatch.queue_capacity_per_target",
        ),
        (dispatch.batch_size == 0, "dispatch.batch_size"),
        (dispatch.poll_interval_ms == 0, "dispatch.poll_interval_ms"),
    ];
    if let Some((_, field)) = checks.iter().find(|(failed, _)| *failed) {
        return Err(ConfigError::Invalid(format!("{field} must be at least 1")));
    }
    if dispatch.shutdown_grace_secs > MAX_SHUTDOWN_GRACE_SECS {
        return Err(ConfigError::Invalid(format!(
            "dispatch.shutdown_grace_secs must not exceed {MAX_SHUTDOWN_GRACE_SECS}"
        )));
    }
    if dispatch.backoff_max_ms < dispatch.backoff_base_ms {
        return Err(ConfigError::Invalid(
            "dispatch.backoff_max_ms must not be below dispatch.backoff_base_ms".into(),
        ));
    }
    Ok(())
}

impl OrchestratorConfig {
    fn resolve(self) -> Result<ResolvedOrchestrator, ConfigError> {
        let endpoint_url = parse_http_url(&self.endpoint_url)
            .map_err(|msg| ConfigError::Invalid(format!("orchestrator.endpoint_url: {msg}")))?;
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.timeout_secs must be at least 1".into(),
            ));
        }
        Ok(ResolvedOrchestrator {
            endpoint_url,
            auth_token: self.auth_token.filter(|token| !token.is_empty()),
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid url '{raw}': {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(format!("unsupported url scheme '{scheme}'")),
    }
}

pub fn read_config_file(path: &str) -> Result<Config, ConfigError> {
    let file_content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&file_content)?;
    trace!("loaded config: {config:?}");
    Ok(config)
}

/// Read, apply environment overrides and validate
pub fn load(path: &str) -> Result<ResolvedConfig, ConfigError> {
    let mut config = read_config_file(path)?;

    if let Some(token) = get_orchestrator_token() {
        config.orchestrator.auth_token = Some(token);
    }
    if let (Some(api), Some(token)) = (config.api.as_mut(), get_api_token()) {
        api.auth_token = Some(token);
    }

    config.resolve()
}
