//! Metric sampling
//!
//! A [`Sampler`] turns a target into a [`Snapshot`]. The actual reads go
//! through a [`MetricSource`], so tests can script readings instead of
//! touching the host.
//!
//! Failures never escape: a read error or a read exceeding the timeout
//! produces an unreadable snapshot, which evaluates to `Unknown`.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use sysinfo::{Disks, MINIMUM_CPU_UPDATE_INTERVAL, ProcessesToUpdate, System};
use tracing::{debug, instrument, trace, warn};

use crate::Snapshot;
use crate::config::{HttpMethod, ProbeSpec, ResolvedTarget, TargetKind};
use crate::error::ProbeError;

pub type Metrics = BTreeMap<String, f64>;

/// Where raw metric values come from
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn read(&self, target: &ResolvedTarget) -> Result<Metrics, ProbeError>;
}

pub struct Sampler {
    source: Arc<dyn MetricSource>,
    read_timeout: Duration,
}

impl Sampler {
    pub fn new(source: Arc<dyn MetricSource>, read_timeout: Duration) -> Self {
        Self {
            source,
            read_timeout,
        }
    }

    #[instrument(skip_all, fields(target_id = %target.id))]
    pub async fn sample(&self, target: &ResolvedTarget) -> Snapshot {
        let read = tokio::time::timeout(self.read_timeout, self.source.read(target)).await;

        match read {
            Ok(Ok(metrics)) => {
                trace!("read {} metrics", metrics.len());
                Snapshot::new(&target.id, metrics)
            }
            Ok(Err(e)) => {
                warn!("target unreadable: {e}");
                Snapshot::unreadable(&target.id, e.to_string())
            }
            Err(_) => {
                let e = ProbeError::Timeout(self.read_timeout);
                warn!("target unreadable: {e}");
                Snapshot::unreadable(&target.id, e.to_string())
            }
        }
    }

    /// Sample several targets concurrently; snapshots keep the input order.
    pub async fn sample_all(&self, targets: &[&ResolvedTarget]) -> Vec<Snapshot> {
        join_all(targets.iter().map(|target| self.sample(target))).await
    }
}

/// Production source: `sysinfo` for host and process targets, HTTP for probes
pub struct SystemSource {
    client: reqwest::Client,
}

impl SystemSource {
    pub fn new(probe_timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(probe_timeout).build()?,
        })
    }

    async fn probe(&self, spec: &ProbeSpec) -> Result<Metrics, ProbeError> {
        let method = match spec.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Head => reqwest::Method::HEAD,
        };

        let start = Instant::now();
        let response = self.client.request(method, spec.url.clone()).send().await?;
        let status_code = response.status().as_u16();

        let body = if matches!(spec.method, HttpMethod::Head) || spec.body_pattern.is_none() {
            String::new()
        } else {
            response.text().await?
        };
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let up = spec.expected_status.contains(&status_code)
            && spec
                .body_pattern
                .as_ref()
                .is_none_or(|pattern| pattern.is_match(&body));
        debug!("probe {} answered {status_code} in {latency_ms:.0}ms", spec.url);

        Ok(BTreeMap::from([
            ("up".to_string(), if up { 1.0 } else { 0.0 }),
            ("status_code".to_string(), f64::from(status_code)),
            ("latency_ms".to_string(), latency_ms),
        ]))
    }
}

#[async_trait]
impl MetricSource for SystemSource {
    async fn read(&self, target: &ResolvedTarget) -> Result<Metrics, ProbeError> {
        match &target.kind {
            TargetKind::HostResource { mount } => {
                let mount = mount.clone();
                tokio::task::spawn_blocking(move || read_host(mount.as_deref())).await?
            }
            TargetKind::Process { name } => {
                let name = name.clone();
                tokio::task::spawn_blocking(move || read_process(&name)).await?
            }
            TargetKind::CustomProbe(spec) => self.probe(spec).await,
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    used as f64 / total as f64 * 100.0
}

fn read_host(mount: Option<&Path>) -> Result<Metrics, ProbeError> {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    if sys.total_memory() == 0 {
        return Err(ProbeError::Unreadable("host reports no memory".into()));
    }

    let mut metrics = BTreeMap::from([
        ("cpu".to_string(), f64::from(sys.global_cpu_usage())),
        (
            "memory".to_string(),
            percent(sys.used_memory(), sys.total_memory()),
        ),
    ]);

    let disks = Disks::new_with_refreshed_list();
    let usage = |disk: &sysinfo::Disk| {
        let total = disk.total_space();
        (total > 0).then(|| percent(total.saturating_sub(disk.available_space()), total))
    };
    let disk = match mount {
        Some(mount) => {
            let disk = disks
                .list()
                .iter()
                .find(|disk| disk.mount_point() == mount)
                .ok_or_else(|| {
                    ProbeError::Unreadable(format!("no disk mounted at {}", mount.display()))
                })?;
            usage(disk)
        }
        None => disks.list().iter().filter_map(usage).reduce(f64::max),
    };
    if let Some(disk) = disk {
        metrics.insert("disk".to_string(), disk);
    }

    Ok(metrics)
}

fn read_process(name: &str) -> Result<Metrics, ProbeError> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let (running, cpu, memory) = sys.processes_by_exact_name(OsStr::new(name)).fold(
        (0u32, 0f64, 0u64),
        |(running, cpu, memory), process| {
            (
                running + 1,
                cpu + f64::from(process.cpu_usage()),
                memory + process.memory(),
            )
        },
    );

    Ok(BTreeMap::from([
        ("running".to_string(), f64::from(running)),
        ("cpu".to_string(), cpu),
        ("memory_mb".to_string(), memory as f64 / (1024.0 * 1024.0)),
    ]))
}
