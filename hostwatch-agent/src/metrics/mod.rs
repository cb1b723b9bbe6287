//! Host metrics collection
//!
//! Each enabled category becomes one key of the `metrics` object in the
//! telemetry envelope:
//! - `cpu`: global and per-core usage, load averages
//! - `memory`: RAM and swap usage
//! - `disk`: usage per mounted filesystem
//! - `network`: per-interface counters, addresses and MAC
//! - `temperature`: sensor readings, where the platform exposes them
//! - `processes`: totals, top consumers, watched process names
//! - `port_check`: TCP reachability of configured targets
//!
//! Collection never fails the tick: a category that cannot be gathered is
//! left out with a warning.

use crate::config::{MetricsConfig, PortCheckConfig, PortTarget};
use async_trait::async_trait;
use if_addrs::{get_if_addrs, IfAddr};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use sysinfo::{Components, Disks, Networks, ProcessStatus, System};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Supplier of the opaque `metrics` mapping
#[async_trait]
pub trait MetricCollector: Send + Sync {
    async fn collect(&self) -> Map<String, Value>;
}

/// `cpu` category: usage, per-core usage and load
#[derive(Debug, Serialize)]
pub struct CpuMetrics {
    pub percent: f32,
    pub per_cpu_percent: Vec<f32>,
    pub core_count: usize,
    pub load_avg: Option<LoadAverage>,
}

/// 1/5/15 minute load average
#[derive(Debug, Serialize)]
pub struct LoadAverage {
    #[serde(rename = "1min")]
    pub one: f64,
    #[serde(rename = "5min")]
    pub five: f64,
    #[serde(rename = "15min")]
    pub fifteen: f64,
}

/// `memory` category, sizes in GB
#[derive(Debug, Serialize)]
pub struct MemoryMetrics {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
    pub swap: SwapMetrics,
}

/// Swap usage, sizes in GB
#[derive(Debug, Serialize)]
pub struct SwapMetrics {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
}

/// `disk` category
#[derive(Debug, Serialize)]
pub struct DiskMetrics {
    pub partitions: Vec<PartitionMetrics>,
}

/// One mounted filesystem
#[derive(Debug, Serialize)]
pub struct PartitionMetrics {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
}

/// `network` category: totals plus per-interface detail
#[derive(Debug, Serialize)]
pub struct NetworkMetrics {
    pub io_counters: BTreeMap<String, InterfaceCounters>,
    pub interfaces: BTreeMap<String, InterfaceInfo>,
}

/// Byte and packet counters since boot
#[derive(Debug, Serialize)]
pub struct InterfaceCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
}

/// Addresses and MAC of one interface
#[derive(Debug, Default, Serialize)]
pub struct InterfaceInfo {
    pub mac: Option<String>,
    pub addresses: Vec<String>,
}

/// `temperature` category
#[derive(Debug, Serialize)]
pub struct TemperatureMetrics {
    pub sensors: Vec<TemperatureSensor>,
}

/// One component sensor reading, in Celsius
#[derive(Debug, Serialize)]
pub struct TemperatureSensor {
    pub label: String,
    pub current: f32,
    pub critical: Option<f32>,
}

/// `processes` category
#[derive(Debug, Serialize)]
pub struct ProcessMetrics {
    pub total: usize,
    pub running: usize,
    pub sleeping: usize,
    pub stopped: usize,
    pub zombie: usize,
    pub top_cpu: Vec<ProcessEntry>,
    pub top_memory: Vec<ProcessEntry>,
    pub watched: BTreeMap<String, WatchedProcess>,
}

/// A process in a top-N list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// A configured process name and whether it is running
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchedProcess {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// `port_check` category
#[derive(Debug, Serialize)]
pub struct PortCheckMetrics {
    pub targets: Vec<PortCheckResult>,
}

/// Outcome of one TCP connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Open,
    Closed,
    Timeout,
    DnsError,
}

/// One checked host and port
#[derive(Debug, Serialize)]
pub struct PortCheckResult {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: PortStatus,
    /// Milliseconds until the connect settled; absent when DNS failed
    pub response_time_ms: Option<f64>,
}

/// sysinfo-backed collector for the local host
pub struct SystemCollector {
    metrics: MetricsConfig,
    port_check: PortCheckConfig,
    // kept across ticks so CPU deltas have a baseline
    system: Mutex<System>,
}

impl SystemCollector {
    pub fn new(metrics: MetricsConfig, port_check: PortCheckConfig) -> Self {
        Self {
            metrics,
            port_check,
            system: Mutex::new(System::new()),
        }
    }

    fn wants_cpu_sample(&self) -> bool {
        self.metrics.cpu.enabled || self.metrics.processes.enabled
    }

    /// Two refreshes separated by sysinfo's minimum interval
    async fn sample_usage(&self) {
        if !self.wants_cpu_sample() {
            return;
        }
        {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_processes();
        }
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_processes();
    }

    fn cpu(&self) -> CpuMetrics {
        let system = self.system.lock();
        let load_avg = cfg!(unix).then(|| {
            let load = System::load_average();
            LoadAverage {
                one: load.one,
                five: load.five,
                fifteen: load.fifteen,
            }
        });

        CpuMetrics {
            percent: system.global_cpu_info().cpu_usage(),
            per_cpu_percent: system.cpus().iter().map(|c| c.cpu_usage()).collect(),
            core_count: system.cpus().len(),
            load_avg,
        }
    }

    fn memory(&self) -> MemoryMetrics {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        let available = system.available_memory();
        let used = total.saturating_sub(available);
        let swap_total = system.total_swap();
        let swap_used = system.used_swap();

        MemoryMetrics {
            total_gb: to_gb(total),
            used_gb: to_gb(used),
            free_gb: to_gb(available),
            percent: percent(used, total),
            swap: SwapMetrics {
                total_gb: to_gb(swap_total),
                used_gb: to_gb(swap_used),
                free_gb: to_gb(swap_total.saturating_sub(swap_used)),
                percent: percent(swap_used, swap_total),
            },
        }
    }

    fn disk(&self) -> DiskMetrics {
        let disks = Disks::new_with_refreshed_list();
        let partitions = disks
            .list()
            .iter()
            .filter_map(|disk| {
                let mountpoint = disk.mount_point().to_string_lossy().to_string();
                if is_ignored(&mountpoint, &self.metrics.disk.ignore_mounts) {
                    return None;
                }
                let total = disk.total_space();
                let free = disk.available_space();
                let used = total.saturating_sub(free);
                Some(PartitionMetrics {
                    device: disk.name().to_string_lossy().to_string(),
                    mountpoint,
                    fstype: disk.file_system().to_string_lossy().to_string(),
                    total_gb: to_gb(total),
                    used_gb: to_gb(used),
                    free_gb: to_gb(free),
                    percent: percent(used, total),
                })
            })
            .collect();

        DiskMetrics { partitions }
    }

    fn network(&self) -> NetworkMetrics {
        let ignore = &self.metrics.network.ignore_interfaces;
        let networks = Networks::new_with_refreshed_list();

        let io_counters = networks
            .iter()
            .filter(|(name, _)| !is_ignored(name, ignore))
            .map(|(name, data)| {
                let counters = InterfaceCounters {
                    bytes_sent: data.total_transmitted(),
                    bytes_recv: data.total_received(),
                    packets_sent: data.total_packets_transmitted(),
                    packets_recv: data.total_packets_received(),
                    errin: data.total_errors_on_received(),
                    errout: data.total_errors_on_transmitted(),
                };
                (name.clone(), counters)
            })
            .collect();

        let mut interfaces: BTreeMap<String, InterfaceInfo> = BTreeMap::new();
        match get_if_addrs() {
            Ok(addrs) => {
                for if_addr in addrs {
                    if is_ignored(&if_addr.name, ignore) {
                        continue;
                    }
                    let ip = match if_addr.addr {
                        IfAddr::V4(v4) => v4.ip.to_string(),
                        IfAddr::V6(v6) => v6.ip.to_string(),
                    };
                    let entry = interfaces.entry(if_addr.name.clone()).or_default();
                    if entry.mac.is_none() {
                        entry.mac = interface_mac(&if_addr.name);
                    }
                    entry.addresses.push(ip);
                }
            }
            Err(e) => warn!("Failed to enumerate network interfaces: {}", e),
        }

        NetworkMetrics {
            io_counters,
            interfaces,
        }
    }

    fn temperature(&self) -> TemperatureMetrics {
        let components = Components::new_with_refreshed_list();
        let sensors = components
            .list()
            .iter()
            .map(|c| TemperatureSensor {
                label: c.label().to_string(),
                current: c.temperature(),
                critical: c.critical(),
            })
            .collect();
        TemperatureMetrics { sensors }
    }

    fn processes(&self) -> ProcessMetrics {
        let system = self.system.lock();
        let config = &self.metrics.processes;

        let mut metrics = ProcessMetrics {
            total: 0,
            running: 0,
            sleeping: 0,
            stopped: 0,
            zombie: 0,
            top_cpu: Vec::new(),
            top_memory: Vec::new(),
            watched: BTreeMap::new(),
        };

        let mut entries = Vec::with_capacity(system.processes().len());
        for process in system.processes().values() {
            metrics.total += 1;
            match process.status() {
                ProcessStatus::Run => metrics.running += 1,
                ProcessStatus::Sleep | ProcessStatus::Idle => metrics.sleeping += 1,
                ProcessStatus::Stop => metrics.stopped += 1,
                ProcessStatus::Zombie => metrics.zombie += 1,
                _ => {}
            }
            entries.push(ProcessEntry {
                pid: process.pid().as_u32(),
                name: process.name().to_string(),
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / BYTES_PER_MB,
            });
        }

        metrics.top_cpu = top_by(&entries, config.top_count, |p| f64::from(p.cpu_percent));
        metrics.top_memory = top_by(&entries, config.top_count, |p| p.memory_mb);
        metrics.watched = watch_processes(&entries, &config.watch);
        metrics
    }

    async fn port_checks(&self) -> PortCheckMetrics {
        let timeout = Duration::from_secs(self.port_check.timeout_secs);
        let checks = self
            .port_check
            .targets
            .iter()
            .map(|target| check_port(target, timeout));
        PortCheckMetrics {
            targets: futures::future::join_all(checks).await,
        }
    }
}

#[async_trait]
impl MetricCollector for SystemCollector {
    async fn collect(&self) -> Map<String, Value> {
        debug!("Collecting system metrics...");
        self.sample_usage().await;

        let mut metrics = Map::new();
        if self.metrics.cpu.enabled {
            insert(&mut metrics, "cpu", &self.cpu());
        }
        if self.metrics.memory.enabled {
            insert(&mut metrics, "memory", &self.memory());
        }
        if self.metrics.disk.enabled {
            insert(&mut metrics, "disk", &self.disk());
        }
        if self.metrics.network.enabled {
            insert(&mut metrics, "network", &self.network());
        }
        if self.metrics.temperature.enabled {
            insert(&mut metrics, "temperature", &self.temperature());
        }
        if self.metrics.processes.enabled {
            insert(&mut metrics, "processes", &self.processes());
        }
        if self.port_check.enabled {
            insert(&mut metrics, "port_check", &self.port_checks().await);
        }
        metrics
    }
}

fn insert<T: Serialize>(metrics: &mut Map<String, Value>, category: &str, value: &T) {
    match serde_json::to_value(value) {
        Ok(value) => {
            metrics.insert(category.to_string(), value);
        }
        Err(e) => warn!("Dropping {} metrics: {}", category, e),
    }
}

fn to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / BYTES_PER_GB)
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 / whole as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Prefix match, so `docker` also hides `docker0`
fn is_ignored(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
}

fn interface_mac(name: &str) -> Option<String> {
    match mac_address::mac_address_by_name(name) {
        Ok(Some(mac)) => Some(mac.to_string().to_lowercase()),
        Ok(None) => None,
        Err(e) => {
            debug!("Error getting MAC for {}: {}", name, e);
            None
        }
    }
}

fn top_by<F>(entries: &[ProcessEntry], count: usize, key: F) -> Vec<ProcessEntry>
where
    F: Fn(&ProcessEntry) -> f64,
{
    let mut sorted: Vec<&ProcessEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| key(b).total_cmp(&key(a)));
    sorted.into_iter().take(count).cloned().collect()
}

/// Case-insensitive substring match on process names
fn watch_processes(entries: &[ProcessEntry], watch: &[String]) -> BTreeMap<String, WatchedProcess> {
    watch
        .iter()
        .filter(|name| !name.is_empty())
        .map(|name| {
            let needle = name.to_lowercase();
            let found = entries
                .iter()
                .find(|p| p.name.to_lowercase().contains(&needle));
            let status = WatchedProcess {
                running: found.is_some(),
                pid: found.map(|p| p.pid),
            };
            (name.clone(), status)
        })
        .collect()
}

async fn check_port(target: &PortTarget, timeout: Duration) -> PortCheckResult {
    let started = Instant::now();
    let result = |status, response_time_ms| PortCheckResult {
        name: target.name.clone(),
        host: target.host.clone(),
        port: target.port,
        status,
        response_time_ms,
    };

    let addr = match tokio::net::lookup_host((target.host.as_str(), target.port)).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!("Port check {}: cannot resolve {}: {}", target.name, target.host, e);
            None
        }
    };
    let Some(addr) = addr else {
        return result(PortStatus::DnsError, None);
    };

    let status = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => PortStatus::Open,
        Ok(Err(_)) => PortStatus::Closed,
        Err(_) => PortStatus::Timeout,
    };
    let elapsed = round2(started.elapsed().as_secs_f64() * 1000.0);
    result(status, Some(elapsed))
}
