//! Host telemetry sampling.
//!
//! Static host facts (memory, cores, uptime) come from `sysinfo`. CPU
//! load cannot be read instantaneously: the kernel only exposes
//! cumulative per-core time counters, so a sample takes two counter
//! snapshots a short window apart and reports the active share of the
//! elapsed ticks.

use crate::{AgentError, AgentResult};
use pulse_types::{delta_load_percent, memory_usage_percent, CpuTimes, TelemetrySample};
use std::time::{Duration, SystemTime};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::warn;

/// Static and slow-moving facts about the host.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub hardware_id: String,
    pub os_type: String,
    pub uptime_seconds: u64,
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub core_count: u32,
    pub core_model: String,
    pub core_speed_mhz: u64,
}

/// Where telemetry comes from. The production source reads the live
/// host; tests script their own counters.
pub trait TelemetrySource: Send {
    /// Refresh and return host facts.
    fn host_info(&mut self) -> AgentResult<HostInfo>;

    /// Current cumulative per-core CPU time counters.
    fn cpu_times(&mut self) -> AgentResult<Vec<CpuTimes>>;
}

/// Take one full sample: two counter snapshots `window` apart plus the
/// host facts, assembled into the wire sample.
pub async fn collect_sample<S: TelemetrySource>(
    source: &mut S,
    window: Duration,
) -> AgentResult<TelemetrySample> {
    let start = source.cpu_times()?;
    tokio::time::sleep(window).await;
    let end = source.cpu_times()?;
    let cpu_load_percent = delta_load_percent(&start, &end);

    let info = source.host_info()?;
    Ok(TelemetrySample {
        hardware_id: info.hardware_id,
        os_type: info.os_type,
        uptime_seconds: info.uptime_seconds,
        total_memory_bytes: info.total_memory_bytes,
        free_memory_bytes: info.free_memory_bytes,
        memory_usage_percent: memory_usage_percent(
            info.total_memory_bytes,
            info.free_memory_bytes,
        ),
        core_count: info.core_count,
        core_model: info.core_model,
        core_speed_mhz: info.core_speed_mhz,
        cpu_load_percent,
        timestamp: SystemTime::now(),
    })
}

/// Live host source backed by `sysinfo` and `/proc/stat`.
pub struct SystemSource {
    system: System,
    hardware_id: String,
}

impl SystemSource {
    pub fn new() -> Self {
        Self::with_hardware_id(None)
    }

    /// Build a source with an explicit hardware id instead of the
    /// detected one.
    pub fn with_hardware_id(hardware_id: Option<String>) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::everything()),
        );
        let hardware_id = hardware_id.unwrap_or_else(detect_hardware_id);
        Self {
            system,
            hardware_id,
        }
    }

    /// The host identifier every sample carries.
    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SystemSource {
    fn host_info(&mut self) -> AgentResult<HostInfo> {
        self.system.refresh_memory();
        self.system.refresh_cpu();

        let cpus = self.system.cpus();
        let (core_model, core_speed_mhz) = cpus
            .first()
            .map(|cpu| (cpu.brand().to_string(), cpu.frequency()))
            .unwrap_or_else(|| ("unknown".to_string(), 0));

        Ok(HostInfo {
            hardware_id: self.hardware_id.clone(),
            os_type: os_type().to_string(),
            uptime_seconds: System::uptime(),
            total_memory_bytes: self.system.total_memory(),
            free_memory_bytes: self.system.available_memory(),
            core_count: cpus.len() as u32,
            core_model,
            core_speed_mhz,
        })
    }

    fn cpu_times(&mut self) -> AgentResult<Vec<CpuTimes>> {
        let content = std::fs::read_to_string("/proc/stat")?;
        let cores = parse_cpu_times(&content);
        if cores.is_empty() {
            return Err(AgentError::Sampler(
                "no per-core cpu lines in /proc/stat".to_string(),
            ));
        }
        Ok(cores)
    }
}

/// OS family label, with Darwin reported under its marketing name.
fn os_type() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "OS X",
        "windows" => "Windows_NT",
        other => other,
    }
}

/// Per-core cumulative counters from `/proc/stat` content.
///
/// Only the `cpuN` lines count; the aggregate `cpu` line is skipped so
/// cores are not double-counted.
pub fn parse_cpu_times(content: &str) -> Vec<CpuTimes> {
    content
        .lines()
        .filter(|line| {
            line.starts_with("cpu") && line.as_bytes().get(3).is_some_and(u8::is_ascii_digit)
        })
        .filter_map(parse_cpu_line)
        .collect()
}

fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut parts = line.split_whitespace().skip(1);
    let mut next = |required: bool| -> Option<u64> {
        match parts.next() {
            Some(v) => v.parse().ok(),
            // Old kernels omit the trailing buckets.
            None if !required => Some(0),
            None => None,
        }
    };
    Some(CpuTimes {
        user: next(true)?,
        nice: next(true)?,
        system: next(true)?,
        idle: next(true)?,
        iowait: next(false)?,
        irq: next(false)?,
        softirq: next(false)?,
        steal: next(false)?,
    })
}

/// Stable host identifier: the MAC address of the first real network
/// interface, falling back to the host name when none is found.
fn detect_hardware_id() -> String {
    if let Some(mac) = first_interface_mac("/sys/class/net") {
        return mac;
    }
    warn!("No usable network interface MAC, falling back to host name");
    System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

fn first_interface_mac(net_dir: &str) -> Option<String> {
    let mut names: Vec<_> = std::fs::read_dir(net_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    for name in names {
        let path = format!("{}/{}/address", net_dir, name);
        if let Ok(address) = std::fs::read_to_string(path) {
            let address = address.trim().to_string();
            // All-zero MACs belong to virtual interfaces.
            if !address.is_empty() && address.chars().any(|c| c != '0' && c != ':') {
                return Some(address);
            }
        }
    }
    None
}
