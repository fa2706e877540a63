//! CPU load estimation from cumulative counter snapshots.
//!
//! OS CPU-time counters accumulate since boot, so an instantaneous
//! load figure has to be manufactured from the difference between two
//! snapshots taken a short interval apart: the active share of the
//! elapsed ticks is the load.

use serde::{Deserialize, Serialize};

/// Cumulative per-core CPU time buckets, in clock ticks since boot.
///
/// Mirrors the `/proc/stat` cpu line layout. Fields beyond `idle` are
/// zero on platforms that do not report them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    /// Total ticks across every mode.
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Ticks spent idle.
    pub fn idle(&self) -> u64 {
        self.idle
    }

    /// Sum a set of per-core buckets into one aggregate.
    pub fn aggregate(cores: &[CpuTimes]) -> (u64, u64) {
        let total = cores.iter().map(CpuTimes::total).sum();
        let idle = cores.iter().map(CpuTimes::idle).sum();
        (total, idle)
    }
}

/// CPU load percentage between two aggregate snapshots.
///
/// `Δactive / Δtotal * 100`, rounded to 2 decimals. A zero `Δtotal`
/// (identical snapshots, or a counter wrap observed as no progress) is
/// an undefined input and yields 0.0 rather than dividing by zero.
pub fn delta_load_percent(start: &[CpuTimes], end: &[CpuTimes]) -> f64 {
    let (total_start, idle_start) = CpuTimes::aggregate(start);
    let (total_end, idle_end) = CpuTimes::aggregate(end);

    let delta_total = total_end.saturating_sub(total_start);
    if delta_total == 0 {
        return 0.0;
    }
    let delta_idle = idle_end.saturating_sub(idle_start);
    let delta_active = delta_total.saturating_sub(delta_idle);

    round2(delta_active as f64 / delta_total as f64 * 100.0)
}

/// Round to 2 decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(user: u64, idle: u64) -> CpuTimes {
        CpuTimes {
            user,
            idle,
            ..Default::default()
        }
    }

    #[test]
    fn test_all_idle_is_zero_load() {
        let start = [times(100, 1000)];
        let end = [times(100, 1500)];
        assert_eq!(delta_load_percent(&start, &end), 0.0);
    }

    #[test]
    fn test_no_idle_is_full_load() {
        let start = [times(100, 1000)];
        let end = [times(600, 1000)];
        assert_eq!(delta_load_percent(&start, &end), 100.0);
    }

    #[test]
    fn test_zero_delta_total_does_not_divide_by_zero() {
        let snap = [times(100, 1000)];
        assert_eq!(delta_load_percent(&snap, &snap), 0.0);
    }

    #[test]
    fn test_mixed_load_rounds_to_two_decimals() {
        // 1 active tick out of 3 elapsed -> 33.33%
        let start = [times(0, 0)];
        let end = [times(1, 2)];
        assert_eq!(delta_load_percent(&start, &end), 33.33);
    }

    #[test]
    fn test_aggregates_across_cores() {
        let start = [times(0, 0), times(0, 0)];
        let end = [times(10, 0), times(0, 10)];
        // 10 active of 20 elapsed across both cores
        assert_eq!(delta_load_percent(&start, &end), 50.0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(33.333333), 33.33);
        assert_eq!(round2(66.666666), 66.67);
        assert_eq!(round2(0.0), 0.0);
    }
}
