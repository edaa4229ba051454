use crate::model::{null_default, percent_of};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    pub total_usage: u64,
    #[serde(deserialize_with = "null_default")]
    pub percpu_usage: Vec<u64>,
    pub usage_in_kernelmode: u64,
    pub usage_in_usermode: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
}

impl CpuStats {
    fn is_empty(&self) -> bool {
        self.cpu_usage.total_usage == 0 && self.system_cpu_usage == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub usage: u64,
    pub max_usage: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioEntry {
    pub major: u64,
    pub minor: u64,
    pub op: String,
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioStats {
    #[serde(deserialize_with = "null_default")]
    pub io_service_bytes_recursive: Vec<BlkioEntry>,
    #[serde(deserialize_with = "null_default")]
    pub io_serviced_recursive: Vec<BlkioEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidsStats {
    pub current: u64,
}

/// One reading of cumulative counters for a container. Percentages are always
/// derived from `cpu_stats` against `precpu_stats`, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSample {
    pub id: String,
    pub name: String,
    pub read: String,
    pub preread: String,
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub memory_stats: MemoryStats,
    #[serde(deserialize_with = "null_default")]
    pub networks: BTreeMap<String, NetworkCounters>,
    pub blkio_stats: BlkioStats,
    pub pids_stats: PidsStats,
    pub num_procs: u64,
}

impl StatsSample {
    /// CPU percentage against the engine-supplied `precpu_stats`. Zero when
    /// that baseline is empty, as on the first sample of a stream; use
    /// `StatsTracker` to derive it from the previous sample instead.
    pub fn cpu_percent(&self) -> f64 {
        if self.precpu_stats.is_empty() {
            return 0.0;
        }
        cpu_percent(&self.precpu_stats, &self.cpu_stats)
    }

    pub fn memory_percent(&self) -> f64 {
        memory_percent(self.memory_stats.usage, self.memory_stats.limit)
    }

    /// Received and transmitted bytes summed over every interface.
    pub fn network_totals(&self) -> (u64, u64) {
        self.networks
            .values()
            .fold((0, 0), |(rx, tx), counters| {
                (
                    rx.saturating_add(counters.rx_bytes),
                    tx.saturating_add(counters.tx_bytes),
                )
            })
    }

    /// Bytes read and written summed over every block device.
    pub fn block_io_totals(&self) -> (u64, u64) {
        self.blkio_stats
            .io_service_bytes_recursive
            .iter()
            .fold((0, 0), |(read, write), entry| {
                match entry.op.to_ascii_lowercase().as_str() {
                    "read" => (read.saturating_add(entry.value), write),
                    "write" => (read, write.saturating_add(entry.value)),
                    _ => (read, write),
                }
            })
    }

    pub fn process_count(&self) -> u64 {
        if self.pids_stats.current > 0 {
            self.pids_stats.current
        } else {
            self.num_procs
        }
    }
}

pub fn cpu_percent(previous: &CpuStats, current: &CpuStats) -> f64 {
    // Counters are cumulative nanoseconds; subtract before leaving integer space.
    let Some(cpu_delta) = current
        .cpu_usage
        .total_usage
        .checked_sub(previous.cpu_usage.total_usage)
    else {
        return 0.0;
    };
    let Some(system_delta) = current
        .system_cpu_usage
        .checked_sub(previous.system_cpu_usage)
        .filter(|delta| *delta > 0)
    else {
        return 0.0;
    };
    let online_cpus = if current.online_cpus > 0 {
        current.online_cpus
    } else {
        current.cpu_usage.percpu_usage.len().max(1) as u32
    };

    (cpu_delta as f64 / system_delta as f64 * f64::from(online_cpus) * 100.0).clamp(0.0, 100.0)
}

pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    percent_of(usage as f64, limit as f64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsReading {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub processes: u64,
}

/// Derives readings across consecutive samples of one stream. The engine fills
/// `precpu_stats` itself on most platforms; when it arrives empty the tracker
/// substitutes the previous sample's counters.
#[derive(Debug, Default)]
pub struct StatsTracker {
    previous: Option<CpuStats>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: &StatsSample) -> StatsReading {
        let baseline = if sample.precpu_stats.is_empty() {
            self.previous.clone()
        } else {
            Some(sample.precpu_stats.clone())
        };
        self.previous = Some(sample.cpu_stats.clone());

        let cpu_percent = baseline
            .map(|baseline| cpu_percent(&baseline, &sample.cpu_stats))
            .unwrap_or(0.0);
        let (network_rx, network_tx) = sample.network_totals();
        let (block_read, block_write) = sample.block_io_totals();

        StatsReading {
            cpu_percent,
            memory_usage: sample.memory_stats.usage,
            memory_limit: sample.memory_stats.limit,
            memory_percent: sample.memory_percent(),
            network_rx,
            network_tx,
            block_read,
            block_write,
            processes: sample.process_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CpuStats, CpuUsage, StatsSample, StatsTracker, cpu_percent, memory_percent};

    fn cpu(total: u64, system: u64, online: u32) -> CpuStats {
        CpuStats {
            cpu_usage: CpuUsage {
                total_usage: total,
                ..CpuUsage::default()
            },
            system_cpu_usage: system,
            online_cpus: online,
        }
    }

    #[test]
    fn cpu_percent_uses_deltas_and_online_cpus() {
        let previous = cpu(1_000, 10_000, 4);
        let current = cpu(1_500, 20_000, 4);
        let percent = cpu_percent(&previous, &current);
        assert!((percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_is_clamped_and_zero_on_degenerate_deltas() {
        assert_eq!(cpu_percent(&cpu(0, 0, 8), &cpu(9_000, 10_000, 8)), 100.0);
        assert_eq!(cpu_percent(&cpu(100, 500, 2), &cpu(200, 500, 2)), 0.0);
        assert_eq!(cpu_percent(&cpu(300, 500, 2), &cpu(200, 900, 2)), 0.0);
    }

    #[test]
    fn memory_percent_handles_zero_limit() {
        assert_eq!(memory_percent(512, 0), 0.0);
        assert!((memory_percent(256, 1_024) - 25.0).abs() < 1e-9);
        assert_eq!(memory_percent(4_096, 1_024), 100.0);
    }

    #[test]
    fn decodes_engine_sample_with_missing_fields() {
        let sample: StatsSample = serde_json::from_str(
            r#"{
                "read":"2024-01-01T00:00:01Z",
                "cpu_stats":{"cpu_usage":{"total_usage":400,"percpu_usage":null},"system_cpu_usage":2000,"online_cpus":2},
                "precpu_stats":{"cpu_usage":{"total_usage":200},"system_cpu_usage":1000},
                "memory_stats":{"usage":50,"limit":200},
                "networks":{"eth0":{"rx_bytes":10,"tx_bytes":5},"eth1":{"rx_bytes":1,"tx_bytes":2}},
                "blkio_stats":{"io_service_bytes_recursive":[{"op":"Read","value":7},{"op":"write","value":3},{"op":"Total","value":10}]},
                "pids_stats":{"current":3}
            }"#,
        )
        .unwrap();
        assert!((sample.cpu_percent() - 40.0).abs() < 1e-9);
        assert!((sample.memory_percent() - 25.0).abs() < 1e-9);
        assert_eq!(sample.network_totals(), (11, 7));
        assert_eq!(sample.block_io_totals(), (7, 3));
        assert_eq!(sample.process_count(), 3);
    }

    #[test]
    fn tracker_needs_two_samples_when_precpu_is_empty() {
        let mut tracker = StatsTracker::new();
        let first = StatsSample {
            cpu_stats: cpu(1_000, 10_000, 1),
            ..StatsSample::default()
        };
        let second = StatsSample {
            cpu_stats: cpu(2_000, 20_000, 1),
            ..StatsSample::default()
        };

        assert_eq!(tracker.observe(&first).cpu_percent, 0.0);
        let reading = tracker.observe(&second);
        assert!((reading.cpu_percent - 10.0).abs() < 1e-9);
    }

    #[test]
    fn single_sample_without_baseline_has_no_cpu_percent() {
        let sample = StatsSample {
            cpu_stats: cpu(400, 2_000, 2),
            ..StatsSample::default()
        };
        assert_eq!(sample.cpu_percent(), 0.0);
    }

    #[test]
    fn cpu_percent_keeps_precision_on_large_counters() {
        let base = 10_000_000_000_000_001u64;
        let previous = cpu(base, base, 1);
        let current = cpu(base + 1, base + 4, 1);
        assert!((cpu_percent(&previous, &current) - 25.0).abs() < 1e-9);
    }
}
