//! Host and process resource sampling
//!
//! Collects host CPU, memory and disk utilization plus per-process CPU and
//! memory for stage instances. Sampling is blocking (sysinfo needs two
//! refreshes spaced apart for CPU deltas), so the node runs it on a blocking
//! worker thread and hands the result back to the control loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};

/// Host-wide utilization, all in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub collected_at: DateTime<Utc>,
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            memory_usage_percent: 0.0,
            disk_usage_percent: 0.0,
            collected_at: Utc::now(),
        }
    }
}

/// Utilization of one process; zero once the process has gone
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// One full sampling pass
#[derive(Debug, Clone, Default)]
pub struct ResourceSample {
    pub host: HostMetrics,
    pub processes: HashMap<u32, ProcessUsage>,
}

impl ResourceSample {
    pub fn usage(&self, pid: u32) -> ProcessUsage {
        self.processes.get(&pid).copied().unwrap_or_default()
    }
}

/// Resource collector for the node
pub struct ResourceCollector {
    system: System,
    disks: Disks,
}

impl ResourceCollector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Refresh host metrics
    pub fn collect_host(&mut self) -> HostMetrics {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let cpu_usage = self.system.global_cpu_usage() as f64;

        let total_mem = self.system.total_memory();
        let memory_usage = if total_mem > 0 {
            (self.system.used_memory() as f64 / total_mem as f64) * 100.0
        } else {
            0.0
        };

        let (total_disk, used_disk) = self
            .disks
            .iter()
            .map(|d| (d.total_space(), d.total_space() - d.available_space()))
            .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));
        let disk_usage = if total_disk > 0 {
            (used_disk as f64 / total_disk as f64) * 100.0
        } else {
            0.0
        };

        HostMetrics {
            cpu_usage_percent: cpu_usage,
            memory_usage_percent: memory_usage,
            disk_usage_percent: disk_usage,
            collected_at: Utc::now(),
        }
    }

    /// Refresh and read the given processes. Vanished pids read as zero.
    pub fn collect_processes(&mut self, pids: &[u32]) -> HashMap<u32, ProcessUsage> {
        let sys_pids: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&sys_pids), true);

        let total_mem = self.system.total_memory();
        pids.iter()
            .map(|pid| {
                let usage = self
                    .system
                    .process(Pid::from_u32(*pid))
                    .map(|p| ProcessUsage {
                        cpu_percent: p.cpu_usage() as f64,
                        memory_percent: if total_mem > 0 {
                            (p.memory() as f64 / total_mem as f64) * 100.0
                        } else {
                            0.0
                        },
                    })
                    .unwrap_or_default();
                (*pid, usage)
            })
            .collect()
    }

    pub fn sample(&mut self, pids: &[u32]) -> ResourceSample {
        ResourceSample {
            host: self.collect_host(),
            processes: self.collect_processes(pids),
        }
    }
}

impl Default for ResourceCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Collector shared with blocking sampling tasks
pub type SharedResourceCollector = Arc<Mutex<ResourceCollector>>;

pub fn new_shared_collector() -> SharedResourceCollector {
    Arc::new(Mutex::new(ResourceCollector::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_host() {
        let mut collector = ResourceCollector::new();
        let host = collector.collect_host();
        assert!(host.cpu_usage_percent >= 0.0);
        assert!(host.memory_usage_percent >= 0.0);
        assert!(host.memory_usage_percent <= 100.0);
        assert!(host.disk_usage_percent >= 0.0);
    }

    #[test]
    fn test_own_process_is_visible() {
        let mut collector = ResourceCollector::new();
        let pid = std::process::id();
        let usage = collector.collect_processes(&[pid]);
        assert!(usage[&pid].memory_percent > 0.0);
    }

    #[test]
    fn test_vanished_process_reads_zero() {
        let mut collector = ResourceCollector::new();
        // Above the default pid_max, never a live process
        let sample = collector.sample(&[u32::MAX - 7]);
        assert_eq!(sample.usage(u32::MAX - 7), ProcessUsage::default());
        assert_eq!(sample.usage(12345678), ProcessUsage::default());
    }
}
