//! System load sampling for admission control
//!
//! One monitor task samples a [`LoadProbe`] on a fixed interval and publishes
//! the latest [`LoadSnapshot`] through a watch channel. Queue loops and the
//! metrics collector only read it.

use crate::config::QueueConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// System load at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadSnapshot {
    /// Global CPU usage, 0-100
    pub cpu_percent: f64,
    /// Used RAM as a share of total RAM, 0-100
    pub ram_percent: f64,
    /// Resident memory of this process
    pub process_memory_mb: f64,
}

impl LoadSnapshot {
    pub fn new(cpu_percent: f64, ram_percent: f64) -> Self {
        Self {
            cpu_percent,
            ram_percent,
            process_memory_mb: 0.0,
        }
    }

    /// Both loads are strictly below the queue's thresholds
    pub fn admits(&self, queue: &QueueConfig) -> bool {
        self.cpu_percent < queue.cpu_load_threshold && self.ram_percent < queue.ram_load_threshold
    }
}

/// Source of load samples
pub trait LoadProbe: Send + 'static {
    fn sample(&mut self) -> LoadSnapshot;
}

/// Samples the host through `sysinfo`
pub struct SystemLoadProbe {
    system: System,
    pid: Option<Pid>,
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemLoadProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl LoadProbe for SystemLoadProbe {
    fn sample(&mut self) -> LoadSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let ram_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };

        let process_memory_mb = match self.pid {
            Some(pid) => {
                self.system
                    .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                self.system
                    .process(pid)
                    .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
                    .unwrap_or_default()
            }
            None => 0.0,
        };

        // NaN until sysinfo has two CPU samples to compare
        let cpu = self.system.global_cpu_usage() as f64;
        LoadSnapshot {
            cpu_percent: if cpu.is_finite() { cpu } else { 0.0 },
            ram_percent,
            process_memory_mb,
        }
    }
}

/// A probe reporting whatever load it was last set to
///
/// Clones share the same values, so a test can keep one handle and move
/// another into the scheduler.
#[derive(Debug, Clone, Default)]
pub struct StaticLoadProbe {
    cpu: Arc<AtomicU64>,
    ram: Arc<AtomicU64>,
    memory: Arc<AtomicU64>,
}

impl StaticLoadProbe {
    pub fn new(cpu_percent: f64, ram_percent: f64) -> Self {
        let probe = Self::default();
        probe.set(cpu_percent, ram_percent);
        probe
    }

    /// An idle machine
    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn set(&self, cpu_percent: f64, ram_percent: f64) {
        self.cpu.store(cpu_percent.to_bits(), Ordering::Relaxed);
        self.ram.store(ram_percent.to_bits(), Ordering::Relaxed);
    }

    pub fn set_process_memory_mb(&self, megabytes: f64) {
        self.memory.store(megabytes.to_bits(), Ordering::Relaxed);
    }
}

impl LoadProbe for StaticLoadProbe {
    fn sample(&mut self) -> LoadSnapshot {
        LoadSnapshot {
            cpu_percent: f64::from_bits(self.cpu.load(Ordering::Relaxed)),
            ram_percent: f64::from_bits(self.ram.load(Ordering::Relaxed)),
            process_memory_mb: f64::from_bits(self.memory.load(Ordering::Relaxed)),
        }
    }
}

/// Start sampling `probe` every `interval` until `shutdown` is cancelled
pub fn spawn_load_monitor(
    mut probe: Box<dyn LoadProbe>,
    interval: Duration,
    shutdown: CancellationToken,
) -> (watch::Receiver<LoadSnapshot>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(probe.sample());

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = probe.sample();
                    tracing::trace!(
                        "Load sample: cpu {:.1}%, ram {:.1}%",
                        snapshot.cpu_percent,
                        snapshot.ram_percent
                    );
                    tx.send_replace(snapshot);
                }
            }
        }
        tracing::debug!("Load monitor stopped");
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_requires_both_loads_below_threshold() {
        let queue = QueueConfig::new("q").with_thresholds(80.0, 80.0);
        assert!(LoadSnapshot::new(79.9, 10.0).admits(&queue));
        assert!(!LoadSnapshot::new(80.0, 10.0).admits(&queue));
        assert!(!LoadSnapshot::new(95.0, 10.0).admits(&queue));
        assert!(!LoadSnapshot::new(10.0, 85.0).admits(&queue));
    }

    #[test]
    fn test_static_probe_clones_share_values() {
        let handle = StaticLoadProbe::new(95.0, 20.0);
        let mut probe = handle.clone();
        assert_eq!(probe.sample().cpu_percent, 95.0);

        handle.set(10.0, 30.0);
        handle.set_process_memory_mb(128.0);
        let sample = probe.sample();
        assert_eq!(sample.cpu_percent, 10.0);
        assert_eq!(sample.ram_percent, 30.0);
        assert_eq!(sample.process_memory_mb, 128.0);
    }

    #[test]
    fn test_system_probe_reports_percentages() {
        let sample = SystemLoadProbe::new().sample();
        assert!((0.0..=100.0).contains(&sample.ram_percent));
        assert!(sample.cpu_percent >= 0.0);
    }

    #[tokio::test]
    async fn test_monitor_publishes_new_samples() {
        let handle = StaticLoadProbe::new(50.0, 50.0);
        let shutdown = CancellationToken::new();
        let (mut rx, task) = spawn_load_monitor(
            Box::new(handle.clone()),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        assert_eq!(rx.borrow().cpu_percent, 50.0);

        handle.set(5.0, 5.0);
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.cpu_percent == 5.0))
            .await
            .unwrap()
            .unwrap();

        shutdown.cancel();
        task.await.unwrap();
    }
}
