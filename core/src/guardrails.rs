// Guardrail sampling and evaluation
// A periodic sampler writes CPU/GPU usage and the recording flag into a
// shared snapshot; rule execution polls the snapshot before each action

use crate::cancel::CancelFlag;
use crate::constants::guardrails::SAMPLE_INTERVAL_SECONDS;
use crate::media::gpu;
use chrono::Utc;
use log::debug;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use sysinfo::System;
use tokio::time::sleep;

/// Point-in-time system state consulted by rule execution
#[derive(Debug, Clone, Default, Serialize)]
pub struct GuardSnapshot {
    pub cpu_pct: f64,
    pub gpu_pct: f64,
    pub recording_active: bool,
    pub sampled_at: Option<String>,
}

/// Effective limits for one action, combining rule and global settings
#[derive(Debug, Clone)]
pub struct GuardLimits {
    pub cpu_pct: f64,
    pub gpu_pct: f64,
    pub pause_when_recording: bool,
    pub queue_paused: bool,
}

/// First tripped guard, or None when the action may proceed
pub fn tripped(snapshot: &GuardSnapshot, limits: &GuardLimits) -> Option<String> {
    if limits.queue_paused {
        return Some("job queue is paused".into());
    }
    if limits.pause_when_recording && snapshot.recording_active {
        return Some("recording in progress".into());
    }
    if snapshot.cpu_pct > limits.cpu_pct {
        return Some(format!(
            "cpu {:.0}% above guard {:.0}%",
            snapshot.cpu_pct, limits.cpu_pct
        ));
    }
    if snapshot.gpu_pct > limits.gpu_pct {
        return Some(format!(
            "gpu {:.0}% above guard {:.0}%",
            snapshot.gpu_pct, limits.gpu_pct
        ));
    }
    None
}

/// Owns the shared snapshot; cheap to clone
#[derive(Clone, Default)]
pub struct GuardrailMonitor {
    snapshot: Arc<RwLock<GuardSnapshot>>,
}

impl GuardrailMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        self.snapshot.read().expect("guard lock poisoned").clone()
    }

    /// Recording state is pushed in by the external OBS collaborator
    pub fn set_recording_active(&self, active: bool) {
        self.snapshot
            .write()
            .expect("guard lock poisoned")
            .recording_active = active;
    }

    /// Used by tests and by the sampler below
    pub fn set_usage(&self, cpu_pct: f64, gpu_pct: f64) {
        let mut snapshot = self.snapshot.write().expect("guard lock poisoned");
        snapshot.cpu_pct = cpu_pct;
        snapshot.gpu_pct = gpu_pct;
        snapshot.sampled_at = Some(Utc::now().to_rfc3339());
    }

    /// Sampler loop; runs until shutdown is requested
    pub async fn run_sampler(&self, shutdown: CancelFlag) {
        let mut system = System::new();
        // Prime the CPU counters; the first reading is meaningless
        system.refresh_cpu_usage();

        while !shutdown.is_cancelled() {
            sleep(Duration::from_secs(SAMPLE_INTERVAL_SECONDS)).await;

            system.refresh_cpu_usage();
            let cpu = system.global_cpu_usage() as f64;
            let gpu = gpu::utilization_pct().await.unwrap_or(0.0);

            self.set_usage(cpu, gpu);
            debug!("guardrail sample: cpu {:.0}% gpu {:.0}%", cpu, gpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> GuardLimits {
        GuardLimits {
            cpu_pct: 70.0,
            gpu_pct: 40.0,
            pause_when_recording: true,
            queue_paused: false,
        }
    }

    #[test]
    fn test_idle_system_trips_nothing() {
        let snapshot = GuardSnapshot {
            cpu_pct: 10.0,
            gpu_pct: 5.0,
            ..Default::default()
        };
        assert_eq!(tripped(&snapshot, &limits()), None);
    }

    #[test]
    fn test_each_guard_trips() {
        let mut snapshot = GuardSnapshot::default();

        snapshot.recording_active = true;
        assert!(tripped(&snapshot, &limits()).unwrap().contains("recording"));
        snapshot.recording_active = false;

        snapshot.cpu_pct = 85.0;
        assert!(tripped(&snapshot, &limits()).unwrap().contains("cpu"));
        snapshot.cpu_pct = 0.0;

        snapshot.gpu_pct = 55.0;
        assert!(tripped(&snapshot, &limits()).unwrap().contains("gpu"));
        snapshot.gpu_pct = 0.0;

        let mut paused = limits();
        paused.queue_paused = true;
        assert!(tripped(&snapshot, &paused).unwrap().contains("paused"));
    }

    #[test]
    fn test_recording_guard_can_be_disabled() {
        let snapshot = GuardSnapshot {
            recording_active: true,
            ..Default::default()
        };
        let mut relaxed = limits();
        relaxed.pause_when_recording = false;
        assert_eq!(tripped(&snapshot, &relaxed), None);
    }

    #[test]
    fn test_monitor_snapshot_updates() {
        let monitor = GuardrailMonitor::new();
        assert_eq!(monitor.snapshot().cpu_pct, 0.0);

        monitor.set_usage(42.0, 17.0);
        monitor.set_recording_active(true);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.cpu_pct, 42.0);
        assert_eq!(snapshot.gpu_pct, 17.0);
        assert!(snapshot.recording_active);
        assert!(snapshot.sampled_at.is_some());
    }
}
