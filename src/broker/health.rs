//! Worker health monitoring
//!
//! The restart decision is a pure function over a [`WorkerProbe`]; the
//! monitor task only gathers probes on an interval and applies decisions.

use crate::broker::worker::{WorkerPool, WorkerProbe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of inspecting one worker slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerHealthDecision {
    /// Worker is running and reports itself healthy
    Healthy,
    /// Replace the worker task, keeping its slot statistics
    Restart { reason: String },
    /// Worker is unhealthy but restarts are disabled
    Degraded { reason: String },
}

/// Totals from one monitoring pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckSummary {
    pub checked: usize,
    pub restarted: usize,
    pub degraded: usize,
}

/// Health monitoring for the worker pool
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what to do with a worker slot (pure function)
    pub fn evaluate(probe: &WorkerProbe, restart_on_failure: bool) -> WorkerHealthDecision {
        let reason = if !probe.is_healthy {
            probe
                .last_fault
                .clone()
                .unwrap_or_else(|| "worker reported unhealthy".to_string())
        } else if probe.task_finished {
            "worker task exited".to_string()
        } else {
            return WorkerHealthDecision::Healthy;
        };

        if restart_on_failure {
            WorkerHealthDecision::Restart { reason }
        } else {
            WorkerHealthDecision::Degraded { reason }
        }
    }

    /// Inspect every slot once and apply the decisions
    pub fn check_once(pool: &WorkerPool, restart_on_failure: bool) -> HealthCheckSummary {
        let mut summary = HealthCheckSummary::default();

        for probe in pool.probes() {
            summary.checked += 1;
            match Self::evaluate(&probe, restart_on_failure) {
                WorkerHealthDecision::Healthy => {}
                WorkerHealthDecision::Restart { reason } => {
                    warn!(worker_id = probe.worker_id, reason = %reason, "Replacing unhealthy worker");
                    if pool.restart(probe.worker_id) {
                        summary.restarted += 1;
                    }
                }
                WorkerHealthDecision::Degraded { reason } => {
                    error!(
                        worker_id = probe.worker_id,
                        reason = %reason,
                        "Worker unhealthy and restart disabled"
                    );
                    summary.degraded += 1;
                }
            }
        }

        summary
    }

    /// Run checks every `interval` until shutdown is signalled
    pub async fn run(
        pool: Arc<WorkerPool>,
        interval: Duration,
        restart_on_failure: bool,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            let summary = Self::check_once(&pool, restart_on_failure);
            debug!(
                checked = summary.checked,
                restarted = summary.restarted,
                degraded = summary.degraded,
                "Health check complete"
            );
        }

        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(is_healthy: bool, task_finished: bool) -> WorkerProbe {
        WorkerProbe {
            worker_id: 1,
            is_healthy,
            task_finished,
            last_fault: None,
        }
    }

    #[test]
    fn test_healthy_running_worker() {
        assert_eq!(
            HealthMonitor::evaluate(&probe(true, false), true),
            WorkerHealthDecision::Healthy
        );
    }

    #[test]
    fn test_unhealthy_worker_restarted_with_fault_reason() {
        let mut unhealthy = probe(false, true);
        unhealthy.last_fault = Some("50 consecutive delivery failures".to_string());

        assert_eq!(
            HealthMonitor::evaluate(&unhealthy, true),
            WorkerHealthDecision::Restart {
                reason: "50 consecutive delivery failures".to_string()
            }
        );
    }

    #[test]
    fn test_exited_task_restarted() {
        assert!(matches!(
            HealthMonitor::evaluate(&probe(true, true), true),
            WorkerHealthDecision::Restart { .. }
        ));
    }

    #[test]
    fn test_restart_disabled_reports_degraded() {
        assert!(matches!(
            HealthMonitor::evaluate(&probe(false, false), false),
            WorkerHealthDecision::Degraded { .. }
        ));
        assert_eq!(
            HealthMonitor::evaluate(&probe(true, false), false),
            WorkerHealthDecision::Healthy
        );
    }
}
