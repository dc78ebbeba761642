//! Host and per-task configuration.

use crate::stream::EventPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Host-wide configuration, applied to every task unless overridden by its
/// [`TaskTuning`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// TCP address serving telemetry sessions.
    pub telemetry_addr: SocketAddr,
    /// Unix socket path serving control sessions.
    pub control_path: PathBuf,
    /// How much task history the snapshot ring covers.
    pub buffer_time: Duration,
    /// Default snapshot decimation: one slice every N fastest-period ticks.
    pub decimation: u32,
    /// Consecutive deadline overruns tolerated before a task aborts.
    pub max_overrun: u32,
    /// Stack size for scheduler threads; `None` uses the platform default.
    pub stack_size: Option<usize>,
    /// Pin each task's fastest sub-task thread to a dedicated core.
    pub pin_fastest: bool,
    /// Default firing policy for event-mode subscriptions.
    pub event_policy: EventPolicy,
    /// When set, snapshot rings live in POSIX shared memory named
    /// `/{prefix}-{task}` instead of private heap memory.
    pub shm_prefix: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            telemetry_addr: SocketAddr::from(([127, 0, 0, 1], 2345)),
            control_path: PathBuf::from("/tmp/cadence-ctl.sock"),
            buffer_time: Duration::from_secs(2),
            decimation: 1,
            max_overrun: 100,
            stack_size: None,
            pin_fastest: false,
            event_policy: EventPolicy::RisingEdge,
            shm_prefix: None,
        }
    }
}

/// Per-task overrides of host defaults; `None` means inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTuning {
    pub decimation: Option<u32>,
    pub buffer_time: Option<Duration>,
    pub max_overrun: Option<u32>,
    pub stack_size: Option<usize>,
}

/// Effective per-task settings after merging tuning with host defaults.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTuning {
    pub decimation: u32,
    pub buffer_time: Duration,
    pub max_overrun: u32,
    pub stack_size: Option<usize>,
}

impl TaskTuning {
    #[must_use]
    pub fn resolve(&self, host: &HostConfig) -> ResolvedTuning {
        ResolvedTuning {
            decimation: self.decimation.unwrap_or(host.decimation).max(1),
            buffer_time: self.buffer_time.unwrap_or(host.buffer_time),
            max_overrun: self.max_overrun.unwrap_or(host.max_overrun).max(1),
            stack_size: self.stack_size.or(host.stack_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_inherits_host_defaults() {
        let host = HostConfig::default();
        let resolved = TaskTuning::default().resolve(&host);
        assert_eq!(resolved.decimation, host.decimation);
        assert_eq!(resolved.buffer_time, host.buffer_time);
        assert_eq!(resolved.max_overrun, host.max_overrun);
    }

    #[test]
    fn tuning_overrides_take_precedence() {
        let host = HostConfig::default();
        let tuning = TaskTuning {
            decimation: Some(0),
            buffer_time: Some(Duration::from_millis(500)),
            max_overrun: Some(5),
            stack_size: Some(256 * 1024),
        };
        let resolved = tuning.resolve(&host);
        // Zero decimation is clamped rather than dividing by zero later.
        assert_eq!(resolved.decimation, 1);
        assert_eq!(resolved.buffer_time, Duration::from_millis(500));
        assert_eq!(resolved.max_overrun, 5);
        assert_eq!(resolved.stack_size, Some(256 * 1024));
    }
}
