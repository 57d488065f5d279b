//! Container configuration.

use serde::{Deserialize, Serialize};

/// Command & event processing during container execution is done at raised
/// priority when the process duration is below this, in microseconds.
pub const PROC_DUR_THRESH_FOR_PRIO_BUMP_UP_US: u64 = 2_500;

/// Priority scale factor applied while a command handler runs in a started
/// signal-triggered container below the duration threshold.
pub const PROC_DUR_SCALE_FACTOR_FOR_CMD_PROC: u32 = 2;

/// Number of steady frames an island-capable container processes after a
/// vote change before it votes for island entry.
pub const PRE_ISLAND_FRAMES_TO_PROCESS: u32 = 2;

/// Interval between throttled underrun/overrun error prints.
pub const ERR_PRINT_INTERVAL_MS: u64 = 10;

/// Threshold propagation visits are bounded by this worklist depth.
pub const MAX_PROPAGATION_DEPTH: usize = 50;

/// Upper clamp on the container LCM threshold.
pub const MAX_LCM_THRESHOLD_US: u64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PerfMode {
    /// 5 ms default frames.
    #[default]
    LowPower,
    /// 1 ms default frames.
    LowLatency,
    /// Frame length follows the first threshold module.
    HighPerformance,
}

impl PerfMode {
    /// Default frame duration when no module raises a threshold.
    pub fn default_frame_us(self) -> Option<u64> {
        match self {
            PerfMode::LowPower => Some(5_000),
            PerfMode::LowLatency => Some(1_000),
            PerfMode::HighPerformance => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerConfig {
    pub perf_mode: PerfMode,
    /// Client-configured frame length in microseconds; takes precedence over
    /// `configured_frame_samples` and the perf-mode default.
    pub configured_frame_us: Option<u64>,
    /// Client-configured frame length in samples per channel.
    pub configured_frame_samples: Option<u64>,
    /// Upper bound on the number of buffers negotiated per external output.
    pub max_icb_bufs_per_port: Option<u32>,
    /// Capacity of each external data port queue.
    pub data_queue_depth: Option<usize>,
}

impl ContainerConfig {
    pub fn data_queue_depth(&self) -> usize {
        self.data_queue_depth.unwrap_or(16)
    }

    pub fn max_icb_bufs(&self) -> u32 {
        self.max_icb_bufs_per_port.unwrap_or(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_mode_defaults() {
        assert_eq!(PerfMode::LowPower.default_frame_us(), Some(5_000));
        assert_eq!(PerfMode::LowLatency.default_frame_us(), Some(1_000));
        assert_eq!(PerfMode::HighPerformance.default_frame_us(), None);
    }
}
