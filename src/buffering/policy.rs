use crate::config::BufferingConfig;
use std::time::Duration;

/// Read/pause decisions of a [`crate::buffering::BufferingManager`].
///
/// Implementations hold thresholds only; every input is passed in.
/// `duration` is always the buffered duration of the weakest queue.
pub trait BufferingPolicy: Send + Sync {
    /// Whether upstream reads should be paused. `is_blocked` is the
    /// current decision, kept while no threshold is crossed.
    fn should_block_reads(
        &self,
        is_blocked: bool,
        duration: Duration,
        bytes: usize,
        is_exhausted: bool,
        is_all_exhausted: bool,
    ) -> bool;

    /// Whether enough data has accumulated to leave the buffering state.
    /// `bytes_at_buffering_start` is the byte total when buffering began.
    fn is_done_buffering(
        &self,
        duration: Duration,
        bytes: usize,
        bytes_at_buffering_start: usize,
        is_starting: bool,
    ) -> bool;

    /// Buffering progress in `[0, 1]`.
    fn progress(&self, duration: Duration, bytes: usize, bytes_at_buffering_start: usize, is_starting: bool) -> f64;
}

/// Threshold policy driven by a [`BufferingConfig`].
#[derive(Debug, Clone, Default)]
pub struct DefaultBufferingPolicy {
    config: BufferingConfig,
}

impl DefaultBufferingPolicy {
    pub fn new(config: BufferingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BufferingConfig {
        &self.config
    }

    fn targets(&self, is_starting: bool) -> (Duration, usize) {
        if is_starting {
            (self.config.duration_starting_done, self.config.bytes_minimum_starting)
        } else {
            (self.config.duration_buffering_done, self.config.bytes_minimum)
        }
    }
}

fn ratio(value: f64, target: f64) -> f64 {
    if target <= 0.0 {
        1.0
    } else {
        value / target
    }
}

impl BufferingPolicy for DefaultBufferingPolicy {
    fn should_block_reads(
        &self,
        is_blocked: bool,
        duration: Duration,
        bytes: usize,
        is_exhausted: bool,
        is_all_exhausted: bool,
    ) -> bool {
        if is_all_exhausted {
            return false;
        }
        if bytes >= self.config.bytes_maximum {
            return true;
        }
        if is_exhausted {
            return false;
        }
        if duration > self.config.duration_read_disable {
            return true;
        }
        if duration < self.config.duration_read_enable {
            return false;
        }
        is_blocked
    }

    fn is_done_buffering(
        &self,
        duration: Duration,
        bytes: usize,
        bytes_at_buffering_start: usize,
        is_starting: bool,
    ) -> bool {
        let (duration_target, bytes_target) = self.targets(is_starting);
        let new_bytes = bytes.saturating_sub(bytes_at_buffering_start);
        if duration >= duration_target && new_bytes >= bytes_target {
            return true;
        }
        // Low-bitrate streams may never reach the byte target.
        bytes >= self.config.bytes_maximum || duration >= self.config.duration_buffering_max
    }

    fn progress(&self, duration: Duration, bytes: usize, bytes_at_buffering_start: usize, is_starting: bool) -> f64 {
        let (duration_target, bytes_target) = self.targets(is_starting);
        let new_bytes = bytes.saturating_sub(bytes_at_buffering_start);

        // Both targets must be met, so the slower one sets the pace.
        let targets = ratio(duration.as_secs_f64(), duration_target.as_secs_f64())
            .min(ratio(new_bytes as f64, bytes_target as f64));
        let max_bytes = ratio(bytes as f64, self.config.bytes_maximum as f64);
        let max_duration = ratio(duration.as_secs_f64(), self.config.duration_buffering_max.as_secs_f64());

        targets.max(max_bytes).max(max_duration).clamp(0.0, 1.0)
    }
}
