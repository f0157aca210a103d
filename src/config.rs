//! Link configuration

use serde::{Deserialize, Serialize};

/// Per-manager and per-link tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Time between scheduler actions (milliseconds).
    pub scheduler_interval_ms: u64,

    /// Max period without a read before the link is considered unresponsive.
    pub response_interval_ms: u64,

    /// Write queue capacity (frames waiting to go out).
    pub write_queue_capacity: usize,

    /// Verify queue capacity (sent-but-unacknowledged verified frames).
    pub verify_queue_capacity: usize,

    /// Missing queue capacity (Vno values absent on input).
    /// Must cover the full Vno range.
    pub missing_queue_capacity: usize,

    /// Shared frame pool capacity per manager.
    pub pool_capacity: usize,

    /// Protocol ticks before the oldest missing Vno is re-requested.
    pub poll_resend_priority: u8,

    /// Consecutive device failures before backing off.
    pub io_retry_limit: u8,

    /// Back-off sleep after repeated device failures (milliseconds).
    pub io_backoff_ms: u64,

    /// High-water mark on the write queue above which submissions defer.
    pub write_queue_watermark: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_ms: 300,
            response_interval_ms: 2000,
            write_queue_capacity: 64,
            verify_queue_capacity: 64,
            missing_queue_capacity: 64,
            pool_capacity: 200,
            poll_resend_priority: 200,
            io_retry_limit: 3,
            io_backoff_ms: 200,
            write_queue_watermark: 59,
        }
    }
}

impl LinkConfig {
    /// New config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggressive scheduling for short in-process or USB links.
    pub fn low_latency() -> Self {
        Self {
            scheduler_interval_ms: 10,
            response_interval_ms: 500,
            poll_resend_priority: 4,
            io_backoff_ms: 20,
            ..Self::default()
        }
    }

    /// Conservative tuning for slow or lossy serial links.
    pub fn robust() -> Self {
        Self {
            scheduler_interval_ms: 500,
            response_interval_ms: 4000,
            write_queue_capacity: 128,
            verify_queue_capacity: 128,
            write_queue_watermark: 123,
            pool_capacity: 400,
            ..Self::default()
        }
    }
}
