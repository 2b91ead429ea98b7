//! Memory pressure monitor.
//!
//! A background thread samples system memory and publishes a single
//! "over threshold" flag. The session reads the flag right before
//! dispatching a task (and at each validation-retry boundary) and pauses
//! until pressure clears rather than failing the task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::System;
use tracing::{debug, info, instrument, warn};

/// Default memory threshold, percent of total.
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 75.0;
/// Default sampling interval for the background thread.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
/// How long `wait_until_clear` blocks before giving up.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(120);

/// Read side of the pressure flag. Implemented by the sysinfo-backed
/// monitor in production and by a stub in tests.
pub trait MemoryPressure {
    /// True while memory usage is at or above the threshold.
    fn over_threshold(&self) -> bool;

    /// Block in 1s ticks until pressure clears or `max_wait` elapses.
    ///
    /// Returns true if pressure cleared. On false the caller proceeds
    /// anyway and records a warning.
    fn wait_until_clear(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        while self.over_threshold() {
            if Instant::now() >= deadline {
                warn!(max_wait_secs = max_wait.as_secs(), "memory still high, proceeding anyway");
                return false;
            }
            debug!("memory over threshold, waiting");
            thread::sleep(Duration::from_secs(1));
        }
        true
    }
}

/// Samples memory on a daemon thread via sysinfo.
#[derive(Debug)]
pub struct SysinfoMonitor {
    over: Arc<AtomicBool>,
}

impl SysinfoMonitor {
    /// Spawn the sampling thread. It runs for the process lifetime; the
    /// handle is detached on purpose.
    #[instrument(skip_all, fields(threshold_percent))]
    pub fn spawn(threshold_percent: f64, sample_interval: Duration) -> Self {
        let over = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&over);
        thread::spawn(move || {
            let mut sys = System::new();
            loop {
                sys.refresh_memory();
                let total = sys.total_memory();
                let percent = if total > 0 {
                    sys.used_memory() as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                let was_over = flag.swap(percent >= threshold_percent, Ordering::SeqCst);
                let is_over = percent >= threshold_percent;
                if is_over && !was_over {
                    warn!(percent = format!("{percent:.1}"), threshold_percent, "memory over threshold");
                } else if !is_over && was_over {
                    info!(percent = format!("{percent:.1}"), "memory pressure cleared");
                }
                thread::sleep(sample_interval);
            }
        });
        Self { over }
    }
}

impl MemoryPressure for SysinfoMonitor {
    fn over_threshold(&self) -> bool {
        self.over.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub(AtomicBool);

    impl MemoryPressure for Stub {
        fn over_threshold(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn clear_flag_returns_immediately() {
        let stub = Stub(AtomicBool::new(false));
        let start = Instant::now();
        assert!(stub.wait_until_clear(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn gives_up_after_max_wait() {
        let stub = Stub(AtomicBool::new(true));
        assert!(!stub.wait_until_clear(Duration::from_millis(10)));
    }

    #[test]
    fn sysinfo_monitor_starts_clear() {
        let monitor = SysinfoMonitor::spawn(100.0, Duration::from_millis(50));
        thread::sleep(Duration::from_millis(200));
        assert!(!monitor.over_threshold());
    }
}
