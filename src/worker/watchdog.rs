//! Per-worker memory watchdog for RSS enforcement.
//!
//! A background task polls the resident set size of every registered worker
//! and kills workers that stay above their budget longer than a short grace
//! period. The owning proxy is told through a shared flag, so the resulting
//! exit is reported as out-of-memory whatever signal ended the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::task::JoinHandle;

/// How often the watchdog checks worker RSS.
const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period before killing a worker that exceeds its limit.
/// Allows brief spikes without immediate termination.
const GRACE_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct MonitoredWorker {
    limit_mib: usize,
    /// When the worker first exceeded its limit (for the grace period).
    exceeded_since: Option<Instant>,
    label: String,
    /// Raised when the watchdog kills the worker.
    killed: Arc<AtomicBool>,
}

type Workers = Arc<Mutex<HashMap<u32, MonitoredWorker>>>;

/// Worker memory watchdog.
///
/// The polling task stops when the watchdog is dropped.
#[derive(Debug)]
pub struct MemoryWatchdog {
    workers: Workers,
    task: JoinHandle<()>,
}

impl MemoryWatchdog {
    /// Start the polling task on the current runtime.
    pub fn start() -> Self {
        let workers: Workers = Arc::default();
        let task = tokio::spawn(watchdog_loop(Arc::clone(&workers)));
        Self { workers, task }
    }

    /// Register a worker to be monitored.
    pub fn register(&self, pid: u32, limit_mib: usize, label: &str, killed: Arc<AtomicBool>) {
        lock(&self.workers).insert(
            pid,
            MonitoredWorker {
                limit_mib,
                exceeded_since: None,
                label: label.to_string(),
                killed,
            },
        );
        tracing::debug!(pid, limit_mib, label, "Watchdog registered worker");
    }

    /// Unregister a worker (e.g., when it exits normally).
    pub fn unregister(&self, pid: u32) {
        if lock(&self.workers).remove(&pid).is_some() {
            tracing::debug!(pid, "Watchdog unregistered worker");
        }
    }

    pub fn monitored(&self) -> usize {
        lock(&self.workers).len()
    }
}

impl Drop for MemoryWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(workers: &Workers) -> std::sync::MutexGuard<'_, HashMap<u32, MonitoredWorker>> {
    workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn watchdog_loop(workers: Workers) {
    tracing::debug!("Watchdog task started");
    let mut interval = tokio::time::interval(WATCHDOG_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let pids: Vec<u32> = lock(&workers).keys().copied().collect();
        for pid in pids {
            match read_process_rss_mib(pid) {
                Some(rss_mib) => {
                    check_worker(&workers, pid, rss_mib, Instant::now());
                }
                // Process gone
                None => {
                    lock(&workers).remove(&pid);
                }
            }
        }
    }
}

/// Apply the limit to one worker; returns whether it was killed.
fn check_worker(workers: &Workers, pid: u32, rss_mib: u64, now: Instant) -> bool {
    let mut guard = lock(workers);
    let Some(worker) = guard.get_mut(&pid) else {
        return false;
    };

    if rss_mib <= worker.limit_mib as u64 {
        worker.exceeded_since = None;
        return false;
    }

    let since = match worker.exceeded_since {
        Some(since) => since,
        None => {
            tracing::debug!(
                pid,
                label = %worker.label,
                rss_mib,
                limit_mib = worker.limit_mib,
                "Worker over limit, starting grace period"
            );
            worker.exceeded_since = Some(now);
            now
        }
    };
    if now.duration_since(since) <= GRACE_PERIOD {
        return false;
    }

    tracing::warn!(
        pid,
        label = %worker.label,
        rss_mib,
        limit_mib = worker.limit_mib,
        "Killing worker for exceeding memory limit"
    );
    worker.killed.store(true, Ordering::SeqCst);
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "SIGKILL failed");
    }

    // Unregister - the proxy detects the exit
    guard.remove(&pid);
    true
}

/// Read RSS (Resident Set Size) of a process in MiB.
///
/// Uses /proc/<pid>/statm which has format:
/// size resident shared text lib data dt
/// All values are in pages (usually 4KB).
#[cfg(target_os = "linux")]
fn read_process_rss_mib(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let resident_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    // Assume 4KB pages (most common)
    Some(resident_pages * 4 / 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_process_rss_mib(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitored(pid: u32, limit_mib: usize) -> (Workers, Arc<AtomicBool>) {
        let killed = Arc::new(AtomicBool::new(false));
        let workers: Workers = Arc::default();
        lock(&workers).insert(
            pid,
            MonitoredWorker {
                limit_mib,
                exceeded_since: None,
                label: "test".to_string(),
                killed: Arc::clone(&killed),
            },
        );
        (workers, killed)
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_read_own_rss() {
        let rss = read_process_rss_mib(std::process::id()).unwrap();
        assert!(rss < 10 * 1024, "RSS too high: {} MiB", rss);
        assert!(read_process_rss_mib(u32::MAX).is_none());
    }

    #[test]
    fn test_grace_period_resets_under_limit() {
        // A pid that cannot exist, so a kill attempt is harmless
        let pid = i32::MAX as u32;
        let (workers, killed) = monitored(pid, 100);
        let start = Instant::now();

        assert!(!check_worker(&workers, pid, 150, start));
        assert!(lock(&workers)[&pid].exceeded_since.is_some());

        assert!(!check_worker(&workers, pid, 50, start + Duration::from_millis(100)));
        assert!(lock(&workers)[&pid].exceeded_since.is_none());
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_kill_after_grace_period() {
        let pid = i32::MAX as u32;
        let (workers, killed) = monitored(pid, 100);
        let start = Instant::now();

        assert!(!check_worker(&workers, pid, 150, start));
        assert!(!check_worker(&workers, pid, 150, start + Duration::from_millis(200)));
        assert!(check_worker(&workers, pid, 150, start + GRACE_PERIOD * 2));
        assert!(killed.load(Ordering::SeqCst));
        assert!(lock(&workers).is_empty());
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let watchdog = MemoryWatchdog::start();
        watchdog.register(99999, 1024, "test-worker", Arc::new(AtomicBool::new(false)));
        assert_eq!(watchdog.monitored(), 1);
        watchdog.unregister(99999);
        assert_eq!(watchdog.monitored(), 0);
    }
}
