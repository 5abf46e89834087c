//! Background config refresh.
//!
//! One thread re-reads the config source every interval and swaps in the new
//! snapshot. Shutdown is cooperative: [`RefreshLoop::stop`] raises a flag and
//! wakes the thread, which exits before starting another cycle. A load that is
//! already running finishes first; loads never block on locks, so stop latency
//! is bounded by one file read.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ConfigAuthority;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        *stopped = true;
        self.wake.notify_all();
    }

    /// Waits up to `timeout`; returns true if stop was raised.
    fn wait(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (stopped, _) = self
            .wake
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *stopped
    }
}

pub struct RefreshLoop {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<u64>>,
}

impl RefreshLoop {
    pub fn spawn(authority: Arc<ConfigAuthority>, interval: Duration) -> Self {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name("gate-config-refresh".to_string())
            .spawn(move || {
                let mut cycles = 0u64;
                while !thread_signal.wait(interval) {
                    let report = authority.load();
                    cycles += 1;
                    debug!(
                        cycle = cycles,
                        applied = report.applied.len(),
                        warnings = report.warnings.len(),
                        "Gate config refreshed"
                    );
                }
                cycles
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "Failed to spawn config refresh thread");
                None
            }
        };

        RefreshLoop { signal, handle }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the thread and joins it. Returns the number of completed cycles.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.signal.raise();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("Config refresh thread panicked");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for RefreshLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
