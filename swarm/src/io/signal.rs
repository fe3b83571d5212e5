//! Cooperative stop flag shared by the worker loop and signal handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

const SLEEP_TICK: Duration = Duration::from_millis(100);

/// Set once a stop was requested; never cleared.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT/SIGTERM into this flag.
    ///
    /// Only one handler may exist per process.
    pub fn install_handler(&self) -> Result<()> {
        let flag = Arc::clone(&self.flag);
        ctrlc::set_handler(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                info!("stop requested, finishing current step");
            }
        })
        .context("install signal handler")
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on stop.
    ///
    /// Returns `false` when interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_TICK.min(deadline - now));
        }
    }
}
