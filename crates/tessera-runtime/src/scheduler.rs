//! Periodic trigger for forced signatures, on a dedicated thread.
//!
//! `schedule` and `cancel` are called while the configuration manager holds
//! its write lock, and the task itself takes the read lock. So `cancel` only
//! signals the timer thread and never joins it: a tick already running
//! finishes on its own and the thread exits right after.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use tessera_core::traits::Scheduler;

type Task = Arc<dyn Fn() + Send + Sync>;

/// Runs `task` every `interval` until cancelled or dropped.
pub struct ThreadScheduler {
    task: Task,
    /// Dropping the sender stops the running timer.
    stop: Mutex<Option<Sender<()>>>,
}

impl ThreadScheduler {
    pub fn new(task: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            task: Arc::new(task),
            stop: Mutex::new(None),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.stop.lock().is_some()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, interval: Duration) {
        let mut stop = self.stop.lock();
        stop.take();

        let (tx, rx) = mpsc::channel::<()>();
        let task = Arc::clone(&self.task);
        let spawned = thread::Builder::new()
            .name("tessera-signer".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(_) => {
                debug!(interval_ms = interval.as_millis() as u64, "periodic signing scheduled");
                *stop = Some(tx);
            }
            Err(e) => warn!(error = %e, "failed to start periodic signing thread"),
        }
    }

    fn cancel(&self) {
        if self.stop.lock().take().is_some() {
            debug!("periodic signing cancelled");
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
