//! Receive timeout supervision.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Default)]
struct WatchState {
    deadline: Option<Instant>,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WatchState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until an armed deadline passes (true) or the watchdog stops (false).
    fn expired(&self) -> bool {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return false;
            }
            match state.deadline {
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.deadline = None;
                        return true;
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

/// Runs `on_expiry` on its own thread whenever the watchdog stays armed
/// longer than the timeout. Dropping it stops and joins the thread.
pub struct Watchdog {
    timeout: Duration,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(
        name: String,
        timeout: Duration,
        on_expiry: impl Fn() + Send + 'static,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new().name(name).spawn(move || {
                while shared.expired() {
                    on_expiry();
                }
            })?
        };
        Ok(Self {
            timeout,
            shared,
            thread: Some(thread),
        })
    }

    pub fn arm(&self) {
        self.shared.lock().deadline = Some(Instant::now() + self.timeout);
        self.shared.changed.notify_all();
    }

    pub fn disarm(&self) {
        self.shared.lock().deadline = None;
        self.shared.changed.notify_all();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.lock().stopped = true;
        self.shared.changed.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
