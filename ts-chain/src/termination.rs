//! Joint termination and shutdown of one pipeline.
//!
//! Stages never reach each other directly to stop the chain. A stage that wants
//! the chain to end joins the quorum and later signals that it is done; when
//! every joined stage is done the coordinator starts a graceful drain by
//! queuing the end marker behind the input. Abort bypasses the drain: every
//! buffer is aborted and the phase jumps straight to `Terminated`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::buffer::InterStageBuffer;

/// Position of a stage in the chain, input is 0.
pub type StageId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Graceful,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Every joined stage signalled done.
    JointTermination,
    /// Exit command or signal.
    Operator,
    /// A stage returned a fatal disposition or a fatal I/O error.
    Fatal,
    /// The chain ran dry on its own.
    EndOfStream,
}

/// How the pipeline ended; maps onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Aborted,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Completed => 0,
            Outcome::Failed => 1,
            Outcome::Aborted => 2,
        }
    }
}

struct CoordinatorState {
    phase: Phase,
    /// Joined stages and whether each has signalled done.
    joined: HashMap<StageId, bool>,
    outcome: Option<Outcome>,
}

pub struct TerminationCoordinator {
    state: Mutex<CoordinatorState>,
    phase_changed: Condvar,
    aborted: AtomicBool,
    draining: AtomicBool,
    ignore_joint: bool,
    buffers: Mutex<Vec<Arc<InterStageBuffer>>>,
    terminated: CancellationToken,
}

impl TerminationCoordinator {
    pub fn new(ignore_joint: bool) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                phase: Phase::Running,
                joined: HashMap::new(),
                outcome: None,
            }),
            phase_changed: Condvar::new(),
            aborted: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            ignore_joint,
            buffers: Mutex::new(Vec::new()),
            terminated: CancellationToken::new(),
        }
    }

    /// Buffers of the chain, upstream first. The first one receives the end
    /// marker on a graceful drain.
    pub fn attach_buffers(&self, buffers: Vec<Arc<InterStageBuffer>>) {
        *self.buffers.lock().unwrap_or_else(PoisonError::into_inner) = buffers;
    }

    pub fn join(&self, id: StageId) {
        if self.ignore_joint {
            log::debug!("stage {}: joint termination ignored", id);
            return;
        }
        let mut state = self.lock();
        state.joined.entry(id).or_insert(false);
        log::debug!("stage {}: joined termination ({} joined)", id, state.joined.len());
    }

    pub fn signal_done(&self, id: StageId) {
        if self.ignore_joint {
            return;
        }
        let quorum = {
            let mut state = self.lock();
            match state.joined.get_mut(&id) {
                Some(done) if !*done => *done = true,
                Some(_) => return,
                None => {
                    log::warn!("stage {}: signalled done without joining", id);
                    return;
                }
            }
            Self::quorum_reached(&state)
        };
        log::debug!("stage {}: done with joint termination", id);
        if quorum {
            self.request_stop(ShutdownMode::Graceful, StopCause::JointTermination);
        }
    }

    /// Withdraws a stage from the quorum, used when its plugin is replaced.
    pub fn leave(&self, id: StageId) {
        let quorum = {
            let mut state = self.lock();
            if state.joined.remove(&id).is_none() {
                return;
            }
            Self::quorum_reached(&state)
        };
        log::debug!("stage {}: left joint termination", id);
        if quorum {
            self.request_stop(ShutdownMode::Graceful, StopCause::JointTermination);
        }
    }

    pub fn joined_count(&self) -> usize {
        self.lock().joined.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().joined.values().filter(|done| !**done).count()
    }

    pub fn request_stop(&self, mode: ShutdownMode, cause: StopCause) {
        match mode {
            ShutdownMode::Graceful => self.start_drain(cause),
            ShutdownMode::Abort => self.abort(cause),
        }
    }

    fn start_drain(&self, cause: StopCause) {
        {
            let mut state = self.lock();
            if state.phase != Phase::Running {
                return;
            }
            state.phase = Phase::Draining;
            self.phase_changed.notify_all();
        }
        self.draining.store(true, Ordering::Release);
        log::info!("draining pipeline ({:?})", cause);

        // The input sees the flag after its current batch and queues the end
        // marker itself; wake it in case it is parked on a full buffer.
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        for buffer in buffers.iter() {
            buffer.wake();
        }
    }

    fn abort(&self, cause: StopCause) {
        {
            let mut state = self.lock();
            if state.phase == Phase::Terminated {
                return;
            }
            state.phase = Phase::Terminated;
            state.outcome = Some(match cause {
                StopCause::Operator => Outcome::Aborted,
                _ => Outcome::Failed,
            });
            self.phase_changed.notify_all();
        }
        self.aborted.store(true, Ordering::Release);
        log::warn!("aborting pipeline ({:?})", cause);

        for buffer in self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            buffer.abort();
        }
        self.terminated.cancel();
    }

    /// Called by the output stage when it stops; completes a drain.
    pub fn finish(&self) {
        {
            let mut state = self.lock();
            if state.phase == Phase::Terminated {
                return;
            }
            state.phase = Phase::Terminated;
            state.outcome.get_or_insert(Outcome::Completed);
            self.phase_changed.notify_all();
        }
        log::info!("pipeline terminated");
        self.terminated.cancel();
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().outcome
    }

    /// Lock-free, safe to call from buffer predicates.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Lock-free, safe to call from buffer predicates.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Cancelled once the phase reaches `Terminated`.
    pub fn terminated_token(&self) -> CancellationToken {
        self.terminated.clone()
    }

    /// Blocks until the phase reaches `Terminated`.
    pub fn wait(&self) -> Outcome {
        let mut state = self.lock();
        while state.phase != Phase::Terminated {
            state = self
                .phase_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.outcome.unwrap_or(Outcome::Completed)
    }

    fn quorum_reached(state: &CoordinatorState) -> bool {
        !state.joined.is_empty() && state.joined.values().all(|done| *done)
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
