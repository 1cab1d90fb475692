//! One dedicated thread per stage.
//!
//! A runner owns exactly one plugin instance at a time and moves packets
//! between its upstream and downstream buffers. Control requests (suspend,
//! resume, restart) are posted to the runner and picked up by its own thread at
//! a packet boundary, so the plugin object is never touched from outside.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::buffer::{InterStageBuffer, PopOutcome, PushOutcome};
use crate::error::{PipelineError, StageIoError};
use crate::metadata::{Metadata, SequenceCounter, TimeSource};
use crate::packet::{Packet, PacketSlot};
use crate::pcr::PcrAnalyzer;
use crate::plugin::{Disposition, Plugin, PluginFactory, StageContext, StageKind, StageOptions};
use crate::regulator::{BitrateRegulator, Throttle};
use crate::state::StageState;
use crate::stats::{StageStats, StatsSummary};
use crate::termination::{ShutdownMode, StageId, StopCause, TerminationCoordinator};
use crate::watchdog::Watchdog;

/// How long an idle stage (failed input) sleeps between checks.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// State shared by every runner of one pipeline.
pub(crate) struct ChainShared {
    pub coordinator: Arc<TerminationCoordinator>,
    pub regulator: Arc<BitrateRegulator>,
    pub sequence: SequenceCounter,
    pub epoch: Instant,
    pub max_input_packets: usize,
    pub max_output_packets: usize,
    /// Longest wait for the input plugin to return from `receive`.
    pub receive_timeout: Option<Duration>,
}

pub type RestartReply = Result<(), PipelineError>;

struct RestartRequest {
    args: Vec<String>,
    reply: oneshot::Sender<RestartReply>,
}

struct RunnerControl {
    state: StageState,
    args: Vec<String>,
    restart: Option<RestartRequest>,
    exited: bool,
}

/// Snapshot of one stage for `list`.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub index: StageId,
    pub name: String,
    pub kind: StageKind,
    pub state: StageState,
    pub bitrate: u64,
    pub args: Vec<String>,
    pub stats: StatsSummary,
}

impl std::fmt::Display for StageInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} {} {} {} b/s",
            self.index, self.kind, self.name, self.state, self.bitrate
        )?;
        if !self.args.is_empty() {
            write!(f, " [{}]", self.args.join(" "))?;
        }
        Ok(())
    }
}

/// A plugin instance that passed option parsing and its start hook.
pub(crate) struct StartedStage {
    plugin: Plugin,
    options: StageOptions,
    ctx: StageContext,
}

pub struct StageRunner {
    index: StageId,
    name: String,
    kind: StageKind,
    factory: PluginFactory,
    upstream: Option<Arc<InterStageBuffer>>,
    downstream: Option<Arc<InterStageBuffer>>,
    shared: Arc<ChainShared>,
    control: Mutex<RunnerControl>,
    control_changed: Condvar,
    suspended: AtomicBool,
    restart_pending: AtomicBool,
    stats: StageStats,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StageRunner {
    pub(crate) fn new(
        index: StageId,
        name: &str,
        args: Vec<String>,
        factory: PluginFactory,
        upstream: Option<Arc<InterStageBuffer>>,
        downstream: Option<Arc<InterStageBuffer>>,
        shared: Arc<ChainShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            name: name.to_string(),
            kind: factory.kind(),
            factory,
            upstream,
            downstream,
            shared,
            control: Mutex::new(RunnerControl {
                state: StageState::Init,
                args,
                restart: None,
                exited: false,
            }),
            control_changed: Condvar::new(),
            suspended: AtomicBool::new(false),
            restart_pending: AtomicBool::new(false),
            stats: StageStats::new(),
            thread: Mutex::new(None),
        })
    }

    pub fn index(&self) -> StageId {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn state(&self) -> StageState {
        self.lock().state
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    pub fn info(&self) -> StageInfo {
        let (state, args) = {
            let control = self.lock();
            (control.state, control.args.clone())
        };
        StageInfo {
            index: self.index,
            name: self.name.clone(),
            kind: self.kind,
            state,
            bitrate: self.stats.measured_bitrate(),
            args,
            stats: self.stats.summary(),
        }
    }

    /// Parses options and runs the start hook in the calling thread.
    pub(crate) fn start_plugin(&self) -> Result<StartedStage, PipelineError> {
        let args = self.lock().args.clone();
        match self.build_plugin(&args) {
            Ok(started) => {
                self.set_state(StageState::Started);
                Ok(started)
            }
            Err(e) => {
                self.set_state(StageState::Failed);
                Err(PipelineError::StartupFailure {
                    index: self.index,
                    name: self.name.clone(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Runs the stop hook of a started plugin that never got a thread.
    pub(crate) fn discard_plugin(&self, mut started: StartedStage) {
        self.set_state(StageState::Stopping);
        if let Err(e) = started.plugin.stop(&started.ctx) {
            log::warn!("{}: stop failed: {:#}", started.ctx, e);
        }
        self.set_state(StageState::Stopped);
        self.lock().exited = true;
    }

    pub(crate) fn launch(self: &Arc<Self>, started: StartedStage) -> Result<(), PipelineError> {
        let watchdog = match (self.kind, self.shared.receive_timeout) {
            (StageKind::Input, Some(timeout)) => {
                Some(self.spawn_watchdog(timeout).map_err(|e| PipelineError::StartupFailure {
                    index: self.index,
                    name: self.name.clone(),
                    reason: format!("spawn watchdog: {}", e),
                })?)
            }
            _ => None,
        };
        let mut worker = Worker {
            runner: self.clone(),
            plugin: Some(started.plugin),
            options: started.options,
            ctx: started.ctx,
            watchdog,
        };
        let handle = std::thread::Builder::new()
            .name(format!("{}[{}]", self.name, self.index))
            .spawn(move || worker.run())
            .map_err(|e| PipelineError::StartupFailure {
                index: self.index,
                name: self.name.clone(),
                reason: format!("spawn thread: {}", e),
            })?;
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Aborts the pipeline when the input plugin stays in `receive` too long.
    fn spawn_watchdog(&self, timeout: Duration) -> std::io::Result<Watchdog> {
        let coordinator = self.shared.coordinator.clone();
        let stage = format!("{}[{}]", self.name, self.index);
        Watchdog::spawn(format!("{}-watchdog", stage), timeout, move || {
            log::error!("{}: nothing received for {:?}, aborting", stage, timeout);
            coordinator.request_stop(ShutdownMode::Abort, StopCause::Fatal);
        })
    }

    pub(crate) fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("{}[{}]: stage thread panicked", self.name, self.index);
            }
        }
    }

    pub(crate) fn suspend(&self) -> Result<(), PipelineError> {
        if self.kind == StageKind::Input {
            return Err(PipelineError::InputNotSuspendable);
        }
        let mut control = self.lock();
        match control.state {
            StageState::Suspended => Ok(()),
            StageState::Running | StageState::Started => {
                self.suspended.store(true, Ordering::Release);
                self.transition(&mut control, StageState::Suspended);
                log::info!("{}[{}]: suspended", self.name, self.index);
                Ok(())
            }
            state => Err(PipelineError::InvalidState {
                index: self.index,
                state: state.to_string(),
                action: "suspend",
            }),
        }
    }

    pub(crate) fn resume(&self) -> Result<(), PipelineError> {
        let mut control = self.lock();
        if control.state != StageState::Suspended {
            return Err(PipelineError::NotSuspended(self.index));
        }
        self.suspended.store(false, Ordering::Release);
        self.transition(&mut control, StageState::Running);
        log::info!("{}[{}]: resumed", self.name, self.index);
        Ok(())
    }

    /// Posts a restart to the stage thread. The receiver completes once the
    /// new instance is running or failed. A pending older request is cancelled.
    pub(crate) fn request_restart(
        &self,
        args: Option<Vec<String>>,
    ) -> Result<oneshot::Receiver<RestartReply>, PipelineError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut control = self.lock();
            if control.exited {
                return Err(PipelineError::Terminated);
            }
            let args = args.unwrap_or_else(|| control.args.clone());
            let request = RestartRequest { args, reply: tx };
            if let Some(previous) = control.restart.replace(request) {
                log::info!("{}[{}]: previous restart cancelled", self.name, self.index);
                let _ = previous.reply.send(Err(PipelineError::RestartFailure {
                    index: self.index,
                    reason: "superseded by a newer restart".to_string(),
                }));
            }
            self.restart_pending.store(true, Ordering::Release);
            self.control_changed.notify_all();
        }
        self.wake();
        Ok(rx)
    }

    fn wake(&self) {
        if let Some(upstream) = &self.upstream {
            upstream.wake();
        }
        if let Some(downstream) = &self.downstream {
            downstream.wake();
        }
    }

    fn build_plugin(&self, args: &[String]) -> anyhow::Result<StartedStage> {
        let mut plugin = self.factory.create(args)?;
        let options = plugin.stage_options();
        let ctx = StageContext::new(
            self.index,
            &self.name,
            args.to_vec(),
            self.shared.coordinator.clone(),
            self.shared.regulator.clone(),
        );
        plugin.start(&ctx)?;
        Ok(StartedStage {
            plugin,
            options,
            ctx,
        })
    }

    fn set_state(&self, state: StageState) {
        let mut control = self.lock();
        self.transition(&mut control, state);
    }

    fn transition(&self, control: &mut RunnerControl, state: StageState) {
        if !control.state.can_transition_to(&state) {
            log::warn!(
                "{}[{}]: unexpected transition {} -> {}",
                self.name,
                self.index,
                control.state,
                state
            );
        }
        log::trace!("{}[{}]: {} -> {}", self.name, self.index, control.state, state);
        control.state = state;
    }

    fn lock(&self) -> MutexGuard<'_, RunnerControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    EndOfStream,
    StopRequested,
    /// Downstream stopped reading.
    Closed,
    Aborted,
    Fatal,
}

/// Thread-side half of a runner: owns the plugin instance.
struct Worker {
    runner: Arc<StageRunner>,
    plugin: Option<Plugin>,
    options: StageOptions,
    ctx: StageContext,
    watchdog: Option<Watchdog>,
}

impl Worker {
    fn run(&mut self) {
        self.runner.stats.mark_started();
        {
            let mut control = self.runner.lock();
            let state = if self.runner.suspended.load(Ordering::Acquire) {
                StageState::Suspended
            } else {
                StageState::Running
            };
            self.runner.transition(&mut control, state);
        }
        log::debug!("{}: running", self.ctx);

        let exit = match self.runner.kind {
            StageKind::Input => self.run_input(),
            StageKind::Processor => self.run_processor(),
            StageKind::Output => self.run_output(),
        };
        self.finish(exit);
    }

    fn run_input(&mut self) -> Exit {
        let runner = self.runner.clone();
        let Some(downstream) = runner.downstream.clone() else {
            return Exit::Closed;
        };
        let shared = runner.shared.clone();
        let mut batch = vec![PacketSlot::default(); shared.max_input_packets.max(1)];
        let mut clock = PcrAnalyzer::new();

        loop {
            if runner.restart_pending.load(Ordering::Acquire) {
                self.serve_restart();
            }
            if shared.coordinator.is_aborted() || downstream.is_aborted() {
                return Exit::Aborted;
            }
            if shared.coordinator.is_draining() {
                return Exit::EndOfStream;
            }

            let Some(Plugin::Input(input)) = self.plugin.as_mut() else {
                self.idle();
                continue;
            };
            for slot in batch.iter_mut() {
                slot.metadata = Metadata::default();
            }
            if let Some(watchdog) = &self.watchdog {
                watchdog.arm();
            }
            let received = input.receive(&mut batch, &self.ctx);
            if let Some(watchdog) = &self.watchdog {
                watchdog.disarm();
            }
            let count = match received {
                Ok(0) => {
                    log::info!("{}: end of input", self.ctx);
                    return Exit::EndOfStream;
                }
                Ok(count) => count.min(batch.len()),
                Err(StageIoError::Fatal(e)) => {
                    log::error!("{}: {:#}", self.ctx, e);
                    return Exit::Fatal;
                }
                Err(StageIoError::Recoverable(e)) => {
                    log::warn!("{}: input error, stopping: {:#}", self.ctx, e);
                    return Exit::EndOfStream;
                }
            };
            match input.bitrate() {
                Some(bitrate) => shared.regulator.report_input(bitrate),
                None => {
                    for slot in batch.iter().take(count) {
                        clock.feed(&slot.packet);
                    }
                    if let Some(bitrate) = clock.take_change() {
                        log::debug!("{}: stream clock bitrate {} b/s", self.ctx, bitrate);
                        shared.regulator.report_stream_clock(bitrate);
                    }
                }
            }
            runner.stats.record_processed(count as u64);

            for (i, slot) in batch.iter_mut().take(count).enumerate() {
                let mut slot = std::mem::take(slot);
                slot.metadata.set_sequence(shared.sequence.new_sequence());
                if !slot.metadata.has_timestamp() {
                    slot.metadata
                        .set_timestamp(shared.epoch.elapsed(), TimeSource::Engine);
                }
                if let Some(exit) = self.forward(&downstream, slot) {
                    log::debug!(
                        "{}: {} packets read but not forwarded ({:?})",
                        self.ctx,
                        count - i,
                        exit
                    );
                    return exit;
                }
            }
        }
    }

    fn run_processor(&mut self) -> Exit {
        let runner = self.runner.clone();
        let (Some(upstream), Some(downstream)) =
            (runner.upstream.clone(), runner.downstream.clone())
        else {
            return Exit::Closed;
        };
        let pending = || runner.restart_pending.load(Ordering::Acquire);

        loop {
            if pending() {
                self.serve_restart();
            }
            let mut slot = match upstream.pop(&pending) {
                PopOutcome::Packet(slot) => slot,
                PopOutcome::End => return Exit::EndOfStream,
                PopOutcome::Aborted => return Exit::Aborted,
                PopOutcome::Interrupted => continue,
            };

            match self.process_one(&mut slot) {
                Disposition::Ok => {}
                Disposition::Null => {
                    slot.packet = Packet::null();
                    slot.metadata.set_nullified(true);
                    runner.stats.record_nullified();
                }
                Disposition::Drop => {
                    runner.stats.record_dropped();
                    continue;
                }
                Disposition::RequestStop => {
                    log::info!("{}: stop requested by plugin", self.ctx);
                    if let Some(exit) = self.forward(&downstream, slot) {
                        return exit;
                    }
                    return Exit::StopRequested;
                }
                Disposition::Fatal => {
                    log::error!("{}: fatal error on packet {}", self.ctx, slot.metadata.sequence());
                    return Exit::Fatal;
                }
            }
            if let Some(exit) = self.forward(&downstream, slot) {
                return exit;
            }
        }
    }

    fn process_one(&mut self, slot: &mut PacketSlot) -> Disposition {
        let bypass = self.runner.suspended.load(Ordering::Acquire)
            || slot.metadata.bypass_requested()
            || !self.options.accepts(slot.metadata.labels());
        match self.plugin.as_mut() {
            Some(Plugin::Processor(processor)) if !bypass => {
                self.runner.stats.record_processed(1);
                processor.process(&mut slot.packet, &mut slot.metadata, &self.ctx)
            }
            _ => {
                self.runner.stats.record_passed(1);
                Disposition::Ok
            }
        }
    }

    fn run_output(&mut self) -> Exit {
        let runner = self.runner.clone();
        let Some(upstream) = runner.upstream.clone() else {
            return Exit::Closed;
        };
        let shared = runner.shared.clone();
        let max_batch = shared.max_output_packets.max(1);
        let pending = || runner.restart_pending.load(Ordering::Acquire);
        let interrupted = || pending() || shared.coordinator.is_aborted();
        let mut batch: Vec<PacketSlot> = Vec::with_capacity(max_batch);
        let mut emitted: u64 = 0;

        loop {
            if pending() {
                self.serve_restart();
            }
            match upstream.pop(&pending) {
                PopOutcome::Packet(slot) => batch.push(slot),
                PopOutcome::End => return Exit::EndOfStream,
                PopOutcome::Aborted => return Exit::Aborted,
                PopOutcome::Interrupted => continue,
            }
            while batch.len() < max_batch {
                match upstream.try_pop() {
                    Some(slot) => batch.push(slot),
                    None => break,
                }
            }

            let due = emitted + batch.len() as u64;
            while shared.regulator.throttle(due, &interrupted) == Throttle::Interrupted {
                if shared.coordinator.is_aborted() {
                    return Exit::Aborted;
                }
                self.serve_restart();
            }

            let sent = match self.plugin.as_mut() {
                Some(Plugin::Output(output)) if !runner.suspended.load(Ordering::Acquire) => {
                    output.send(&batch, &self.ctx).map(|_| true)
                }
                _ => Ok(false),
            };
            match sent {
                Ok(true) => runner.stats.record_processed(batch.len() as u64),
                Ok(false) => {
                    log::trace!("{}: discarded {} packets", self.ctx, batch.len());
                    runner.stats.record_passed(batch.len() as u64);
                }
                Err(StageIoError::Fatal(e)) => {
                    log::error!("{}: {:#}", self.ctx, e);
                    return Exit::Fatal;
                }
                Err(StageIoError::Recoverable(e)) => {
                    log::warn!("{}: output error, stopping: {:#}", self.ctx, e);
                    return Exit::StopRequested;
                }
            }
            runner.stats.record_emitted(batch.len() as u64);
            emitted = due;
            batch.clear();
        }
    }

    /// Pushes one packet downstream, serving restarts while blocked.
    fn forward(&mut self, downstream: &InterStageBuffer, mut slot: PacketSlot) -> Option<Exit> {
        let runner = self.runner.clone();
        let pending = || runner.restart_pending.load(Ordering::Acquire);
        loop {
            match downstream.push(slot, &pending) {
                PushOutcome::Pushed => {
                    runner.stats.record_emitted(1);
                    return None;
                }
                PushOutcome::Closed => return Some(Exit::Closed),
                PushOutcome::Aborted => return Some(Exit::Aborted),
                PushOutcome::Interrupted(back) => {
                    slot = back;
                    self.serve_restart();
                }
            }
        }
    }

    /// Parks a stage that has no plugin and no upstream to pull from.
    fn idle(&self) {
        let runner = &self.runner;
        let control = runner.lock();
        let _ = runner
            .control_changed
            .wait_timeout(control, IDLE_POLL)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Replaces the plugin instance if a restart was posted.
    fn serve_restart(&mut self) {
        let request = {
            let mut control = self.runner.lock();
            self.runner.restart_pending.store(false, Ordering::Release);
            control.restart.take()
        };
        let Some(request) = request else {
            return;
        };
        let runner = self.runner.clone();
        log::info!("{}: restarting", self.ctx);

        if let Some(mut plugin) = self.plugin.take() {
            runner.set_state(StageState::Stopping);
            if let Err(e) = plugin.stop(&self.ctx) {
                log::warn!("{}: stop failed: {:#}", self.ctx, e);
            }
            drop(plugin);
            runner.set_state(StageState::Stopped);
        }
        runner.shared.coordinator.leave(runner.index);
        runner.set_state(StageState::Init);

        let reply = match runner.build_plugin(&request.args) {
            Ok(started) => {
                self.plugin = Some(started.plugin);
                self.options = started.options;
                self.ctx = started.ctx;
                let mut control = runner.lock();
                control.args = request.args;
                runner.transition(&mut control, StageState::Started);
                let state = if runner.suspended.load(Ordering::Acquire) {
                    StageState::Suspended
                } else {
                    StageState::Running
                };
                runner.transition(&mut control, state);
                log::info!("{}: restarted", self.ctx);
                Ok(())
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                log::error!("{}: restart failed: {}", self.ctx, reason);
                self.ctx.set_args(request.args.clone());
                let mut control = runner.lock();
                control.args = request.args;
                runner.transition(&mut control, StageState::Failed);
                Err(PipelineError::RestartFailure {
                    index: runner.index,
                    reason,
                })
            }
        };
        let _ = request.reply.send(reply);
    }

    fn finish(&mut self, exit: Exit) {
        let runner = self.runner.clone();
        let coordinator = runner.shared.coordinator.clone();
        log::debug!("{}: leaving ({:?})", self.ctx, exit);
        self.watchdog = None;

        match exit {
            Exit::EndOfStream | Exit::StopRequested => {
                if let Some(downstream) = &runner.downstream {
                    downstream.push_end();
                }
                if exit == Exit::StopRequested {
                    if let Some(upstream) = &runner.upstream {
                        upstream.close_reader();
                    }
                }
            }
            Exit::Closed => {
                if let Some(upstream) = &runner.upstream {
                    upstream.close_reader();
                }
            }
            Exit::Aborted => {}
            Exit::Fatal => coordinator.request_stop(ShutdownMode::Abort, StopCause::Fatal),
        }

        if let Some(mut plugin) = self.plugin.take() {
            runner.set_state(StageState::Stopping);
            if let Err(e) = plugin.stop(&self.ctx) {
                log::warn!("{}: stop failed: {:#}", self.ctx, e);
            }
        }
        runner.set_state(StageState::Stopped);

        let pending = {
            let mut control = runner.lock();
            control.exited = true;
            runner.restart_pending.store(false, Ordering::Release);
            control.restart.take()
        };
        if let Some(request) = pending {
            let _ = request.reply.send(Err(PipelineError::Terminated));
        }

        log::debug!("{}: {}", self.ctx, runner.stats.summary());
        if runner.kind == StageKind::Output {
            coordinator.finish();
        }
    }
}
