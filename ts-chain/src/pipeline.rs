//! The chain: input → processors → output, joined by bounded buffers.
//!
//! Every stage runs on its own thread. Data moves strictly left to right
//! through `InterStageBuffer`s; backpressure comes from their bounded capacity.
//! Control (list, suspend, resume, restart, exit) enters through `Pipeline`
//! under one control lock, and reaches a stage only through its runner.
//!
//! Shutdown:
//! - graceful: the input forwards the rest of its current batch, queues the
//!   end marker, and every stage forwards it after its last packet; the output
//!   completes the drain
//! - abort: every buffer is aborted, packets in flight are counted and dropped

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::buffer::InterStageBuffer;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::metadata::SequenceCounter;
use crate::plugin::{PluginRegistry, StageKind};
use crate::regulator::BitrateRegulator;
use crate::runner::{ChainShared, StageInfo, StageRunner, StartedStage};
use crate::termination::{Outcome, Phase, ShutdownMode, StopCause, TerminationCoordinator};

/// Arguments of a restarted stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartArgs {
    Same,
    New(Vec<String>),
}

pub struct Pipeline {
    stages: Vec<Arc<StageRunner>>,
    buffers: Vec<Arc<InterStageBuffer>>,
    coordinator: Arc<TerminationCoordinator>,
    regulator: Arc<BitrateRegulator>,
    control_lock: Mutex<()>,
    joined: AtomicBool,
}

impl Pipeline {
    /// Builds and starts every stage in order. Nothing keeps running if any
    /// stage fails to start: stages already started are stopped again.
    pub fn build(config: &PipelineConfig, registry: &PluginRegistry) -> Result<Self, PipelineError> {
        let stage_count = config.stage_count();
        if stage_count < 2 {
            return Err(PipelineError::EmptyChain);
        }

        let mut factories = Vec::with_capacity(stage_count);
        for (index, stage) in config.stages().enumerate() {
            let kind = match index {
                0 => StageKind::Input,
                i if i + 1 == stage_count => StageKind::Output,
                _ => StageKind::Processor,
            };
            factories.push(registry.factory(kind, &stage.name)?);
        }

        let names: Vec<&str> = config.stages().map(|s| s.name.as_str()).collect();
        let buffers: Vec<Arc<InterStageBuffer>> = names
            .windows(2)
            .map(|pair| {
                Arc::new(InterStageBuffer::new(
                    format!("{}->{}", pair[0], pair[1]),
                    config.buffer_size,
                ))
            })
            .collect();

        let coordinator = Arc::new(TerminationCoordinator::new(config.ignore_joint_termination));
        coordinator.attach_buffers(buffers.clone());
        let regulator = Arc::new(BitrateRegulator::new(config.bitrate, config.pacing_quantum()));
        let shared = Arc::new(ChainShared {
            coordinator: coordinator.clone(),
            regulator: regulator.clone(),
            sequence: SequenceCounter::new(),
            epoch: Instant::now(),
            max_input_packets: config.max_input_packets,
            max_output_packets: config.max_output_packets,
            receive_timeout: config.receive_timeout(),
        });

        let stages: Vec<Arc<StageRunner>> = config
            .stages()
            .zip(factories)
            .enumerate()
            .map(|(index, (stage, factory))| {
                StageRunner::new(
                    index,
                    &stage.name,
                    stage.args.clone(),
                    factory,
                    index.checked_sub(1).map(|i| buffers[i].clone()),
                    buffers.get(index).cloned(),
                    shared.clone(),
                )
            })
            .collect();

        let mut started: Vec<StartedStage> = Vec::with_capacity(stages.len());
        for runner in &stages {
            match runner.start_plugin() {
                Ok(stage) => {
                    log::debug!("{}[{}]: started", runner.name(), runner.index());
                    started.push(stage);
                }
                Err(e) => {
                    log::error!("{}", e);
                    for (runner, stage) in stages.iter().zip(started) {
                        runner.discard_plugin(stage);
                    }
                    return Err(e);
                }
            }
        }

        let pipeline = Self {
            stages,
            buffers,
            coordinator,
            regulator,
            control_lock: Mutex::new(()),
            joined: AtomicBool::new(false),
        };

        let mut pending = started.into_iter();
        let mut index = 0;
        while let Some(stage) = pending.next() {
            let runner = &pipeline.stages[index];
            if let Err(e) = runner.launch(stage) {
                log::error!("{}", e);
                pipeline
                    .coordinator
                    .request_stop(ShutdownMode::Abort, StopCause::Fatal);
                for (runner, stage) in pipeline.stages.iter().skip(index + 1).zip(pending) {
                    runner.discard_plugin(stage);
                }
                pipeline.wait();
                return Err(e);
            }
            index += 1;
        }

        log::info!("pipeline started: {}", names.join(" -> "));
        Ok(pipeline)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn coordinator(&self) -> &Arc<TerminationCoordinator> {
        &self.coordinator
    }

    pub fn regulator(&self) -> &Arc<BitrateRegulator> {
        &self.regulator
    }

    pub fn phase(&self) -> Phase {
        self.coordinator.phase()
    }

    pub fn stage(&self, index: usize) -> Result<&Arc<StageRunner>, PipelineError> {
        self.stages.get(index).ok_or(PipelineError::IndexOutOfRange {
            index,
            len: self.stages.len(),
        })
    }

    /// Snapshot only; does not wait behind a restart in progress.
    pub fn list(&self) -> Vec<StageInfo> {
        self.stages.iter().map(|stage| stage.info()).collect()
    }

    pub fn suspend(&self, index: usize) -> Result<(), PipelineError> {
        let _guard = self.control();
        let stage = self.stage(index)?;
        self.ensure_running()?;
        stage.suspend()
    }

    pub fn resume(&self, index: usize) -> Result<(), PipelineError> {
        let _guard = self.control();
        let stage = self.stage(index)?;
        self.ensure_running()?;
        stage.resume()
    }

    /// Replaces the plugin instance of one stage and waits until the new one
    /// runs. Must not be called from inside an async runtime worker.
    pub fn restart(&self, index: usize, args: RestartArgs) -> Result<(), PipelineError> {
        let _guard = self.control();
        let stage = self.stage(index)?;
        self.ensure_running()?;
        let args = match args {
            RestartArgs::Same => None,
            RestartArgs::New(args) => Some(args),
        };
        let reply = stage.request_restart(args)?;
        reply.blocking_recv().map_err(|_| PipelineError::Terminated)?
    }

    /// Does not wait for the control lock, so an abort always gets through.
    pub fn request_exit(&self, abort: bool) {
        let mode = if abort {
            ShutdownMode::Abort
        } else {
            ShutdownMode::Graceful
        };
        self.coordinator.request_stop(mode, StopCause::Operator);
    }

    /// Blocks until the pipeline terminates and every stage thread has exited.
    pub fn wait(&self) -> Outcome {
        let outcome = self.coordinator.wait();
        if !self.joined.swap(true, Ordering::AcqRel) {
            // stragglers upstream of a stage that stopped on its own
            for buffer in &self.buffers {
                buffer.abort();
            }
            self.join_stages();
            self.sweep();
            log::info!("pipeline finished: {:?}", outcome);
        }
        outcome
    }

    fn join_stages(&self) {
        for stage in &self.stages {
            stage.join();
        }
    }

    /// Drops and counts the packets still sitting in the buffers.
    fn sweep(&self) -> usize {
        let mut total = 0;
        for buffer in &self.buffers {
            let mut discarded = 0;
            while buffer.try_pop().is_some() {
                discarded += 1;
            }
            if discarded > 0 {
                log::info!("{}: discarded {} packets", buffer.name(), discarded);
            }
            total += discarded;
        }
        total
    }

    fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.coordinator.phase() == Phase::Terminated {
            return Err(PipelineError::Terminated);
        }
        Ok(())
    }

    fn control(&self) -> MutexGuard<'_, ()> {
        self.control_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.joined.load(Ordering::Acquire) {
            return;
        }
        if self.coordinator.phase() != Phase::Terminated {
            self.coordinator
                .request_stop(ShutdownMode::Abort, StopCause::Operator);
        }
        self.wait();
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
