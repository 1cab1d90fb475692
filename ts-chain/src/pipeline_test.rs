use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clap::Command;

use crate::config::{PipelineConfig, StageConfig};
use crate::error::{PipelineError, StageIoError};
use crate::metadata::Metadata;
use crate::packet::{Packet, PacketSlot};
use crate::pipeline::{Pipeline, RestartArgs};
use crate::regulator::BitrateSource;
use crate::plugin::{
    Disposition, InputPlugin, OutputPlugin, PluginRegistry, ProcessorPlugin, StageContext,
    StageOptions,
};
use crate::plugins::parse_processor_args;
use crate::state::StageState;
use crate::termination::{Outcome, Phase};

const OPEN: u64 = u64::MAX;
const UNTAGGED: u8 = 0xFF;

/// Packets carry their input position in bytes 4..12.
fn numbered(n: u64) -> Packet {
    let mut packet = Packet::null();
    packet.set_pid(0x100);
    packet.as_bytes_mut()[4..12].copy_from_slice(&n.to_be_bytes());
    packet
}

fn number_of(packet: &Packet) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&packet.as_bytes()[4..12]);
    u64::from_be_bytes(bytes)
}

fn flipped(packet: &Packet) -> bool {
    packet.as_bytes()[20] == 0x00
}

fn tag_of(packet: &Packet) -> u8 {
    packet.as_bytes()[30]
}

/// 2000 packets per second when every tenth packet carries a PCR.
const PCR_TICKS_PER_PACKET: u64 = 13_500;

struct SeqInput {
    total: Option<u64>,
    gate: Option<Arc<AtomicU64>>,
    pcr: bool,
    stopped: Arc<AtomicBool>,
    next: u64,
}

impl InputPlugin for SeqInput {
    fn receive(&mut self, batch: &mut [PacketSlot], ctx: &StageContext) -> Result<usize, StageIoError> {
        loop {
            let mut count = batch.len() as u64;
            if let Some(total) = self.total {
                let left = total - self.next;
                if left == 0 {
                    return Ok(0);
                }
                count = count.min(left);
            }
            if let Some(gate) = &self.gate {
                let open = gate.load(Ordering::Acquire).saturating_sub(self.next);
                if open == 0 {
                    if ctx.is_aborted() || ctx.is_draining() {
                        return Ok(0);
                    }
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                count = count.min(open);
            }
            for slot in batch.iter_mut().take(count as usize) {
                slot.packet = numbered(self.next + 1);
                if self.pcr && self.next % 10 == 0 {
                    slot.packet.set_pcr(self.next * PCR_TICKS_PER_PACKET);
                }
                self.next += 1;
            }
            return Ok(count as usize);
        }
    }

    fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }
}

/// Delivers a few packets, then blocks in `receive` until the pipeline aborts.
struct StallInput {
    count: u64,
    next: u64,
}

impl InputPlugin for StallInput {
    fn receive(&mut self, batch: &mut [PacketSlot], ctx: &StageContext) -> Result<usize, StageIoError> {
        if self.next < self.count {
            let count = (batch.len() as u64).min(self.count - self.next);
            for slot in batch.iter_mut().take(count as usize) {
                self.next += 1;
                slot.packet = numbered(self.next);
            }
            return Ok(count as usize);
        }
        while !ctx.is_aborted() {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(0)
    }
}

/// Flips byte 20 of every packet it processes.
struct Xor(StageOptions);

impl ProcessorPlugin for Xor {
    fn stage_options(&self) -> StageOptions {
        self.0.clone()
    }

    fn process(&mut self, packet: &mut Packet, _metadata: &mut Metadata, _ctx: &StageContext) -> Disposition {
        packet.as_bytes_mut()[20] ^= 0xFF;
        Disposition::Ok
    }
}

/// Writes its instance number into byte 30.
struct Tag(u8);

impl ProcessorPlugin for Tag {
    fn process(&mut self, packet: &mut Packet, _metadata: &mut Metadata, _ctx: &StageContext) -> Disposition {
        packet.as_bytes_mut()[30] = self.0;
        Disposition::Ok
    }
}

/// Holds every packet until the gate opens.
struct Block(Arc<AtomicBool>);

impl ProcessorPlugin for Block {
    fn process(&mut self, _packet: &mut Packet, _metadata: &mut Metadata, ctx: &StageContext) -> Disposition {
        while !self.0.load(Ordering::Acquire) && !ctx.is_aborted() {
            thread::sleep(Duration::from_millis(1));
        }
        Disposition::Ok
    }
}

struct FailAt(u64);

impl ProcessorPlugin for FailAt {
    fn process(&mut self, packet: &mut Packet, _metadata: &mut Metadata, _ctx: &StageContext) -> Disposition {
        if number_of(packet) == self.0 {
            Disposition::Fatal
        } else {
            Disposition::Ok
        }
    }
}

/// Nullifies every fifth packet.
struct Nullify;

impl ProcessorPlugin for Nullify {
    fn process(&mut self, _packet: &mut Packet, metadata: &mut Metadata, _ctx: &StageContext) -> Disposition {
        if metadata.sequence() % 5 == 0 {
            Disposition::Null
        } else {
            Disposition::Ok
        }
    }
}

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<PacketSlot>>>);

impl Sink {
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn slots(&self) -> Vec<PacketSlot> {
        self.0.lock().unwrap().clone()
    }

    fn numbers(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(|s| number_of(&s.packet)).collect()
    }
}

struct Collect {
    sink: Sink,
    delay: Duration,
}

impl OutputPlugin for Collect {
    fn send(&mut self, batch: &[PacketSlot], _ctx: &StageContext) -> Result<(), StageIoError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.sink.0.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }
}

struct Harness {
    registry: PluginRegistry,
    sink: Sink,
    gate: Arc<AtomicU64>,
    blocker: Arc<AtomicBool>,
    input_stopped: Arc<AtomicBool>,
}

fn harness(output_delay: Duration) -> Harness {
    let sink = Sink::default();
    let gate = Arc::new(AtomicU64::new(0));
    let blocker = Arc::new(AtomicBool::new(false));
    let input_stopped = Arc::new(AtomicBool::new(false));
    let tags = Arc::new(AtomicU64::new(0));

    let mut registry = PluginRegistry::with_builtins();
    {
        let gate = gate.clone();
        let stopped = input_stopped.clone();
        registry.register_input("seq", move |args| {
            let gated = args.iter().any(|a| a == "--gated");
            let pcr = args.iter().any(|a| a == "--pcr");
            let total = match args.iter().find(|a| !a.starts_with("--")) {
                Some(count) => Some(count.parse::<u64>()?),
                None => None,
            };
            Ok(Box::new(SeqInput {
                total,
                gate: gated.then(|| gate.clone()),
                pcr,
                stopped: stopped.clone(),
                next: 0,
            }))
        });
    }
    registry.register_input("stall", |args| {
        let count = args
            .first()
            .ok_or_else(|| anyhow::anyhow!("stall: missing packet count"))?
            .parse()?;
        Ok(Box::new(StallInput { count, next: 0 }))
    });
    {
        let tags = tags.clone();
        registry.register_processor("tag", move |args| {
            if !args.is_empty() {
                anyhow::bail!("tag: unexpected arguments {:?}", args);
            }
            let id = tags.fetch_add(1, Ordering::AcqRel) + 1;
            Ok(Box::new(Tag(id as u8)))
        });
    }
    {
        let blocker = blocker.clone();
        registry.register_processor("block", move |_| Ok(Box::new(Block(blocker.clone()))));
    }
    registry
        .register_processor("xor", |args| {
            let (_, options) = parse_processor_args(Command::new("xor"), args)?;
            Ok(Box::new(Xor(options)))
        })
        .register_processor("nullify", |_| Ok(Box::new(Nullify)))
        .register_processor("fail-at", |args| {
            let at = args
                .first()
                .ok_or_else(|| anyhow::anyhow!("fail-at: missing packet number"))?
                .parse()?;
            Ok(Box::new(FailAt(at)))
        });
    {
        let sink = sink.clone();
        registry.register_output("collect", move |_| {
            Ok(Box::new(Collect {
                sink: sink.clone(),
                delay: output_delay,
            }))
        });
    }

    Harness {
        registry,
        sink,
        gate,
        blocker,
        input_stopped,
    }
}

fn chain(input: &[&str], processors: Vec<StageConfig>) -> PipelineConfig {
    PipelineConfig {
        buffer_size: 16,
        max_input_packets: 8,
        max_output_packets: 8,
        input: StageConfig::new("seq", input),
        processors,
        output: StageConfig::new("collect", &[]),
        ..PipelineConfig::default()
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_joined_until_delivers_exactly_500() {
    let h = harness(Duration::ZERO);
    let config = chain(
        &["1000"],
        vec![StageConfig::new("until", &["--packets", "500", "--joint-termination"])],
    );
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    assert_eq!(pipeline.wait(), Outcome::Completed);
    assert_eq!(pipeline.phase(), Phase::Terminated);
    assert_eq!(h.sink.numbers(), (1..=500).collect::<Vec<_>>());
}

#[test]
fn test_small_buffer_backpressure_loses_nothing() {
    let h = harness(Duration::from_millis(1));
    let mut config = chain(&["10000"], Vec::new());
    config.max_output_packets = 16;
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    assert_eq!(pipeline.wait(), Outcome::Completed);
    assert_eq!(h.sink.numbers(), (1..=10_000).collect::<Vec<_>>());
    let stats = pipeline.stage(0).unwrap().stats().summary();
    assert_eq!(stats.emitted, 10_000);
}

#[test]
fn test_suspend_is_equivalent_to_bypass() {
    let with_stage = harness(Duration::ZERO);
    let config = chain(&["500", "--gated"], vec![StageConfig::new("xor", &[])]);
    let pipeline = Pipeline::build(&config, &with_stage.registry).unwrap();
    pipeline.suspend(1).unwrap();
    with_stage.gate.store(OPEN, Ordering::Release);
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let without_stage = harness(Duration::ZERO);
    let config = chain(&["500"], Vec::new());
    let pipeline = Pipeline::build(&config, &without_stage.registry).unwrap();
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let a: Vec<Packet> = with_stage.sink.slots().into_iter().map(|s| s.packet).collect();
    let b: Vec<Packet> = without_stage.sink.slots().into_iter().map(|s| s.packet).collect();
    assert_eq!(a.len(), 500);
    assert_eq!(a, b);
}

#[test]
fn test_suspend_resume_loses_and_duplicates_nothing() {
    let h = harness(Duration::ZERO);
    let config = chain(&["1000", "--gated"], vec![StageConfig::new("xor", &[])]);
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    h.gate.store(200, Ordering::Release);
    wait_for("200 packets", || h.sink.len() == 200);
    pipeline.suspend(1).unwrap();
    assert_eq!(pipeline.stage(1).unwrap().state(), StageState::Suspended);

    h.gate.store(300, Ordering::Release);
    wait_for("300 packets", || h.sink.len() == 300);
    pipeline.resume(1).unwrap();
    assert_eq!(pipeline.stage(1).unwrap().state(), StageState::Running);

    h.gate.store(OPEN, Ordering::Release);
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let slots = h.sink.slots();
    let numbers: Vec<u64> = slots.iter().map(|s| number_of(&s.packet)).collect();
    assert_eq!(numbers, (1..=1000).collect::<Vec<_>>());
    for slot in &slots {
        let n = number_of(&slot.packet);
        assert_eq!(flipped(&slot.packet), !(201..=300).contains(&n), "packet {}", n);
    }
    let stats = pipeline.stage(1).unwrap().stats().summary();
    assert_eq!(stats.passed, 100);
    assert_eq!(stats.processed, 900);
}

#[test]
fn test_restart_same_keeps_packet_count() {
    let h = harness(Duration::ZERO);
    let config = chain(&["1000", "--gated"], vec![StageConfig::new("tag", &[])]);
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    h.gate.store(300, Ordering::Release);
    wait_for("300 packets", || h.sink.len() == 300);
    let before = pipeline.list();
    pipeline.restart(1, RestartArgs::Same).unwrap();
    let after = pipeline.list();

    assert_eq!(after[1].state, StageState::Running);
    assert_eq!(after[1].args, before[1].args);
    // neighbours untouched
    assert_eq!(after[0].state, before[0].state);
    assert_eq!(after[2].state, before[2].state);
    assert_eq!(after[0].stats.emitted, 300);

    h.gate.store(OPEN, Ordering::Release);
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let slots = h.sink.slots();
    assert_eq!(slots.len(), 1000);
    for slot in &slots {
        let n = number_of(&slot.packet);
        let expected = if n <= 300 { 1 } else { 2 };
        assert_eq!(tag_of(&slot.packet), expected, "packet {}", n);
    }
}

#[test]
fn test_failed_restart_bypasses_and_can_restart_again() {
    let h = harness(Duration::ZERO);
    let config = chain(&["100", "--gated"], vec![StageConfig::new("tag", &[])]);
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    h.gate.store(50, Ordering::Release);
    wait_for("50 packets", || h.sink.len() == 50);
    let err = pipeline
        .restart(1, RestartArgs::New(vec!["--bogus".to_string()]))
        .unwrap_err();
    assert!(matches!(err, PipelineError::RestartFailure { index: 1, .. }));
    assert_eq!(pipeline.stage(1).unwrap().state(), StageState::Failed);
    assert_eq!(pipeline.stage(0).unwrap().state(), StageState::Running);
    assert!(matches!(pipeline.suspend(1), Err(PipelineError::InvalidState { .. })));

    h.gate.store(70, Ordering::Release);
    wait_for("70 packets", || h.sink.len() == 70);
    pipeline.restart(1, RestartArgs::New(Vec::new())).unwrap();
    assert_eq!(pipeline.stage(1).unwrap().state(), StageState::Running);

    h.gate.store(OPEN, Ordering::Release);
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let slots = h.sink.slots();
    assert_eq!(slots.len(), 100);
    for slot in &slots {
        let n = number_of(&slot.packet);
        let expected = match n {
            1..=50 => 1,
            51..=70 => UNTAGGED,
            _ => 2,
        };
        assert_eq!(tag_of(&slot.packet), expected, "packet {}", n);
    }

    assert!(matches!(
        pipeline.restart(1, RestartArgs::Same),
        Err(PipelineError::Terminated)
    ));
}

#[test]
fn test_newer_restart_cancels_pending_one() {
    let h = harness(Duration::ZERO);
    let config = chain(&["10", "--gated"], vec![StageConfig::new("block", &[])]);
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    // stage 1 is now stuck inside its plugin on packet 1
    h.gate.store(1, Ordering::Release);
    wait_for("packet 1 to reach the processor", || {
        pipeline.stage(1).unwrap().stats().processed() == 1
    });

    let stage = pipeline.stage(1).unwrap();
    let first = stage.request_restart(None).unwrap();
    let second = stage.request_restart(None).unwrap();
    assert!(matches!(
        first.blocking_recv().unwrap(),
        Err(PipelineError::RestartFailure { index: 1, .. })
    ));

    h.blocker.store(true, Ordering::Release);
    second.blocking_recv().unwrap().unwrap();

    h.gate.store(OPEN, Ordering::Release);
    assert_eq!(pipeline.wait(), Outcome::Completed);
    assert_eq!(h.sink.numbers(), (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_graceful_exit_drains_buffered_packets() {
    let h = harness(Duration::from_millis(2));
    let mut config = chain(&[], vec![StageConfig::new("xor", &[])]);
    config.max_input_packets = 64;
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    wait_for("some output", || h.sink.len() > 32);
    assert_eq!(pipeline.phase(), Phase::Running);
    pipeline.request_exit(false);
    assert_eq!(pipeline.wait(), Outcome::Completed);

    // every packet read from the input reaches the output, whole batches included
    let input = pipeline.stage(0).unwrap().stats().summary();
    assert_eq!(input.processed, input.emitted);
    let numbers = h.sink.numbers();
    assert_eq!(numbers.len() as u64, input.emitted);
    assert_eq!(numbers, (1..=input.emitted).collect::<Vec<_>>());
    assert!(h.input_stopped.load(Ordering::Acquire));
}

#[test]
fn test_repeated_graceful_exits_lose_no_batch() {
    for _ in 0..10 {
        let h = harness(Duration::ZERO);
        let mut config = chain(&[], Vec::new());
        config.max_input_packets = 64;
        let pipeline = Pipeline::build(&config, &h.registry).unwrap();

        wait_for("some output", || h.sink.len() > 100);
        pipeline.request_exit(false);
        assert_eq!(pipeline.wait(), Outcome::Completed);

        let input = pipeline.stage(0).unwrap().stats().summary();
        assert_eq!(input.processed, input.emitted);
        assert_eq!(h.sink.len() as u64, input.processed);
    }
}

#[test]
fn test_abort_discards_buffered_packets() {
    let h = harness(Duration::from_millis(5));
    let mut config = chain(&[], Vec::new());
    config.buffer_size = 64;
    config.max_output_packets = 4;
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    wait_for("a full buffer", || {
        pipeline.stage(0).unwrap().stats().emitted() > 64
    });
    pipeline.request_exit(true);
    assert_eq!(pipeline.wait(), Outcome::Aborted);

    let pushed = pipeline.stage(0).unwrap().stats().emitted();
    assert!((h.sink.len() as u64) < pushed);
    assert!(pipeline.stages.iter().all(|s| s.state() == StageState::Stopped));
}

#[test]
fn test_fatal_disposition_aborts_pipeline() {
    let h = harness(Duration::ZERO);
    let config = chain(&["1000"], vec![StageConfig::new("fail-at", &["50"])]);
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    assert_eq!(pipeline.wait(), Outcome::Failed);
    let numbers = h.sink.numbers();
    assert!(numbers.iter().all(|n| *n < 50));
    assert_eq!(pipeline.stage(1).unwrap().state(), StageState::Stopped);
}

#[test]
fn test_startup_failure_tears_down_started_stages() {
    let h = harness(Duration::ZERO);
    let config = chain(&["10"], vec![StageConfig::new("until", &[])]);
    let err = Pipeline::build(&config, &h.registry).err().unwrap();
    assert!(matches!(err, PipelineError::StartupFailure { index: 1, .. }));
    assert!(h.input_stopped.load(Ordering::Acquire));
    assert_eq!(h.sink.len(), 0);

    let config = chain(&["10"], vec![StageConfig::new("nope", &[])]);
    assert!(matches!(
        Pipeline::build(&config, &h.registry),
        Err(PipelineError::UnknownPlugin { .. })
    ));
}

#[test]
fn test_control_errors() {
    let h = harness(Duration::ZERO);
    let config = chain(&["10", "--gated"], vec![StageConfig::new("xor", &[])]);
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    assert!(matches!(pipeline.suspend(0), Err(PipelineError::InputNotSuspendable)));
    assert!(matches!(
        pipeline.suspend(3),
        Err(PipelineError::IndexOutOfRange { index: 3, len: 3 })
    ));
    assert!(matches!(pipeline.resume(1), Err(PipelineError::NotSuspended(1))));
    pipeline.suspend(2).unwrap();
    pipeline.suspend(2).unwrap();
    pipeline.resume(2).unwrap();

    h.gate.store(OPEN, Ordering::Release);
    assert_eq!(pipeline.wait(), Outcome::Completed);
    assert!(matches!(pipeline.suspend(1), Err(PipelineError::Terminated)));
    assert_eq!(pipeline.list().len(), 3);
}

#[test]
fn test_suspended_output_discards() {
    let h = harness(Duration::ZERO);
    let config = chain(&["100", "--gated"], Vec::new());
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    pipeline.suspend(1).unwrap();
    h.gate.store(OPEN, Ordering::Release);
    assert_eq!(pipeline.wait(), Outcome::Completed);
    assert_eq!(h.sink.len(), 0);
    assert_eq!(pipeline.stage(1).unwrap().stats().passed(), 100);
}

#[test]
fn test_only_label_and_null_disposition() {
    let h = harness(Duration::ZERO);
    let config = chain(
        &["30"],
        vec![
            StageConfig::new("label", &["--set", "2", "--every", "2"]),
            StageConfig::new("xor", &["--only-label", "2"]),
            StageConfig::new("nullify", &[]),
        ],
    );
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let slots = h.sink.slots();
    assert_eq!(slots.len(), 30);
    for slot in &slots {
        let seq = slot.metadata.sequence();
        if seq % 5 == 0 {
            assert!(slot.packet.is_null());
            assert!(slot.metadata.is_nullified());
        } else {
            assert_eq!(number_of(&slot.packet), seq);
            assert_eq!(flipped(&slot.packet), seq % 2 == 0, "packet {}", seq);
        }
    }
}

#[test]
fn test_drops_keep_order_and_sequence() {
    let h = harness(Duration::ZERO);
    let config = chain(&["100"], vec![StageConfig::new("skip", &["--packets", "10"])]);
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let slots = h.sink.slots();
    let numbers: Vec<u64> = slots.iter().map(|s| number_of(&s.packet)).collect();
    assert_eq!(numbers, (11..=100).collect::<Vec<_>>());
    assert!(slots.windows(2).all(|w| w[0].metadata.sequence() < w[1].metadata.sequence()));
    assert!(slots.iter().all(|s| s.metadata.has_timestamp()));
    assert_eq!(pipeline.stage(1).unwrap().stats().dropped(), 10);
}

#[test]
fn test_output_is_paced_to_bitrate() {
    let h = harness(Duration::ZERO);
    let mut config = chain(&["300"], Vec::new());
    config.bitrate = Some(2 * 1_504_000); // 2000 packets per second
    config.pacing_quantum_ms = 20;
    let start = Instant::now();
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();
    assert_eq!(pipeline.wait(), Outcome::Completed);

    assert_eq!(h.sink.len(), 300);
    assert!(start.elapsed() >= Duration::from_millis(140), "{:?}", start.elapsed());
}

#[test]
fn test_ignore_joint_termination() {
    let h = harness(Duration::ZERO);
    let mut config = chain(
        &["1000"],
        vec![StageConfig::new("until", &["--packets", "500", "--joint-termination"])],
    );
    config.ignore_joint_termination = true;
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    assert_eq!(pipeline.wait(), Outcome::Completed);
    assert_eq!(pipeline.coordinator().joined_count(), 0);
    assert_eq!(h.sink.len(), 500);
    assert_eq!(pipeline.stage(0).unwrap().stats().emitted(), 1000);
}

#[test]
fn test_unbounded_input_joined_until_completes_at_500() {
    let h = harness(Duration::ZERO);
    let config = chain(
        &[],
        vec![StageConfig::new("until", &["--packets", "500", "--joint-termination"])],
    );
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    assert_eq!(pipeline.wait(), Outcome::Completed);
    assert_eq!(h.sink.numbers(), (1..=500).collect::<Vec<_>>());
    assert!(h.input_stopped.load(Ordering::Acquire));
}

#[test]
fn test_partial_quorum_keeps_running() {
    let h = harness(Duration::ZERO);
    let config = chain(
        &["--gated"],
        vec![
            StageConfig::new("until", &["--packets", "50", "--joint-termination"]),
            StageConfig::new("until", &["--packets", "5000", "--joint-termination"]),
        ],
    );
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    h.gate.store(1000, Ordering::Release);
    wait_for("1000 packets read", || {
        pipeline.stage(0).unwrap().stats().emitted() == 1000
    });
    thread::sleep(Duration::from_millis(300));
    assert_eq!(pipeline.phase(), Phase::Running);
    assert_eq!(pipeline.coordinator().joined_count(), 2);
    assert_eq!(pipeline.coordinator().pending_count(), 1);
    assert_eq!(h.sink.numbers(), (1..=50).collect::<Vec<_>>());

    pipeline.request_exit(false);
    assert_eq!(pipeline.wait(), Outcome::Completed);
    assert_eq!(h.sink.len(), 50);
}

#[test]
fn test_restart_output_and_suspended_processor() {
    let h = harness(Duration::ZERO);
    let config = chain(&["1000", "--gated"], vec![StageConfig::new("xor", &[])]);
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    h.gate.store(300, Ordering::Release);
    wait_for("300 packets", || h.sink.len() == 300);
    pipeline.suspend(1).unwrap();
    pipeline.restart(2, RestartArgs::Same).unwrap();
    assert_eq!(pipeline.stage(2).unwrap().state(), StageState::Running);
    pipeline.restart(1, RestartArgs::Same).unwrap();
    assert_eq!(pipeline.stage(1).unwrap().state(), StageState::Suspended);

    h.gate.store(600, Ordering::Release);
    wait_for("600 packets", || h.sink.len() == 600);
    pipeline.resume(1).unwrap();
    h.gate.store(OPEN, Ordering::Release);
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let slots = h.sink.slots();
    let numbers: Vec<u64> = slots.iter().map(|s| number_of(&s.packet)).collect();
    assert_eq!(numbers, (1..=1000).collect::<Vec<_>>());
    for slot in &slots {
        let n = number_of(&slot.packet);
        assert_eq!(flipped(&slot.packet), !(301..=600).contains(&n), "packet {}", n);
    }
}

#[test]
fn test_restart_input_with_new_arguments() {
    let h = harness(Duration::ZERO);
    let config = chain(&["1000", "--gated"], Vec::new());
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    h.gate.store(300, Ordering::Release);
    wait_for("300 packets", || h.sink.len() == 300);

    // the old instance only sees the restart once a packet gets it out of receive
    let restarted = thread::scope(|s| {
        let restarting =
            s.spawn(|| pipeline.restart(0, RestartArgs::New(vec!["50".to_string()])));
        while !restarting.is_finished() {
            h.gate.fetch_add(1, Ordering::AcqRel);
            thread::sleep(Duration::from_millis(5));
        }
        restarting.join().unwrap()
    });
    restarted.unwrap();
    assert!(h.input_stopped.load(Ordering::Acquire));
    assert_eq!(pipeline.list()[0].args, vec!["50".to_string()]);
    assert_eq!(pipeline.wait(), Outcome::Completed);

    let slots = h.sink.slots();
    let numbers: Vec<u64> = slots.iter().map(|s| number_of(&s.packet)).collect();
    let old = numbers.len() - 50;
    assert!(old > 300, "{} packets from the first instance", old);
    assert_eq!(numbers[..old].to_vec(), (1..=old as u64).collect::<Vec<_>>());
    assert_eq!(numbers[old..].to_vec(), (1..=50).collect::<Vec<_>>());
    assert!(slots.windows(2).all(|w| w[0].metadata.sequence() < w[1].metadata.sequence()));
}

#[test]
fn test_stream_clock_paces_output() {
    let h = harness(Duration::ZERO);
    let mut config = chain(&["1000", "--pcr"], Vec::new());
    config.pacing_quantum_ms = 20;
    let start = Instant::now();
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();
    assert_eq!(pipeline.wait(), Outcome::Completed);

    assert_eq!(h.sink.len(), 1000);
    assert_eq!(
        pipeline.regulator().target(),
        Some((3_008_000, BitrateSource::StreamClock))
    );
    // the clock is known after about 330 packets, the rest leaves at 2000/s
    assert!(start.elapsed() >= Duration::from_millis(250), "{:?}", start.elapsed());
}

#[test]
fn test_receive_timeout_aborts_pipeline() {
    let h = harness(Duration::ZERO);
    let mut config = chain(&["20"], Vec::new());
    config.input = StageConfig::new("stall", &["20"]);
    config.receive_timeout_ms = Some(200);
    let start = Instant::now();
    let pipeline = Pipeline::build(&config, &h.registry).unwrap();

    wait_for("20 packets", || h.sink.len() == 20);
    let restarted = thread::scope(|s| {
        let restarting = s.spawn(|| pipeline.restart(0, RestartArgs::Same));
        // listing does not wait behind the pending restart
        assert_eq!(pipeline.list().len(), 2);
        restarting.join().unwrap()
    });
    assert!(matches!(restarted, Err(PipelineError::Terminated)));

    assert_eq!(pipeline.wait(), Outcome::Failed);
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(h.sink.numbers(), (1..=20).collect::<Vec<_>>());
}

#[test]
fn test_only_label_rejected_outside_processors() {
    let h = harness(Duration::ZERO);
    let mut config = chain(&["10"], Vec::new());
    config.input = StageConfig::new("null", &["10", "--only-label", "1"]);
    assert!(matches!(
        Pipeline::build(&config, &h.registry),
        Err(PipelineError::StartupFailure { index: 0, .. })
    ));

    let config = chain(
        &["10"],
        vec![StageConfig::new("skip", &["--packets", "2", "--only-label", "40"])],
    );
    assert!(matches!(
        Pipeline::build(&config, &h.registry),
        Err(PipelineError::StartupFailure { index: 1, .. })
    ));
}
