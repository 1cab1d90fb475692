//! Per-packet side-channel attributes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of distinct packet labels.
pub const MAX_LABELS: usize = 32;

/// Small bitset of labels `0..MAX_LABELS`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LabelSet(u32);

impl LabelSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_labels(labels: &[usize]) -> Self {
        let mut set = Self::empty();
        for &label in labels {
            set.set(label);
        }
        set
    }

    /// Out-of-range labels are ignored.
    pub fn set(&mut self, label: usize) {
        if label < MAX_LABELS {
            self.0 |= 1 << label;
        }
    }

    pub fn clear(&mut self, label: usize) {
        if label < MAX_LABELS {
            self.0 &= !(1 << label);
        }
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    pub fn test(&self, label: usize) -> bool {
        label < MAX_LABELS && self.0 & (1 << label) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersects(&self, other: LabelSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_LABELS).filter(move |l| self.test(*l))
    }
}

impl fmt::Debug for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Clock domain a packet time stamp was taken from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeSource {
    #[default]
    Undefined,
    /// Capture hardware clock.
    Hardware,
    /// Operating system kernel receive time.
    Kernel,
    /// Clock reference embedded in the stream.
    StreamClock,
    /// Software time taken by the engine when the packet was ingested.
    Engine,
}

impl fmt::Display for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeSource::Undefined => "undefined",
            TimeSource::Hardware => "hardware",
            TimeSource::Kernel => "kernel",
            TimeSource::StreamClock => "stream-clock",
            TimeSource::Engine => "engine",
        };
        f.write_str(s)
    }
}

/// Sequence number generator, owned by the input side of one pipeline.
///
/// Numbers start at 1 and are never reused, including across restarts of the
/// input stage.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn new_sequence(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Flags {
    corrupted: bool,
    null: bool,
    nullified: bool,
    bypass_requested: bool,
    input_stuffing: bool,
}

/// Attributes travelling with one packet through the chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    sequence: u64,
    labels: LabelSet,
    time_source: TimeSource,
    timestamp: Option<Duration>,
    flags: Flags,
}

impl Metadata {
    pub fn with_sequence(sequence: u64) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub fn labels(&self) -> LabelSet {
        self.labels
    }

    pub fn has_label(&self, label: usize) -> bool {
        self.labels.test(label)
    }

    pub fn has_any_label(&self, mask: LabelSet) -> bool {
        self.labels.intersects(mask)
    }

    pub fn set_label(&mut self, label: usize) {
        self.labels.set(label);
    }

    pub fn set_labels(&mut self, mask: LabelSet) {
        self.labels.0 |= mask.0;
    }

    pub fn clear_label(&mut self, label: usize) {
        self.labels.clear(label);
    }

    pub fn clear_all_labels(&mut self) {
        self.labels.clear_all();
    }

    pub fn time_source(&self) -> TimeSource {
        self.time_source
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    pub fn has_timestamp(&self) -> bool {
        self.timestamp.is_some()
    }

    pub fn set_timestamp(&mut self, timestamp: Duration, source: TimeSource) {
        self.timestamp = Some(timestamp);
        self.time_source = source;
    }

    pub fn clear_timestamp(&mut self) {
        self.timestamp = None;
        self.time_source = TimeSource::Undefined;
    }

    pub fn is_corrupted(&self) -> bool {
        self.flags.corrupted
    }

    pub fn set_corrupted(&mut self, on: bool) {
        self.flags.corrupted = on;
    }

    /// Filler packet inserted to keep a constant rate.
    pub fn is_null(&self) -> bool {
        self.flags.null
    }

    pub fn set_null(&mut self, on: bool) {
        self.flags.null = on;
    }

    /// Packet explicitly turned into a null packet by a processor.
    pub fn is_nullified(&self) -> bool {
        self.flags.nullified
    }

    pub fn set_nullified(&mut self, on: bool) {
        self.flags.nullified = on;
    }

    /// When set, downstream processors pass the packet without invoking their plugin.
    pub fn bypass_requested(&self) -> bool {
        self.flags.bypass_requested
    }

    pub fn set_bypass_requested(&mut self, on: bool) {
        self.flags.bypass_requested = on;
    }

    pub fn is_input_stuffing(&self) -> bool {
        self.flags.input_stuffing
    }

    pub fn set_input_stuffing(&mut self, on: bool) {
        self.flags.input_stuffing = on;
    }
}
