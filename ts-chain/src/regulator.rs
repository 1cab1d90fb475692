//! Output pacing.
//!
//! The target bitrate comes from the first available source in order of
//! authority: explicit configuration, the input plugin's own report, then the
//! clock references seen in the stream. With no target the output runs free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::packet::PKT_SIZE_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateSource {
    Explicit,
    Input,
    StreamClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    OnTime,
    Slept(Duration),
    Interrupted,
}

struct Pacing {
    target: Option<u64>,
    reference: Instant,
    base_packets: u64,
}

pub struct BitrateRegulator {
    explicit: Option<u64>,
    input: AtomicU64,
    stream_clock: AtomicU64,
    quantum: Duration,
    pacing: Mutex<Pacing>,
}

impl BitrateRegulator {
    pub fn new(explicit: Option<u64>, quantum: Duration) -> Self {
        Self {
            explicit: explicit.filter(|b| *b > 0),
            input: AtomicU64::new(0),
            stream_clock: AtomicU64::new(0),
            quantum: quantum.max(Duration::from_millis(1)),
            pacing: Mutex::new(Pacing {
                target: None,
                reference: Instant::now(),
                base_packets: 0,
            }),
        }
    }

    /// Bitrate announced by the input plugin, 0 when unknown.
    pub fn report_input(&self, bitrate: u64) {
        self.input.store(bitrate, Ordering::Relaxed);
    }

    /// Bitrate derived from clock references embedded in the stream.
    pub fn report_stream_clock(&self, bitrate: u64) {
        self.stream_clock.store(bitrate, Ordering::Relaxed);
    }

    pub fn target(&self) -> Option<(u64, BitrateSource)> {
        if let Some(bitrate) = self.explicit {
            return Some((bitrate, BitrateSource::Explicit));
        }
        match self.input.load(Ordering::Relaxed) {
            0 => {}
            bitrate => return Some((bitrate, BitrateSource::Input)),
        }
        match self.stream_clock.load(Ordering::Relaxed) {
            0 => None,
            bitrate => Some((bitrate, BitrateSource::StreamClock)),
        }
    }

    /// Sleeps until `emitted` packets are due at the target bitrate.
    ///
    /// Called before a batch leaves, with `emitted` counting that batch. The
    /// wait is cut into slices of at most one quantum, `interrupted` is
    /// checked between slices. A change of target restarts the reference.
    pub fn throttle(&self, emitted: u64, interrupted: &dyn Fn() -> bool) -> Throttle {
        let Some((bitrate, source)) = self.target() else {
            return Throttle::OnTime;
        };

        let (reference, base) = {
            let mut pacing = self.pacing.lock().unwrap_or_else(PoisonError::into_inner);
            if pacing.target != Some(bitrate) {
                log::debug!("pacing at {} b/s ({:?})", bitrate, source);
                pacing.target = Some(bitrate);
                pacing.reference = Instant::now();
                pacing.base_packets = emitted;
            }
            (pacing.reference, pacing.base_packets)
        };

        let ideal = ideal_elapsed(emitted.saturating_sub(base), bitrate);
        let mut slept = Duration::ZERO;
        loop {
            let actual = reference.elapsed();
            if actual >= ideal {
                break;
            }
            if interrupted() {
                return Throttle::Interrupted;
            }
            let slice = (ideal - actual).min(self.quantum);
            std::thread::sleep(slice);
            slept += slice;
        }

        if slept.is_zero() {
            Throttle::OnTime
        } else {
            Throttle::Slept(slept)
        }
    }
}

/// Time needed to carry `packets` at `bitrate` bits per second.
pub fn ideal_elapsed(packets: u64, bitrate: u64) -> Duration {
    if bitrate == 0 {
        return Duration::ZERO;
    }
    let bits = u128::from(packets) * u128::from(PKT_SIZE_BITS);
    let nanos = bits * 1_000_000_000 / u128::from(bitrate);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never() -> bool {
        false
    }

    #[test]
    fn test_source_precedence() {
        let regulator = BitrateRegulator::new(None, Duration::from_millis(100));
        assert_eq!(regulator.target(), None);

        regulator.report_stream_clock(2_000_000);
        assert_eq!(regulator.target(), Some((2_000_000, BitrateSource::StreamClock)));

        regulator.report_input(3_000_000);
        assert_eq!(regulator.target(), Some((3_000_000, BitrateSource::Input)));

        let regulator = BitrateRegulator::new(Some(1_000_000), Duration::from_millis(100));
        regulator.report_input(3_000_000);
        assert_eq!(regulator.target(), Some((1_000_000, BitrateSource::Explicit)));
    }

    #[test]
    fn test_ideal_elapsed() {
        // 1000 packets per second
        assert_eq!(ideal_elapsed(1000, 1_504_000), Duration::from_secs(1));
        assert_eq!(ideal_elapsed(10, 1_504_000), Duration::from_millis(10));
        assert_eq!(ideal_elapsed(10, 0), Duration::ZERO);
    }

    #[test]
    fn test_free_running_without_target() {
        let regulator = BitrateRegulator::new(None, Duration::from_millis(100));
        assert_eq!(regulator.throttle(1_000_000, &never), Throttle::OnTime);
    }

    #[test]
    fn test_converges_to_target() {
        let bitrate = 1_504_000; // 1000 packets per second
        let regulator = BitrateRegulator::new(Some(bitrate), Duration::from_millis(20));
        let start = Instant::now();
        regulator.throttle(0, &never);
        let mut emitted = 0;
        while emitted < 400 {
            emitted += 10;
            regulator.throttle(emitted, &never);
        }
        let elapsed = start.elapsed().as_secs_f64();
        let measured = (emitted * PKT_SIZE_BITS) as f64 / elapsed;
        assert!(measured <= bitrate as f64 * 1.01, "measured {}", measured);
        assert!(measured >= bitrate as f64 * 0.8, "measured {}", measured);
    }

    #[test]
    fn test_interrupted_wait() {
        let regulator = BitrateRegulator::new(Some(1_504), Duration::from_millis(10));
        regulator.throttle(0, &never);
        let start = Instant::now();
        // ten seconds worth of packets
        assert_eq!(regulator.throttle(10, &|| true), Throttle::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
