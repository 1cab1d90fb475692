//! Bitrate estimation from program clock references.

use std::collections::HashMap;

use crate::packet::{PKT_SIZE_BITS, Packet, SYSTEM_CLOCK_HZ};

/// PCRs needed, across all PIDs, before an estimate is given.
const MIN_PCR: u64 = 32;
/// PIDs with a usable clock needed before an estimate is given.
const MIN_PID: usize = 1;
/// A new estimate is worth reporting when it moves by more than 1/DEVIATION.
const DEVIATION: u64 = 200;

#[derive(Debug, Clone, Copy)]
struct PidClock {
    first_pcr: u64,
    first_index: u64,
    last_pcr: u64,
    last_index: u64,
    intervals: u64,
}

impl PidClock {
    fn start(pcr: u64, index: u64) -> Self {
        Self {
            first_pcr: pcr,
            first_index: index,
            last_pcr: pcr,
            last_index: index,
            intervals: 0,
        }
    }

    fn bitrate(&self) -> Option<u64> {
        let ticks = self.last_pcr.checked_sub(self.first_pcr).filter(|t| *t > 0)?;
        let packets = self.last_index - self.first_index;
        let bits = u128::from(packets) * u128::from(PKT_SIZE_BITS) * u128::from(SYSTEM_CLOCK_HZ);
        u64::try_from(bits / u128::from(ticks)).ok()
    }
}

/// Watches the input stream and derives its bitrate from the PCRs of every
/// PID that carries them.
///
/// A PCR that goes backwards (wrap or discontinuity) restarts the clock of
/// its PID.
#[derive(Debug, Default)]
pub struct PcrAnalyzer {
    packets: u64,
    intervals: u64,
    clocks: HashMap<u16, PidClock>,
    reported: u64,
}

impl PcrAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, packet: &Packet) {
        let index = self.packets;
        self.packets += 1;
        let Some(pcr) = packet.pcr() else {
            return;
        };
        let pid = packet.pid();
        match self.clocks.get_mut(&pid) {
            Some(clock) if pcr > clock.last_pcr => {
                clock.last_pcr = pcr;
                clock.last_index = index;
                clock.intervals += 1;
                self.intervals += 1;
            }
            Some(clock) => {
                log::debug!("PCR discontinuity on PID {:#06x}", pid);
                self.intervals -= clock.intervals;
                *clock = PidClock::start(pcr, index);
            }
            None => {
                self.clocks.insert(pid, PidClock::start(pcr, index));
            }
        }
    }

    /// Average of the per-PID bitrates, once enough PCRs were seen.
    pub fn bitrate(&self) -> Option<u64> {
        if self.intervals < MIN_PCR {
            return None;
        }
        let rates: Vec<u64> = self.clocks.values().filter_map(PidClock::bitrate).collect();
        if rates.len() < MIN_PID {
            return None;
        }
        Some(rates.iter().sum::<u64>() / rates.len() as u64)
    }

    /// The current estimate if it differs noticeably from the last one taken.
    pub fn take_change(&mut self) -> Option<u64> {
        let bitrate = self.bitrate()?;
        if bitrate.abs_diff(self.reported) * DEVIATION <= self.reported {
            return None;
        }
        self.reported = bitrate;
        Some(bitrate)
    }
}
