use std::fmt;

use crate::metadata::Metadata;

/// Size in bytes of one transport packet.
pub const PKT_SIZE: usize = 188;
/// Size in bits of one transport packet.
pub const PKT_SIZE_BITS: u64 = PKT_SIZE as u64 * 8;

pub const SYNC_BYTE: u8 = 0x47;
pub const PID_NULL: u16 = 0x1FFF;

/// Program clock reference frequency.
pub const SYSTEM_CLOCK_HZ: u64 = 27_000_000;
/// PCR values wrap at 2^33 * 300.
pub const PCR_MODULO: u64 = (1 << 33) * 300;

/// Null packet: PID 0x1FFF, payload only, 0xFF stuffing.
pub const NULL_PACKET: Packet = Packet::null();

/// One fixed-size transport packet.
///
/// Packets move by value through the inter-stage buffers. A stage that
/// needs to keep a packet after forwarding it must clone it.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: [u8; PKT_SIZE],
}

impl Packet {
    pub const fn null() -> Self {
        let mut bytes = [0xFFu8; PKT_SIZE];
        bytes[0] = SYNC_BYTE;
        bytes[1] = 0x1F;
        bytes[2] = 0xFF;
        bytes[3] = 0x10;
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; PKT_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copies a packet out of a slice; `None` unless the slice is exactly `PKT_SIZE` long.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; PKT_SIZE] = data.try_into().ok()?;
        Some(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; PKT_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PKT_SIZE] {
        &mut self.bytes
    }

    pub fn has_valid_sync(&self) -> bool {
        self.bytes[0] == SYNC_BYTE
    }

    pub fn pid(&self) -> u16 {
        (u16::from(self.bytes[1] & 0x1F) << 8) | u16::from(self.bytes[2])
    }

    pub fn set_pid(&mut self, pid: u16) {
        self.bytes[1] = (self.bytes[1] & 0xE0) | ((pid >> 8) as u8 & 0x1F);
        self.bytes[2] = pid as u8;
    }

    pub fn is_null(&self) -> bool {
        self.pid() == PID_NULL
    }

    pub fn continuity_counter(&self) -> u8 {
        self.bytes[3] & 0x0F
    }

    pub fn set_continuity_counter(&mut self, cc: u8) {
        self.bytes[3] = (self.bytes[3] & 0xF0) | (cc & 0x0F);
    }

    fn has_pcr(&self) -> bool {
        let b = &self.bytes;
        b[3] & 0x20 != 0 && b[4] >= 7 && b[5] & 0x10 != 0
    }

    /// Program clock reference in 27 MHz ticks, when the adaptation field has one.
    pub fn pcr(&self) -> Option<u64> {
        if !self.has_pcr() {
            return None;
        }
        let b = &self.bytes;
        let base = (u64::from(b[6]) << 25)
            | (u64::from(b[7]) << 17)
            | (u64::from(b[8]) << 9)
            | (u64::from(b[9]) << 1)
            | (u64::from(b[10]) >> 7);
        let ext = (u64::from(b[10] & 0x01) << 8) | u64::from(b[11]);
        Some(base * 300 + ext)
    }

    /// Stores a PCR, creating a minimal adaptation field when there is none.
    /// Overwrites payload bytes 4..12 in that case.
    pub fn set_pcr(&mut self, pcr: u64) {
        let pcr = pcr % PCR_MODULO;
        let (base, ext) = (pcr / 300, pcr % 300);
        let b = &mut self.bytes;
        if b[3] & 0x20 == 0 || b[4] < 7 {
            b[3] |= 0x20;
            b[4] = 7;
            b[5] = 0;
        }
        b[5] |= 0x10;
        b[6] = (base >> 25) as u8;
        b[7] = (base >> 17) as u8;
        b[8] = (base >> 9) as u8;
        b[9] = (base >> 1) as u8;
        b[10] = (((base & 1) as u8) << 7) | 0x7E | ((ext >> 8) as u8 & 0x01);
        b[11] = ext as u8;
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("pid", &format_args!("{:#06x}", self.pid()))
            .field("cc", &self.continuity_counter())
            .field("sync", &self.has_valid_sync())
            .finish()
    }
}

/// A packet and its side-channel attributes, the unit stored in buffer slots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketSlot {
    pub packet: Packet,
    pub metadata: Metadata,
}

impl PacketSlot {
    pub fn new(packet: Packet, metadata: Metadata) -> Self {
        Self { packet, metadata }
    }
}

impl From<(Packet, Metadata)> for PacketSlot {
    fn from((packet, metadata): (Packet, Metadata)) -> Self {
        Self { packet, metadata }
    }
}
