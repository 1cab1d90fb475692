use clap::Command;

use crate::error::StageIoError;
use crate::packet::PacketSlot;
use crate::plugin::{OutputPlugin, StageContext};

/// Discards every packet.
pub struct DropOutput;

impl DropOutput {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        super::parse_args(Command::new("drop"), args)?;
        Ok(Self)
    }
}

impl OutputPlugin for DropOutput {
    fn send(&mut self, _batch: &[PacketSlot], _ctx: &StageContext) -> Result<(), StageIoError> {
        Ok(())
    }
}
