use clap::{Arg, ArgAction, Command};

use crate::error::StageIoError;
use crate::packet::{Packet, PacketSlot};
use crate::plugin::{InputPlugin, StageContext};

/// Generates null packets, forever or up to a count.
///
/// With `--joint-termination` the count does not end the input: the stage
/// signals done once the count is reached and keeps generating until the
/// whole chain drains.
pub struct NullInput {
    limit: Option<u64>,
    joint: bool,
    generated: u64,
    done: bool,
}

impl NullInput {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let matches = super::parse_args(
            Command::new("null")
                .arg(
                    Arg::new("count")
                        .value_parser(clap::value_parser!(u64))
                        .help("number of packets to generate"),
                )
                .arg(
                    Arg::new("joint-termination")
                        .long("joint-termination")
                        .short('j')
                        .action(ArgAction::SetTrue),
                ),
            args,
        )?;
        Ok(Self {
            limit: matches.get_one::<u64>("count").copied(),
            joint: matches.get_flag("joint-termination"),
            generated: 0,
            done: false,
        })
    }
}

impl InputPlugin for NullInput {
    fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        if self.joint && self.limit.is_some() {
            ctx.join_termination();
        }
        self.generated = 0;
        self.done = false;
        Ok(())
    }

    fn receive(&mut self, batch: &mut [PacketSlot], ctx: &StageContext) -> Result<usize, StageIoError> {
        let mut count = batch.len();
        if let Some(limit) = self.limit {
            let remaining = limit.saturating_sub(self.generated);
            if remaining == 0 && self.joint && !self.done {
                self.done = true;
                log::debug!("{}: {} packets generated", ctx, self.generated);
                ctx.signal_done();
            }
            if !self.joint {
                count = count.min(usize::try_from(remaining).unwrap_or(usize::MAX));
            }
        }
        for slot in batch.iter_mut().take(count) {
            slot.packet = Packet::null();
            slot.metadata.set_input_stuffing(true);
        }
        self.generated += count as u64;
        Ok(count)
    }
}
