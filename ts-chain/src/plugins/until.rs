use clap::{Arg, ArgAction, Command};

use crate::metadata::Metadata;
use crate::packet::Packet;
use crate::plugin::{Disposition, ProcessorPlugin, StageContext, StageOptions};

/// Passes the first N packets, then ends the chain.
///
/// Alone it requests a stop on the N-th packet. Joined, it signals done on the
/// N-th packet and drops everything after it while the rest of the quorum
/// finishes.
pub struct Until {
    options: StageOptions,
    limit: u64,
    joint: bool,
    seen: u64,
}

impl Until {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let (matches, options) = super::parse_processor_args(
            Command::new("until")
                .arg(
                    Arg::new("packets")
                        .long("packets")
                        .short('p')
                        .required(true)
                        .value_parser(clap::value_parser!(u64).range(1..)),
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
            options,
            limit: matches
                .get_one::<u64>("packets")
                .copied()
                .ok_or_else(|| anyhow::anyhow!("until: missing --packets"))?,
            joint: matches.get_flag("joint-termination"),
            seen: 0,
        })
    }
}

impl ProcessorPlugin for Until {
    fn stage_options(&self) -> StageOptions {
        self.options.clone()
    }

    fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        self.seen = 0;
        if self.joint {
            ctx.join_termination();
        }
        Ok(())
    }

    fn process(&mut self, _packet: &mut Packet, _metadata: &mut Metadata, ctx: &StageContext) -> Disposition {
        if self.seen >= self.limit {
            return Disposition::Drop;
        }
        self.seen += 1;
        if self.seen < self.limit {
            return Disposition::Ok;
        }
        log::debug!("{}: reached {} packets", ctx, self.limit);
        if self.joint {
            ctx.signal_done();
            Disposition::Ok
        } else {
            Disposition::RequestStop
        }
    }
}
