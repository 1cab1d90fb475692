use clap::{Arg, ArgAction, Command};

use crate::metadata::Metadata;
use crate::packet::Packet;
use crate::plugin::{Disposition, ProcessorPlugin, StageContext, StageOptions};

/// Counts the packets it sees and logs the total when stopped.
pub struct Count {
    options: StageOptions,
    total: u64,
    null: u64,
    corrupted: u64,
    quiet: bool,
}

impl Count {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let (matches, options) = super::parse_processor_args(
            Command::new("count").arg(
                Arg::new("quiet")
                    .long("quiet")
                    .short('q')
                    .action(ArgAction::SetTrue),
            ),
            args,
        )?;
        Ok(Self {
            options,
            total: 0,
            null: 0,
            corrupted: 0,
            quiet: matches.get_flag("quiet"),
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl ProcessorPlugin for Count {
    fn stage_options(&self) -> StageOptions {
        self.options.clone()
    }

    fn process(&mut self, packet: &mut Packet, metadata: &mut Metadata, _ctx: &StageContext) -> Disposition {
        self.total += 1;
        if packet.is_null() {
            self.null += 1;
        }
        if metadata.is_corrupted() {
            self.corrupted += 1;
        }
        Disposition::Ok
    }

    fn stop(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        if !self.quiet {
            log::info!(
                "{}: {} packets, {} null, {} corrupted",
                ctx,
                self.total,
                self.null,
                self.corrupted
            );
        }
        Ok(())
    }
}
