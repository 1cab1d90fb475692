use clap::{Arg, Command};

use crate::metadata::Metadata;
use crate::packet::Packet;
use crate::plugin::{Disposition, ProcessorPlugin, StageContext, StageOptions};

/// Drops the first N packets.
pub struct Skip {
    options: StageOptions,
    count: u64,
    skipped: u64,
}

impl Skip {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let (matches, options) = super::parse_processor_args(
            Command::new("skip").arg(
                Arg::new("packets")
                    .long("packets")
                    .short('p')
                    .required(true)
                    .value_parser(clap::value_parser!(u64)),
            ),
            args,
        )?;
        Ok(Self {
            options,
            count: matches.get_one::<u64>("packets").copied().unwrap_or(0),
            skipped: 0,
        })
    }
}

impl ProcessorPlugin for Skip {
    fn stage_options(&self) -> StageOptions {
        self.options.clone()
    }

    fn start(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        self.skipped = 0;
        Ok(())
    }

    fn process(&mut self, _packet: &mut Packet, _metadata: &mut Metadata, _ctx: &StageContext) -> Disposition {
        if self.skipped < self.count {
            self.skipped += 1;
            Disposition::Drop
        } else {
            Disposition::Ok
        }
    }
}
