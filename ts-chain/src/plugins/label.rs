use clap::{Arg, Command};

use crate::metadata::{MAX_LABELS, Metadata};
use crate::packet::Packet;
use crate::plugin::{Disposition, ProcessorPlugin, StageContext, StageOptions};

/// Sets a label on every N-th packet (every packet by default).
pub struct Label {
    options: StageOptions,
    label: usize,
    every: u64,
    seen: u64,
}

impl Label {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let (matches, options) = super::parse_processor_args(
            Command::new("label")
                .arg(
                    Arg::new("set")
                        .long("set")
                        .short('s')
                        .required(true)
                        .value_parser(clap::value_parser!(u8).range(0..MAX_LABELS as i64)),
                )
                .arg(
                    Arg::new("every")
                        .long("every")
                        .short('e')
                        .default_value("1")
                        .value_parser(clap::value_parser!(u64).range(1..)),
                ),
            args,
        )?;
        Ok(Self {
            options,
            label: usize::from(
                matches
                    .get_one::<u8>("set")
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("label: missing --set"))?,
            ),
            every: matches.get_one::<u64>("every").copied().unwrap_or(1),
            seen: 0,
        })
    }
}

impl ProcessorPlugin for Label {
    fn stage_options(&self) -> StageOptions {
        self.options.clone()
    }

    fn process(&mut self, _packet: &mut Packet, metadata: &mut Metadata, _ctx: &StageContext) -> Disposition {
        self.seen += 1;
        if self.seen % self.every == 0 {
            metadata.set_label(self.label);
        }
        Disposition::Ok
    }
}
