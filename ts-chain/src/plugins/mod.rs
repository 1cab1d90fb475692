//! Built-in plugins.

use clap::{ArgMatches, Command};

use crate::plugin::{PluginRegistry, StageOptions};

pub mod count;
pub mod drop_output;
pub mod file;
pub mod label;
pub mod null_input;
pub mod skip;
pub mod until;

pub fn register_builtins(registry: &mut PluginRegistry) {
    registry
        .register_input("null", |args| Ok(Box::new(null_input::NullInput::from_args(args)?)))
        .register_input("file", |args| Ok(Box::new(file::FileInput::from_args(args)?)))
        .register_processor("count", |args| Ok(Box::new(count::Count::from_args(args)?)))
        .register_processor("until", |args| Ok(Box::new(until::Until::from_args(args)?)))
        .register_processor("skip", |args| Ok(Box::new(skip::Skip::from_args(args)?)))
        .register_processor("label", |args| Ok(Box::new(label::Label::from_args(args)?)))
        .register_output("drop", |args| Ok(Box::new(drop_output::DropOutput::from_args(args)?)))
        .register_output("file", |args| Ok(Box::new(file::FileOutput::from_args(args)?)));
}

/// Parses plugin arguments; there is no program name in front of them.
pub(crate) fn parse_args(command: Command, args: &[String]) -> anyhow::Result<ArgMatches> {
    let name = command.get_name().to_string();
    command
        .no_binary_name(true)
        .disable_help_flag(true)
        .try_get_matches_from(args)
        .map_err(|e| anyhow::anyhow!("{}: {}", name, e.to_string().trim()))
}

/// Parses processor arguments together with the options every processor accepts.
pub fn parse_processor_args(
    command: Command,
    args: &[String],
) -> anyhow::Result<(ArgMatches, StageOptions)> {
    let matches = parse_args(command.arg(StageOptions::arg()), args)?;
    let options = StageOptions::from_matches(&matches);
    Ok((matches, options))
}
