use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ts_chain::{PipelineConfig, StageConfig};

const INPUT_FLAG: &str = "-I";
const PROCESSOR_FLAG: &str = "-P";
const OUTPUT_FLAG: &str = "-O";

#[derive(Parser, Debug)]
#[command(
    name = "tspipe",
    version,
    about = "Transport stream packet pipeline",
    arg_required_else_help = true,
    after_help = "Examples:\n  tspipe run -I file in.ts -P until --packets 1000 -O file out.ts\n  tspipe run --control 127.0.0.1:4000 -I null -P count -O drop\n  tspipe control --address 127.0.0.1:4000 suspend 1"
)]
pub struct Cli {
    /// Initial log verbosity (off, error, warn, info, debug, trace or 0-5).
    #[arg(long = "log-level", global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a chain: -I name [args] -P name [args]... -O name [args].
    Run(RunArgs),
    /// Send one command to a running chain.
    Control(ControlArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// JSON pipeline configuration; the inline chain replaces its stages.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Packets per inter-stage buffer.
    #[arg(long = "buffer-size")]
    pub buffer_size: Option<usize>,

    /// Largest batch read from the input plugin.
    #[arg(long = "max-input-packets")]
    pub max_input_packets: Option<usize>,

    /// Largest batch handed to the output plugin.
    #[arg(long = "max-output-packets")]
    pub max_output_packets: Option<usize>,

    /// Output bitrate in bits/s.
    #[arg(short = 'b', long = "bitrate")]
    pub bitrate: Option<u64>,

    /// Longest pacing sleep in milliseconds.
    #[arg(long = "pacing-quantum")]
    pub pacing_quantum_ms: Option<u64>,

    /// Abort when the input delivers nothing for this many milliseconds.
    #[arg(long = "receive-timeout")]
    pub receive_timeout_ms: Option<u64>,

    /// Turn every joint termination request into a no-op.
    #[arg(short = 'i', long = "ignore-joint-termination")]
    pub ignore_joint_termination: bool,

    /// Address of the control server (host:port).
    #[arg(long = "control")]
    pub control: Option<String>,

    /// Set by the chain splitter, not by clap.
    #[arg(skip)]
    pub chain: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ControlArgs {
    /// Address of the control server (host:port).
    #[arg(short = 'a', long = "address")]
    pub address: String,

    /// Command and its arguments, e.g. `restart 1 --same`.
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn is_stage_flag(arg: &str) -> bool {
    arg == INPUT_FLAG || arg == PROCESSOR_FLAG || arg == OUTPUT_FLAG
}

/// Parses the command line, taking the stage chain of `run` out of clap's hands.
pub fn parse(args: Vec<String>) -> Cli {
    let (args, chain) = split_chain(args);
    let mut cli = Cli::parse_from(args);
    if let Commands::Run(run) = &mut cli.command {
        run.chain = chain;
    }
    cli
}

/// Splits `run` arguments at the first stage flag.
pub fn split_chain(mut args: Vec<String>) -> (Vec<String>, Vec<String>) {
    let Some(run) = args.iter().position(|a| a == "run") else {
        return (args, Vec::new());
    };
    match args.iter().skip(run + 1).position(|a| is_stage_flag(a)) {
        Some(offset) => {
            let chain = args.split_off(run + 1 + offset);
            (args, chain)
        }
        None => (args, Vec::new()),
    }
}

/// Stages given inline on the command line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub input: Option<StageConfig>,
    pub processors: Vec<StageConfig>,
    pub output: Option<StageConfig>,
}

impl Chain {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.processors.is_empty() && self.output.is_none()
    }
}

pub fn parse_chain(args: &[String]) -> anyhow::Result<Chain> {
    let mut chain = Chain::default();
    let mut iter = args.iter().peekable();
    while let Some(flag) = iter.next() {
        if !is_stage_flag(flag) {
            return Err(anyhow::anyhow!("expected -I, -P or -O, found {}", flag));
        }
        let name = iter
            .next_if(|a| !is_stage_flag(a))
            .ok_or_else(|| anyhow::anyhow!("{} requires a plugin name", flag))?;
        let mut stage_args = Vec::new();
        while let Some(arg) = iter.next_if(|a| !is_stage_flag(a)) {
            stage_args.push(arg.clone());
        }
        let stage = StageConfig {
            name: name.clone(),
            args: stage_args,
        };
        match flag.as_str() {
            INPUT_FLAG if chain.input.is_some() => {
                return Err(anyhow::anyhow!("more than one input plugin"));
            }
            INPUT_FLAG => chain.input = Some(stage),
            OUTPUT_FLAG if chain.output.is_some() => {
                return Err(anyhow::anyhow!("more than one output plugin"));
            }
            OUTPUT_FLAG => chain.output = Some(stage),
            _ => chain.processors.push(stage),
        }
    }
    Ok(chain)
}

/// Configuration file first, then the inline chain and options on top.
pub fn pipeline_config(args: &RunArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    let chain = parse_chain(&args.chain)?;
    if !chain.is_empty() {
        let defaults = PipelineConfig::default();
        config.input = chain.input.unwrap_or(defaults.input);
        config.processors = chain.processors;
        config.output = chain.output.unwrap_or(defaults.output);
    }

    if let Some(size) = args.buffer_size {
        config.buffer_size = size;
    }
    if let Some(count) = args.max_input_packets {
        config.max_input_packets = count;
    }
    if let Some(count) = args.max_output_packets {
        config.max_output_packets = count;
    }
    if args.bitrate.is_some() {
        config.bitrate = args.bitrate;
    }
    if let Some(quantum) = args.pacing_quantum_ms {
        config.pacing_quantum_ms = quantum;
    }
    if args.receive_timeout_ms.is_some() {
        config.receive_timeout_ms = args.receive_timeout_ms;
    }
    if args.ignore_joint_termination {
        config.ignore_joint_termination = true;
    }
    if args.control.is_some() {
        config.control_address = args.control.clone();
    }
    Ok(config)
}
