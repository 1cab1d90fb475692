use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BUFFER_SIZE: usize = 512;
pub const DEFAULT_MAX_INPUT_PACKETS: usize = 128;
pub const DEFAULT_MAX_OUTPUT_PACKETS: usize = 128;
pub const DEFAULT_PACING_QUANTUM_MS: u64 = 100;

/// One stage of the chain: plugin name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl StageConfig {
    pub fn new(name: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Packets per inter-stage buffer.
    pub buffer_size: usize,
    /// Largest batch requested from the input plugin.
    pub max_input_packets: usize,
    /// Largest batch handed to the output plugin.
    pub max_output_packets: usize,
    /// Explicit output bitrate in bits/s.
    pub bitrate: Option<u64>,
    pub pacing_quantum_ms: u64,
    /// Abort when the input plugin blocks in `receive` longer than this.
    pub receive_timeout_ms: Option<u64>,
    pub ignore_joint_termination: bool,
    /// `host:port` of the control server; none disables it.
    pub control_address: Option<String>,
    pub input: StageConfig,
    pub processors: Vec<StageConfig>,
    pub output: StageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_input_packets: DEFAULT_MAX_INPUT_PACKETS,
            max_output_packets: DEFAULT_MAX_OUTPUT_PACKETS,
            bitrate: None,
            pacing_quantum_ms: DEFAULT_PACING_QUANTUM_MS,
            receive_timeout_ms: None,
            ignore_joint_termination: false,
            control_address: None,
            input: StageConfig::new("null", &[]),
            processors: Vec::new(),
            output: StageConfig::new("drop", &[]),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {}", path.display(), e))?;
        Self::from_json(&text).map_err(|e| anyhow::anyhow!("{}: {:#}", path.display(), e))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn pacing_quantum(&self) -> Duration {
        Duration::from_millis(self.pacing_quantum_ms.max(1))
    }

    /// Zero disables the timeout like an absent value.
    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Every stage in chain order, input first.
    pub fn stages(&self) -> impl Iterator<Item = &StageConfig> {
        std::iter::once(&self.input)
            .chain(self.processors.iter())
            .chain(std::iter::once(&self.output))
    }

    pub fn stage_count(&self) -> usize {
        self.processors.len() + 2
    }
}
