pub mod buffer;
pub mod config;
pub mod control;
pub mod error;
pub mod metadata;
pub mod packet;
pub mod pcr;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod regulator;
pub mod runner;
pub mod state;
pub mod stats;
pub mod termination;
pub mod watchdog;

pub use config::{PipelineConfig, StageConfig};
pub use control::{ControlCommand, ControlReply, ControlServer};
pub use error::{PipelineError, StageIoError};
pub use metadata::{LabelSet, Metadata, TimeSource};
pub use packet::{PKT_SIZE, Packet, PacketSlot};
pub use pipeline::{Pipeline, RestartArgs};
pub use plugin::{
    Disposition, InputPlugin, OutputPlugin, PluginRegistry, ProcessorPlugin, StageContext,
    StageKind,
};
pub use termination::Outcome;
