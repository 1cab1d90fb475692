//! Plugin contracts and the registry that builds plugin instances by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, value_parser};
use serde::Serialize;

use crate::error::{PipelineError, StageIoError};
use crate::metadata::{LabelSet, MAX_LABELS};
use crate::packet::{Packet, PacketSlot};
use crate::regulator::BitrateRegulator;
use crate::termination::{StageId, TerminationCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Input,
    Processor,
    Output,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Input => write!(f, "input"),
            StageKind::Processor => write!(f, "processor"),
            StageKind::Output => write!(f, "output"),
        }
    }
}

/// What a processor decided for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Forward, possibly modified.
    Ok,
    /// Consume without forwarding.
    Drop,
    /// Forward a null packet in place of this one.
    Null,
    /// Forward this packet, then end this stage and everything downstream gracefully.
    RequestStop,
    /// Abort the pipeline without forwarding.
    Fatal,
}

/// Execution context handed to every plugin hook.
///
/// Gives a plugin its identity and arguments and the only two upward channels
/// it has: joint termination and bitrate reports.
#[derive(Clone)]
pub struct StageContext {
    index: StageId,
    name: String,
    args: Vec<String>,
    coordinator: Arc<TerminationCoordinator>,
    regulator: Arc<BitrateRegulator>,
}

impl StageContext {
    pub fn new(
        index: StageId,
        name: impl Into<String>,
        args: Vec<String>,
        coordinator: Arc<TerminationCoordinator>,
        regulator: Arc<BitrateRegulator>,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            args,
            coordinator,
            regulator,
        }
    }

    pub fn index(&self) -> StageId {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Makes the pipeline wait for this stage's `signal_done` before draining.
    pub fn join_termination(&self) {
        self.coordinator.join(self.index);
    }

    pub fn signal_done(&self) {
        self.coordinator.signal_done(self.index);
    }

    pub fn is_aborted(&self) -> bool {
        self.coordinator.is_aborted()
    }

    pub fn is_draining(&self) -> bool {
        self.coordinator.is_draining()
    }

    pub(crate) fn set_args(&mut self, args: Vec<String>) {
        self.args = args;
    }
}

impl fmt::Display for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.index)
    }
}

pub trait InputPlugin: Send {
    fn start(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fills the front of `batch` and returns how many slots were filled.
    /// Zero means end of input. Slots arrive with reset metadata.
    ///
    /// A blocking source must return once `ctx.is_draining()` or
    /// `ctx.is_aborted()` turns true; the stage queues the end marker only
    /// after `receive` returns.
    fn receive(
        &mut self,
        batch: &mut [PacketSlot],
        ctx: &StageContext,
    ) -> Result<usize, StageIoError>;

    /// Bitrate the source knows about, if any.
    fn bitrate(&self) -> Option<u64> {
        None
    }

    fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait ProcessorPlugin: Send {
    fn start(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(
        &mut self,
        packet: &mut Packet,
        metadata: &mut crate::metadata::Metadata,
        ctx: &StageContext,
    ) -> Disposition;

    /// Shared options parsed with the plugin's own arguments, see
    /// `plugins::parse_processor_args`.
    fn stage_options(&self) -> StageOptions {
        StageOptions::default()
    }

    fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait OutputPlugin: Send {
    fn start(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn send(&mut self, batch: &[PacketSlot], ctx: &StageContext) -> Result<(), StageIoError>;

    fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One live plugin instance.
pub enum Plugin {
    Input(Box<dyn InputPlugin>),
    Processor(Box<dyn ProcessorPlugin>),
    Output(Box<dyn OutputPlugin>),
}

impl Plugin {
    pub fn kind(&self) -> StageKind {
        match self {
            Plugin::Input(_) => StageKind::Input,
            Plugin::Processor(_) => StageKind::Processor,
            Plugin::Output(_) => StageKind::Output,
        }
    }

    pub fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        match self {
            Plugin::Input(p) => p.start(ctx),
            Plugin::Processor(p) => p.start(ctx),
            Plugin::Output(p) => p.start(ctx),
        }
    }

    pub fn stop(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        match self {
            Plugin::Input(p) => p.stop(ctx),
            Plugin::Processor(p) => p.stop(ctx),
            Plugin::Output(p) => p.stop(ctx),
        }
    }

    pub fn stage_options(&self) -> StageOptions {
        match self {
            Plugin::Processor(p) => p.stage_options(),
            Plugin::Input(_) | Plugin::Output(_) => StageOptions::default(),
        }
    }
}

type InputFactory = Arc<dyn Fn(&[String]) -> anyhow::Result<Box<dyn InputPlugin>> + Send + Sync>;
type ProcessorFactory =
    Arc<dyn Fn(&[String]) -> anyhow::Result<Box<dyn ProcessorPlugin>> + Send + Sync>;
type OutputFactory = Arc<dyn Fn(&[String]) -> anyhow::Result<Box<dyn OutputPlugin>> + Send + Sync>;

/// Builds fresh instances of one plugin from an argument list. Kept by the
/// stage runner so that a restart can build again.
#[derive(Clone)]
pub enum PluginFactory {
    Input(InputFactory),
    Processor(ProcessorFactory),
    Output(OutputFactory),
}

impl PluginFactory {
    pub fn kind(&self) -> StageKind {
        match self {
            PluginFactory::Input(_) => StageKind::Input,
            PluginFactory::Processor(_) => StageKind::Processor,
            PluginFactory::Output(_) => StageKind::Output,
        }
    }

    pub fn create(&self, args: &[String]) -> anyhow::Result<Plugin> {
        Ok(match self {
            PluginFactory::Input(f) => Plugin::Input(f(args)?),
            PluginFactory::Processor(f) => Plugin::Processor(f(args)?),
            PluginFactory::Output(f) => Plugin::Output(f(args)?),
        })
    }
}

/// Plugin name to factory, per stage kind.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<(StageKind, String), PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::plugins::register_builtins(&mut registry);
        registry
    }

    pub fn register_input<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&[String]) -> anyhow::Result<Box<dyn InputPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(
            (StageKind::Input, name.to_string()),
            PluginFactory::Input(Arc::new(factory)),
        );
        self
    }

    pub fn register_processor<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&[String]) -> anyhow::Result<Box<dyn ProcessorPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(
            (StageKind::Processor, name.to_string()),
            PluginFactory::Processor(Arc::new(factory)),
        );
        self
    }

    pub fn register_output<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&[String]) -> anyhow::Result<Box<dyn OutputPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(
            (StageKind::Output, name.to_string()),
            PluginFactory::Output(Arc::new(factory)),
        );
        self
    }

    pub fn factory(&self, kind: StageKind, name: &str) -> Result<PluginFactory, PipelineError> {
        if let Some(factory) = self.factories.get(&(kind, name.to_string())) {
            return Ok(factory.clone());
        }
        if self.factories.keys().any(|(_, n)| n == name) {
            return Err(PipelineError::WrongKind {
                name: name.to_string(),
                expected: kind,
            });
        }
        Err(PipelineError::UnknownPlugin {
            kind,
            name: name.to_string(),
        })
    }

    /// Registered names for one kind, sorted.
    pub fn names(&self, kind: StageKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect();
        names.sort();
        names
    }
}

/// Name of the shared processor option selecting packets by label.
pub const ONLY_LABEL: &str = "only-label";

/// Options every processor accepts next to its own arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOptions {
    /// Processors only see packets carrying one of these labels; empty means all.
    pub only_labels: LabelSet,
}

impl StageOptions {
    /// `--only-label L`, repeatable.
    pub fn arg() -> Arg {
        Arg::new(ONLY_LABEL)
            .long(ONLY_LABEL)
            .value_name("LABEL")
            .action(ArgAction::Append)
            .value_parser(value_parser!(u8).range(0..MAX_LABELS as i64))
            .help("only process packets carrying this label, others pass through")
    }

    pub fn from_matches(matches: &ArgMatches) -> Self {
        let labels: Vec<usize> = matches
            .get_many::<u8>(ONLY_LABEL)
            .into_iter()
            .flatten()
            .map(|label| usize::from(*label))
            .collect();
        Self {
            only_labels: LabelSet::from_labels(&labels),
        }
    }

    pub fn accepts(&self, labels: LabelSet) -> bool {
        self.only_labels.is_empty() || self.only_labels.intersects(labels)
    }
}

#[cfg(test)]
pub(crate) fn test_context(name: &str, coordinator: Arc<TerminationCoordinator>) -> StageContext {
    StageContext::new(
        1,
        name,
        Vec::new(),
        coordinator,
        Arc::new(BitrateRegulator::new(None, std::time::Duration::from_millis(100))),
    )
}

#[cfg(test)]
mod tests {
    use clap::Command;

    use super::*;

    struct Identity;

    impl ProcessorPlugin for Identity {
        fn process(
            &mut self,
            _packet: &mut Packet,
            _metadata: &mut crate::metadata::Metadata,
            _ctx: &StageContext,
        ) -> Disposition {
            Disposition::Ok
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = PluginRegistry::new();
        registry.register_processor("identity", |_| Ok(Box::new(Identity)));

        let factory = registry.factory(StageKind::Processor, "identity").unwrap();
        assert_eq!(factory.kind(), StageKind::Processor);
        assert!(matches!(factory.create(&[]).unwrap(), Plugin::Processor(_)));

        assert!(matches!(
            registry.factory(StageKind::Output, "identity"),
            Err(PipelineError::WrongKind { .. })
        ));
        assert!(matches!(
            registry.factory(StageKind::Processor, "missing"),
            Err(PipelineError::UnknownPlugin { .. })
        ));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.names(StageKind::Input), vec!["file", "null"]);
        assert_eq!(
            registry.names(StageKind::Processor),
            vec!["count", "label", "skip", "until"]
        );
        assert_eq!(registry.names(StageKind::Output), vec!["drop", "file"]);
    }

    #[test]
    fn test_stage_options_from_args() {
        let matches = Command::new("stage")
            .no_binary_name(true)
            .arg(StageOptions::arg())
            .arg(Arg::new("packets").long("packets"))
            .try_get_matches_from(args(&["--only-label", "3", "--packets", "5", "--only-label=7"]))
            .unwrap();
        let options = StageOptions::from_matches(&matches);
        assert!(options.only_labels.test(3));
        assert!(options.only_labels.test(7));
        assert!(options.accepts(LabelSet::from_labels(&[7])));
        assert!(!options.accepts(LabelSet::from_labels(&[1])));
        assert!(StageOptions::default().accepts(LabelSet::empty()));

        let command = Command::new("stage").no_binary_name(true).arg(StageOptions::arg());
        assert!(command.clone().try_get_matches_from(args(&["--only-label"])).is_err());
        assert!(command.clone().try_get_matches_from(args(&["--only-label", "32"])).is_err());
        assert!(command.try_get_matches_from(args(&["--only-label=x"])).is_err());
    }
}
