//! Tool adapters and plug-in registry.
//!
//! Plug-ins are compiled into the binary and looked up by name: tool
//! adapters parameterize external executables (capabilities, lifecycle
//! hooks, version parsing), while flow and target plug-ins mutate the
//! schema when loaded.

use std::collections::BTreeMap;
use std::sync::Arc;

use fab_core::Chip;

use crate::builtins;
use crate::graph;
use crate::FlowError;

/// Adapter for one external tool. `setup` declares the tool's
/// capabilities into the `eda` schema block for the active
/// `arg/step`,`arg/index`; the remaining hooks run around execution.
pub trait ToolAdapter: Send + Sync {
    fn setup(&self, chip: &mut Chip) -> Result<(), FlowError>;

    fn pre_process(&self, _chip: &mut Chip) -> Result<(), FlowError> {
        Ok(())
    }

    fn post_process(&self, _chip: &mut Chip) -> Result<(), FlowError> {
        Ok(())
    }

    /// Extract a version string from the tool's `vswitch` output.
    fn parse_version(&self, _stdout: &str) -> Option<String> {
        None
    }

    /// Extra command line options computed at run time.
    fn runtime_options(&self, _chip: &Chip) -> Vec<String> {
        Vec::new()
    }
}

/// A schema-mutating plug-in (flow, target, pdk, or library module).
pub trait Plugin: Send + Sync {
    fn setup(&self, chip: &mut Chip) -> Result<(), FlowError>;
}

/// Name-keyed plug-in registry shared by the orchestrator and the task
/// runners. Built-in combinator names are reserved and carry no adapter.
pub struct Registry {
    tools: BTreeMap<String, Arc<dyn ToolAdapter>>,
    flows: BTreeMap<String, Arc<dyn Plugin>>,
    targets: BTreeMap<String, Arc<dyn Plugin>>,
}

impl Registry {
    pub fn new() -> Registry {
        let mut registry = Registry {
            tools: BTreeMap::new(),
            flows: BTreeMap::new(),
            targets: BTreeMap::new(),
        };
        registry.register_tool("shell", Arc::new(ShellTool));
        registry.register_flow("quickflow", Arc::new(QuickFlow));
        registry.register_target("quick", Arc::new(QuickTarget));
        registry
    }

    pub fn register_tool(&mut self, name: &str, adapter: Arc<dyn ToolAdapter>) {
        debug_assert!(!builtins::is_builtin(name), "builtin names are reserved");
        self.tools.insert(name.to_string(), adapter);
    }

    pub fn register_flow(&mut self, name: &str, plugin: Arc<dyn Plugin>) {
        self.flows.insert(name.to_string(), plugin);
    }

    pub fn register_target(&mut self, name: &str, plugin: Arc<dyn Plugin>) {
        self.targets.insert(name.to_string(), plugin);
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.tools.get(name).cloned()
    }

    pub fn load_flow(&self, chip: &mut Chip, name: &str) -> Result<(), FlowError> {
        let plugin = self
            .flows
            .get(name)
            .ok_or_else(|| FlowError::UnknownPlugin(name.to_string()))?;
        plugin.setup(chip)
    }

    pub fn load_target(&self, chip: &mut Chip, name: &str) -> Result<(), FlowError> {
        let plugin = self
            .targets
            .get(name)
            .ok_or_else(|| FlowError::UnknownPlugin(name.to_string()))?;
        plugin.setup(chip)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

/// Generic adapter that runs whatever executable and options the schema
/// names for the task. Useful as-is for script-driven steps and as the
/// reference for writing richer adapters.
pub struct ShellTool;

impl ToolAdapter for ShellTool {
    fn setup(&self, chip: &mut Chip) -> Result<(), FlowError> {
        chip.set_clobber(&["eda", "shell", "format"], "json", false);
        Ok(())
    }

    fn parse_version(&self, stdout: &str) -> Option<String> {
        stdout.lines().next().map(|line| line.trim().to_string())
    }
}

/// Two-node demonstration flow: a no-op import feeding one shell step.
struct QuickFlow;

impl Plugin for QuickFlow {
    fn setup(&self, chip: &mut Chip) -> Result<(), FlowError> {
        graph::node(chip, "quickflow", "import", "nop", 0);
        graph::node(chip, "quickflow", "exec", "shell", 0);
        graph::edge(chip, "quickflow", "import", "exec", 0, 0);
        Ok(())
    }
}

/// Target wiring the demonstration flow into a chip.
struct QuickTarget;

impl Plugin for QuickTarget {
    fn setup(&self, chip: &mut Chip) -> Result<(), FlowError> {
        chip.set(&["mode"], "asic");
        chip.set_clobber(&["flow"], "quickflow", false);
        QuickFlow.setup(chip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::new();
        assert!(registry.tool("shell").is_some());
        assert!(registry.tool("yosys").is_none());
    }

    #[test]
    fn test_load_target_builds_flow() {
        let registry = Registry::new();
        let mut chip = Chip::new(Some("top"));
        registry.load_target(&mut chip, "quick").unwrap();

        assert_eq!(chip.get_str(&["flow"]).as_deref(), Some("quickflow"));
        assert_eq!(
            chip.get_str(&["flowgraph", "quickflow", "exec", "0", "tool"]).as_deref(),
            Some("shell")
        );
    }

    #[test]
    fn test_unknown_plugin() {
        let registry = Registry::new();
        let mut chip = Chip::new(None);
        assert!(matches!(
            registry.load_flow(&mut chip, "nonesuch"),
            Err(FlowError::UnknownPlugin(_))
        ));
    }

    #[test]
    fn test_shell_parse_version() {
        let tool = ShellTool;
        assert_eq!(
            tool.parse_version("GNU bash, version 5.1\nmore text").as_deref(),
            Some("GNU bash, version 5.1")
        );
    }
}
