//! Step execution engine for Gantry.

pub mod actions;
pub mod environments;
pub mod runner;
pub mod shell;

pub use actions::{
    Action, ActionInput, ActionOutput, ActionRunner, BUILTIN_ACTIONS, get_builtin_action,
};
pub use environments::{
    Environment, EnvironmentFactory, HostEnvironment, ScratchEnvironment, WorkspaceMode,
};
pub use runner::{OutputLine, StepContext, StepResult, StepRunner};
pub use shell::ShellRunner;

use std::sync::Arc;

/// The runners a run executor dispatches steps to, in priority order.
pub fn default_runners() -> Vec<Arc<dyn StepRunner>> {
    vec![Arc::new(ActionRunner::new()), Arc::new(ShellRunner::new())]
}
