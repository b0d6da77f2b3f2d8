//! Trigger matching, matrix expansion and run orchestration for Gantry.

pub mod bus;
pub mod concurrency;
pub mod executor;
pub mod matrix;
pub mod orchestrator;
pub mod plan;
pub mod triggers;

pub use bus::{ChannelEventBus, LogEventBus, NoopEventBus};
pub use concurrency::{CancelHandle, ConcurrencyGroups, GroupSlot};
pub use executor::RunExecutor;
pub use matrix::{MatrixExpander, MatrixExpansion, MatrixJob};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use plan::{Planner, RunPlan, WorkflowPlan};
pub use triggers::{TriggerEvent, TriggerMatcher};
