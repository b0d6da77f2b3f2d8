//! In-process event bus implementations.

use async_trait::async_trait;
use gantry_core::events::Event;
use gantry_core::ports::EventBus;
use gantry_core::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Forwards every event to an unbounded channel.
#[derive(Clone)]
pub struct ChannelEventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| Error::EventBus(format!("Event receiver dropped: {}", e)))
    }
}

/// Renders lifecycle events through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct LogEventBus;

#[async_trait]
impl EventBus for LogEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        match &event {
            Event::WorkflowMatched(p) => {
                info!(workflow = %p.workflow, trigger = %p.trigger, runs = p.run_count, "Workflow matched")
            }
            Event::RunQueued(p) => {
                debug!(run_id = %p.run_id, name = %p.display_name, key = %p.concurrency_key, "Run queued")
            }
            Event::RunStarted(p) => info!(run_id = %p.run_id, name = %p.display_name, "Run started"),
            Event::RunCompleted(p) => info!(
                run_id = %p.run_id,
                name = %p.display_name,
                verdict = %p.verdict,
                exit_code = p.exit_code,
                duration_ms = p.duration_ms,
                "Run completed"
            ),
            Event::RunCancelled(p) => warn!(
                run_id = %p.run_id,
                name = %p.display_name,
                reason = ?p.reason,
                "Run cancelled"
            ),
            Event::StepStarted(p) => debug!(run_id = %p.run_id, step = %p.step_name, "Step started"),
            Event::StepOutput(p) => debug!(run_id = %p.run_id, step = %p.step_name, "{}", p.content),
            Event::StepCompleted(p) => debug!(
                run_id = %p.run_id,
                step = %p.step_name,
                status = ?p.status,
                exit_code = ?p.exit_code,
                "Step completed"
            ),
        }
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Clone, Default)]
pub struct NoopEventBus;

#[async_trait]
impl EventBus for NoopEventBus {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}
