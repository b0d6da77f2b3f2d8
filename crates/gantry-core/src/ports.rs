//! Port traits.
//!
//! These traits define the interfaces between the orchestration core and its adapters.

use crate::Result;
use crate::events::Event;
use async_trait::async_trait;

/// Sink for lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;
}
