//! Broadcast event bus for workflow lifecycle events.
//!
//! Every engine owns one `EventBus` built on `tokio::sync::broadcast`. Callers
//! either take the raw receiver and see every run, or follow a single run with
//! [`ExecutionEvents`], which drops foreign events and ends once that run
//! pauses or reaches a terminal state.

use stepwise_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive the events of every run, from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Follow one execution. Subscribe before starting or resuming the run
    /// so that no event is missed.
    pub fn subscribe_execution(&self, execution_id: Uuid) -> ExecutionEvents {
        ExecutionEvents {
            execution_id,
            receiver: self.sender.subscribe(),
            finished: false,
        }
    }

    /// Publish an event. Dropped when nobody is subscribed.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Event stream of a single execution.
pub struct ExecutionEvents {
    execution_id: Uuid,
    receiver: broadcast::Receiver<WorkflowEvent>,
    finished: bool,
}

impl ExecutionEvents {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Next event of the followed execution.
    ///
    /// Returns `None` after the event that ends the run (paused, completed,
    /// failed, cancelled) has been delivered, or when the bus is dropped.
    /// Lagging behind the channel skips the lost events with a warning.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.execution_id() == self.execution_id => {
                    self.finished = event.ends_run();
                    return Some(event);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        skipped,
                        "execution event subscriber lagged"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEvents")
            .field("execution_id", &self.execution_id)
            .field("finished", &self.finished)
            .finish()
    }
}
