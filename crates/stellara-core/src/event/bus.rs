//! Broadcast bus for saga lifecycle events.
//!
//! Every run in a process publishes onto one `tokio::sync::broadcast`
//! channel. Observers either take the raw receiver (all runs) or a
//! [`RunEvents`] stream scoped to a single workflow id, which ends after
//! that run's `RunFinished`.

use stellara_types::event::SagaEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// Multi-producer, multi-consumer bus for `SagaEvent`s.
///
/// Cloning is cheap and shares the underlying channel. Events published
/// while nobody is subscribed are dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SagaEvent>,
}

impl EventBus {
    /// `capacity` is the number of events a slow subscriber may fall behind
    /// before it starts losing the oldest ones. Clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on, across all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<SagaEvent> {
        self.sender.subscribe()
    }

    /// Receive only the events of one run.
    pub fn subscribe_run(&self, workflow_id: Uuid) -> RunEvents {
        RunEvents {
            workflow_id,
            receiver: self.sender.subscribe(),
            finished: false,
            missed: 0,
        }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: SagaEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Event stream for a single workflow run.
///
/// Skips events from other runs. A lagging receiver skips ahead and counts
/// the loss in [`RunEvents::missed`] instead of failing, so callers
/// watching progress never see an error for falling behind.
#[derive(Debug)]
pub struct RunEvents {
    workflow_id: Uuid,
    receiver: broadcast::Receiver<SagaEvent>,
    finished: bool,
    missed: u64,
}

impl RunEvents {
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Events dropped because this stream fell behind the channel.
    ///
    /// Counts events of all runs, since the channel cannot tell which
    /// ones were lost.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Next event of this run, or `None` once the run has finished or the
    /// bus is gone.
    pub async fn next(&mut self) -> Option<SagaEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.workflow_id() == self.workflow_id => {
                    if matches!(event, SagaEvent::RunFinished { .. }) {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    self.missed += n;
                    tracing::debug!(
                        workflow_id = %self.workflow_id,
                        missed = n,
                        "run event stream lagged"
                    );
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}
