//! Live trace fan-out over `tokio::sync::broadcast`.
//!
//! Every run started with `WorkflowEngine::run` publishes here. Observers
//! either take the raw receiver or [`EventBus::watch`] a single execution,
//! which filters by execution id and ends after its `RunComplete`.

use futures_util::stream::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use weft_types::event::TraceEvent;

/// Multi-producer, multi-consumer bus of trace events. Clones share the
/// channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TraceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receiver for every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.sender.subscribe()
    }

    /// Events with no subscriber are dropped.
    pub fn publish(&self, event: TraceEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stream of the events of one execution, ending after its
    /// `RunComplete`. Subscribe before starting the run to see it all.
    ///
    /// A slow watcher that falls behind the channel capacity skips the
    /// overwritten events and logs how many were lost.
    pub fn watch(&self, execution_id: impl Into<String>) -> impl Stream<Item = TraceEvent> + Send + 'static {
        let execution_id = execution_id.into();
        let mut receiver = self.sender.subscribe();
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.execution_id() == execution_id => {
                        let done = event.is_run_complete();
                        yield event;
                        if done {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(execution_id = %execution_id, missed, "trace watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;
    use weft_types::graph::BlockType;
    use weft_types::result::{RunStatus, TokenUsage};

    fn started(execution_id: &str, block_id: &str) -> TraceEvent {
        TraceEvent::BlockStarted {
            execution_id: execution_id.to_string(),
            workflow_id: "wf".to_string(),
            block_id: block_id.to_string(),
            block_type: BlockType::Tool,
            iteration: None,
            started_at: Utc::now(),
        }
    }

    fn complete(execution_id: &str) -> TraceEvent {
        TraceEvent::RunComplete {
            execution_id: execution_id.to_string(),
            workflow_id: "wf".to_string(),
            success: true,
            status: RunStatus::Success,
            total_duration_ms: 1,
            total_cost: 0.0,
            total_tokens: TokenUsage::default(),
        }
    }

    #[tokio::test]
    async fn test_watch_filters_one_execution() {
        let bus = EventBus::new(16);
        let watched = bus.watch("run-a");

        bus.publish(started("run-b", "other"));
        bus.publish(started("run-a", "mine"));
        bus.publish(complete("run-b"));
        bus.publish(complete("run-a"));
        bus.publish(started("run-a", "after-complete"));

        let events: Vec<TraceEvent> = watched.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].block_id(), Some("mine"));
        assert!(events[1].is_run_complete());
    }

    #[tokio::test]
    async fn test_watch_survives_lag() {
        let bus = EventBus::new(2);
        let watched = bus.watch("run-a");

        for i in 0..6 {
            bus.publish(started("run-a", &format!("block-{i}")));
        }
        bus.publish(complete("run-a"));

        let events: Vec<TraceEvent> = watched.collect().await;
        assert!(events.last().unwrap().is_run_complete());
        assert!(events.len() <= 2);
    }

    #[tokio::test]
    async fn test_watch_ends_when_bus_dropped() {
        let bus = EventBus::new(4);
        let watched = bus.watch("run-a");
        bus.publish(started("run-a", "only"));
        drop(bus);

        let events: Vec<TraceEvent> = watched.collect().await;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_clones_share_the_channel() {
        let bus = EventBus::new(16);
        let publisher = bus.clone();
        let mut rx = bus.subscribe();

        publisher.publish(started("run-a", "a"));

        assert!(rx.try_recv().is_ok());
        assert_eq!(bus.receiver_count(), 1);
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
