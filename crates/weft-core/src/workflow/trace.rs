//! Execution trace emitter.
//!
//! Blocks report their lifecycle to an [`ExecutionTracer`], which stamps
//! execution/workflow ids onto [`TraceEvent`]s, aggregates cost and tokens,
//! and hands events to a [`TraceSink`]. Sinks: the broadcast [`EventBus`]
//! for live observers, [`TraceRecorder`] for replay after completion, an
//! mpsc [`ChannelSink`] for streaming, and [`NoopSink`].

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use weft_types::event::TraceEvent;
use weft_types::graph::{Block, BlockType};
use weft_types::result::{BlockResult, ExecutionResult, TokenUsage};

use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for trace events. Must not block.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

impl TraceSink for EventBus {
    fn emit(&self, event: TraceEvent) {
        self.publish(event);
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TraceSink for NoopSink {
    fn emit(&self, _event: TraceEvent) {}
}

/// Keeps every event in order for replay after the run.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replay the recorded events into another sink.
    pub fn replay(&self, sink: &dyn TraceSink) {
        for event in self.events() {
            sink.emit(event);
        }
    }
}

impl TraceSink for TraceRecorder {
    fn emit(&self, event: TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Forwards events into an unbounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<TraceEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<TraceEvent>) -> Self {
        Self { sender }
    }
}

impl TraceSink for ChannelSink {
    fn emit(&self, event: TraceEvent) {
        let _ = self.sender.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    cost: f64,
    tokens: TokenUsage,
}

/// Per-run event emitter and cost/token accumulator.
///
/// Nested sub-workflow runs get their own tracer sharing the parent's sink;
/// their `RunComplete` is suppressed so only the top-level run emits one.
pub struct ExecutionTracer {
    sink: Arc<dyn TraceSink>,
    execution_id: String,
    workflow_id: String,
    nested: bool,
    started: Instant,
    totals: Mutex<Totals>,
}

impl ExecutionTracer {
    pub fn new(sink: Arc<dyn TraceSink>, execution_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            sink,
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            nested: false,
            started: Instant::now(),
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Tracer for a nested run of `workflow_id`, sharing this tracer's sink.
    pub fn nested(&self, workflow_id: impl Into<String>) -> Self {
        Self {
            nested: true,
            ..Self::new(Arc::clone(&self.sink), self.execution_id.clone(), workflow_id)
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn on_block_start(&self, block: &Block, iteration: Option<usize>, started_at: DateTime<Utc>) {
        tracing::debug!(
            execution_id = %self.execution_id,
            block_id = %block.id,
            block_type = %block.block_type(),
            ?iteration,
            "block started"
        );
        self.sink.emit(TraceEvent::BlockStarted {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            block_id: block.id.clone(),
            block_type: block.block_type(),
            iteration,
            started_at,
        });
    }

    /// Emit the terminal event of a block (success, error, skipped or
    /// cancelled). Leaf block cost and tokens are added to the run totals.
    pub fn on_block_finished(&self, result: &BlockResult, iteration: Option<usize>) {
        match &result.error {
            Some(error) => tracing::debug!(
                execution_id = %self.execution_id,
                block_id = %result.block_id,
                status = %result.status,
                %error,
                "block finished"
            ),
            None => tracing::debug!(
                execution_id = %self.execution_id,
                block_id = %result.block_id,
                status = %result.status,
                "block finished"
            ),
        }

        if counts_toward_totals(result.block_type) {
            let mut totals = self
                .totals
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            totals.cost += result.cost.unwrap_or(0.0);
            totals.tokens += result.tokens.unwrap_or_default();
        }

        self.sink.emit(TraceEvent::BlockFinished {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            block_id: result.block_id.clone(),
            block_type: result.block_type,
            iteration,
            status: result.status,
            started_at: result.started_at,
            ended_at: result.ended_at,
            output: result.output.clone(),
            error: result.error.clone(),
            cost: result.cost,
            tokens: result.tokens,
        });
    }

    /// Cost and tokens accumulated so far.
    pub fn totals(&self) -> (f64, TokenUsage) {
        let totals = self
            .totals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (totals.cost, totals.tokens)
    }

    pub fn on_run_complete(&self, result: &ExecutionResult) {
        if self.nested {
            return;
        }
        tracing::info!(
            execution_id = %self.execution_id,
            workflow_id = %self.workflow_id,
            status = %result.status,
            duration_ms = self.started.elapsed().as_millis() as u64,
            total_cost = result.total_cost,
            "workflow run complete"
        );
        self.sink.emit(TraceEvent::RunComplete {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            success: result.success,
            status: result.status,
            total_duration_ms: result.duration_ms(),
            total_cost: result.total_cost,
            total_tokens: result.total_tokens,
        });
    }
}

/// Containers report the sum of their members, which were already counted.
fn counts_toward_totals(block_type: BlockType) -> bool {
    block_type.is_leaf()
}

impl std::fmt::Debug for ExecutionTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTracer")
            .field("execution_id", &self.execution_id)
            .field("workflow_id", &self.workflow_id)
            .field("nested", &self.nested)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::result::RunStatus;

    fn block(id: &str) -> Block {
        serde_json::from_value(json!({"id": id, "type": "tool", "tool": "echo"})).unwrap()
    }

    fn run_result(cost: f64) -> ExecutionResult {
        ExecutionResult {
            execution_id: "exec".to_string(),
            workflow_id: "wf".to_string(),
            status: RunStatus::Success,
            success: true,
            output: json!(null),
            error: None,
            error_kind: None,
            block_results: Default::default(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            total_cost: cost,
            total_tokens: TokenUsage::default(),
        }
    }

    #[test]
    fn test_totals_count_leaves_only() {
        let recorder = Arc::new(TraceRecorder::new());
        let tracer = ExecutionTracer::new(recorder.clone(), "exec", "wf");

        let tokens = TokenUsage {
            prompt: 3,
            completion: 2,
            total: 5,
        };
        let leaf = BlockResult::success("a", BlockType::Tool, json!(1), Utc::now())
            .with_accounting(Some(0.25), Some(tokens));
        let container = BlockResult::success("l", BlockType::Loop, json!({}), Utc::now())
            .with_accounting(Some(0.25), Some(tokens));

        tracer.on_block_start(&block("a"), None, Utc::now());
        tracer.on_block_finished(&leaf, None);
        tracer.on_block_finished(&container, None);

        let (cost, total_tokens) = tracer.totals();
        assert_eq!(cost, 0.25);
        assert_eq!(total_tokens.total, 5);

        let events = recorder.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.execution_id() == "exec"));
    }

    #[test]
    fn test_nested_tracer_suppresses_run_complete() {
        let recorder = Arc::new(TraceRecorder::new());
        let tracer = ExecutionTracer::new(recorder.clone(), "exec", "parent");
        let nested = tracer.nested("child");

        nested.on_block_start(&block("x"), None, Utc::now());
        nested.on_run_complete(&run_result(1.0));
        tracer.on_run_complete(&run_result(1.0));

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            TraceEvent::BlockStarted { workflow_id, execution_id, .. } => {
                assert_eq!(workflow_id, "child");
                assert_eq!(execution_id, "exec");
            }
            other => panic!("expected block_started, got {other:?}"),
        }
        assert!(events[1].is_run_complete());
    }

    #[test]
    fn test_recorder_replays_into_bus() {
        let recorder = TraceRecorder::new();
        recorder.emit(TraceEvent::BlockStarted {
            execution_id: "exec".to_string(),
            workflow_id: "wf".to_string(),
            block_id: "a".to_string(),
            block_type: BlockType::Tool,
            iteration: None,
            started_at: Utc::now(),
        });

        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        recorder.replay(&bus);
        assert_eq!(rx.try_recv().unwrap().block_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.emit(TraceEvent::RunComplete {
            execution_id: "exec".to_string(),
            workflow_id: "wf".to_string(),
            success: true,
            status: RunStatus::Success,
            total_duration_ms: 0,
            total_cost: 0.0,
            total_tokens: TokenUsage::default(),
        });
        assert!(rx.recv().await.unwrap().is_run_complete());
    }
}
