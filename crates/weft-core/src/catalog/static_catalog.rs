//! In-memory tool catalog backed by closures.
//!
//! Scripts tool behaviour (outputs, failures, delays, cost) for tests and
//! embedders. Every invocation is counted, and the peak number of
//! invocations in flight at once is tracked.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};

use super::{ToolCatalog, ToolError, ToolResponse};

type Handler = Arc<dyn Fn(&Map<String, Value>) -> ToolResponse + Send + Sync>;

struct StaticTool {
    handler: Handler,
    delay: Option<Duration>,
}

/// A catalog of closure-backed tools.
#[derive(Default)]
pub struct StaticToolCatalog {
    tools: DashMap<String, StaticTool>,
    invocations: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Decrements the in-flight count when an invocation ends or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StaticToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool that answers immediately.
    pub fn with_tool<F>(self, tool_id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> ToolResponse + Send + Sync + 'static,
    {
        self.register(tool_id.into(), Arc::new(handler), None);
        self
    }

    /// Register a tool that sleeps for `delay` before answering.
    pub fn with_delayed_tool<F>(self, tool_id: impl Into<String>, delay: Duration, handler: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> ToolResponse + Send + Sync + 'static,
    {
        self.register(tool_id.into(), Arc::new(handler), Some(delay));
        self
    }

    fn register(&self, tool_id: String, handler: Handler, delay: Option<Duration>) {
        self.tools.insert(tool_id, StaticTool { handler, delay });
    }

    /// Total invocations across all tools, including unknown ids.
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Shared counter handle, readable after the catalog moved into an engine.
    pub fn invocation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }

    /// Shared handle to the highest number of invocations seen running at
    /// the same time.
    pub fn peak_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }

    fn enter(&self) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(Arc::clone(&self.in_flight))
    }
}

impl ToolCatalog for StaticToolCatalog {
    fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    async fn invoke(
        &self,
        tool_id: &str,
        params: &Map<String, Value>,
    ) -> Result<ToolResponse, ToolError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        // Clone out of the map so no shard lock is held across the sleep.
        let (handler, delay) = match self.tools.get(tool_id) {
            Some(tool) => (Arc::clone(&tool.handler), tool.delay),
            None => return Err(ToolError::UnknownTool(tool_id.to_string())),
        };
        let _running = self.enter();

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(handler(params))
    }
}
