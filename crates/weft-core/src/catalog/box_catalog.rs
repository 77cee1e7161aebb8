//! BoxToolCatalog -- object-safe dynamic dispatch wrapper for ToolCatalog.
//!
//! 1. Define an object-safe `ToolCatalogDyn` trait with boxed futures
//! 2. Blanket-impl `ToolCatalogDyn` for all `T: ToolCatalog`
//! 3. `BoxToolCatalog` wraps `Arc<dyn ToolCatalogDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{ToolCatalog, ToolError, ToolResponse};

/// Object-safe version of [`ToolCatalog`] with boxed futures.
pub trait ToolCatalogDyn: Send + Sync {
    fn contains(&self, tool_id: &str) -> bool;

    fn invoke_boxed<'a>(
        &'a self,
        tool_id: &'a str,
        params: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<ToolResponse, ToolError>> + Send + 'a>>;
}

impl<T: ToolCatalog> ToolCatalogDyn for T {
    fn contains(&self, tool_id: &str) -> bool {
        ToolCatalog::contains(self, tool_id)
    }

    fn invoke_boxed<'a>(
        &'a self,
        tool_id: &'a str,
        params: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<ToolResponse, ToolError>> + Send + 'a>> {
        Box::pin(self.invoke(tool_id, params))
    }
}

/// Type-erased, cheaply clonable tool catalog.
///
/// Shared by every run of an engine, including nested sub-workflow runs.
#[derive(Clone)]
pub struct BoxToolCatalog {
    inner: Arc<dyn ToolCatalogDyn>,
}

impl BoxToolCatalog {
    pub fn new<T: ToolCatalog + 'static>(catalog: T) -> Self {
        Self {
            inner: Arc::new(catalog),
        }
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.inner.contains(tool_id)
    }

    pub async fn invoke(
        &self,
        tool_id: &str,
        params: &Map<String, Value>,
    ) -> Result<ToolResponse, ToolError> {
        self.inner.invoke_boxed(tool_id, params).await
    }
}

impl std::fmt::Debug for BoxToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxToolCatalog").finish_non_exhaustive()
    }
}
