//! Access to the content of resources loaded by the traced page.

use std::sync::Arc;

use async_trait::async_trait;
use devassist_core::error::FunctionError;
use tokio_util::sync::CancellationToken;

use crate::trace::TraceModel;

/// Host-side resource fetching.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    /// Content for `url`, or `Ok(None)` if the host does not know it.
    async fn load(&self, url: &str, cancel: &CancellationToken) -> Result<Option<String>, FunctionError>;
}

/// Serves the resource contents captured in the trace file.
pub struct TraceResourceLoader {
    model: Arc<TraceModel>,
}

impl TraceResourceLoader {
    pub fn new(model: Arc<TraceModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ResourceLoader for TraceResourceLoader {
    async fn load(&self, url: &str, cancel: &CancellationToken) -> Result<Option<String>, FunctionError> {
        if cancel.is_cancelled() {
            return Err(FunctionError::Cancelled(url.to_string()));
        }
        Ok(self.model.resources.get(url).cloned())
    }
}
