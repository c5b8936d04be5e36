use std::sync::Arc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

/// The most recent state accepted from an admin.
///
/// Empty until the first publish and only ever overwritten afterwards.
#[derive(Clone, Default)]
pub struct LastState {
    inner: Arc<RwLock<Option<Map<String, Value>>>>,
}

impl LastState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the current state, if one has been published.
    pub async fn get(&self) -> Option<Map<String, Value>> {
        self.inner.read().await.clone()
    }

    /// Replaces the stored state.
    pub async fn set(&self, state: Map<String, Value>) {
        *self.inner.write().await = Some(state);
    }

    pub async fn is_set(&self) -> bool {
        self.inner.read().await.is_some()
    }
}
