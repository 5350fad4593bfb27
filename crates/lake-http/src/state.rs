//! Shared handler state

use lake_core::{AgentConfig, QueryService};
use std::sync::Arc;

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
    /// Shared secret expected on every route
    pub token: Arc<str>,
    /// Mount the asynchronous /queries routes
    pub lifecycle_enabled: bool,
}

impl AppState {
    pub fn new(service: Arc<QueryService>, token: impl Into<Arc<str>>) -> Self {
        Self {
            service,
            token: token.into(),
            lifecycle_enabled: true,
        }
    }

    pub fn from_config(service: Arc<QueryService>, config: &AgentConfig) -> Self {
        Self {
            service,
            token: Arc::from(config.token.as_str()),
            lifecycle_enabled: config.query_lifecycle_enabled,
        }
    }

    pub fn with_lifecycle(mut self, enabled: bool) -> Self {
        self.lifecycle_enabled = enabled;
        self
    }
}
