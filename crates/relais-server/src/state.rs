//! Shared request state.

use std::sync::Arc;

use relais_core::Engine;

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The pipeline engine.
    pub engine:  Arc<Engine>,
    /// Shared secret for `X-API-Key` authentication. `None` disables the
    /// authenticated surface entirely (every request is rejected).
    pub api_key: Option<String>,
}

impl AppState {
    /// Build the state for a router.
    #[must_use]
    pub fn new(engine: Arc<Engine>, api_key: Option<String>) -> Self {
        Self { engine, api_key }
    }
}
