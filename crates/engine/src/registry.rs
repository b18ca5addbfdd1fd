//! Engine registry.
//!
//! Holds all configured engine instances, keyed by id. Resolution by prefix
//! (e.g. `"claude:claude-3-opus"` falling back to `"claude"`) lives on
//! `aw_domain::session::ChatState::engine_matches`; the registry itself does
//! plain exact-id lookup plus a default-engine fallback.

use crate::traits::Engine;
use aw_domain::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn Engine>>,
    default_engine: String,
}

impl EngineRegistry {
    pub fn new(default_engine: impl Into<String>) -> Self {
        Self {
            engines: HashMap::new(),
            default_engine: default_engine.into(),
        }
    }

    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        let id = engine.id().to_string();
        tracing::info!(engine_id = %id, "registered engine");
        self.engines.insert(id, engine);
    }

    /// Resolve an engine id, or fall back to the configured default if
    /// `engine_id` is `None`.
    pub fn resolve(&self, engine_id: Option<&str>) -> Result<Arc<dyn Engine>> {
        let id = engine_id.unwrap_or(&self.default_engine);
        self.engines
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownEngine(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Engine>> {
        self.engines.get(id).cloned()
    }

    pub fn default_engine_id(&self) -> &str {
        &self.default_engine
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}
