//! Source registry mapping source names to their client and pipeline plan.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_core::{Error, Result, SourceClient};

use crate::plan::PipelinePlan;

struct RegisteredSource {
    client: Arc<dyn SourceClient>,
    plan: Arc<PipelinePlan>,
}

/// Registry of external sources jobs can be created for.
pub struct SourceRegistry {
    sources: HashMap<String, RegisteredSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    /// Register a source under its plan's name. Replaces any existing entry.
    pub fn register(&mut self, plan: PipelinePlan, client: Arc<dyn SourceClient>) {
        self.sources.insert(
            plan.source.clone(),
            RegisteredSource {
                client,
                plan: Arc::new(plan),
            },
        );
    }

    pub fn client(&self, source: &str) -> Result<Arc<dyn SourceClient>> {
        self.sources
            .get(source)
            .map(|s| s.client.clone())
            .ok_or_else(|| Error::Config(format!("No source registered with name: {}", source)))
    }

    pub fn plan(&self, source: &str) -> Result<Arc<PipelinePlan>> {
        self.sources
            .get(source)
            .map(|s| s.plan.clone())
            .ok_or_else(|| Error::Config(format!("No source registered with name: {}", source)))
    }

    pub fn available_sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    /// Run health checks on all registered sources.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (name, source) in &self.sources {
            let healthy = source.client.health_check().await.unwrap_or(false);
            results.insert(name.clone(), healthy);
        }
        results
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
