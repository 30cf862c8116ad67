//! Deployment-kind registry.
//!
//! A layer's `deployment.kind` selects the factory that builds its
//! controller. New kinds are added with [`LayerRegistry::register`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{StackError, StackResult};
use crate::exec::ProcessExecutor;
use crate::graph::LayerDefinition;
use crate::health::HealthOracle;
use crate::source::SourceFetcher;

use super::{CommandLayer, ExternalLayer, LayerController};

/// Collaborators shared by every controller of a run.
#[derive(Clone)]
pub struct LayerServices {
    pub executor: Arc<dyn ProcessExecutor>,
    pub oracle: HealthOracle,
    pub fetcher: Arc<dyn SourceFetcher>,
}

pub type LayerFactory = Arc<
    dyn Fn(&LayerDefinition, &LayerServices) -> StackResult<Box<dyn LayerController>>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct KindEntry {
    requires_source: bool,
    factory: LayerFactory,
}

#[derive(Clone, Default)]
pub struct LayerRegistry {
    kinds: HashMap<String, KindEntry>,
}

impl LayerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `command` and `external` kinds.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            CommandLayer::KIND,
            true,
            Arc::new(|def: &LayerDefinition, services: &LayerServices| {
                Ok(Box::new(CommandLayer::from_definition(def, services)?)
                    as Box<dyn LayerController>)
            }),
        );
        registry.register(
            ExternalLayer::KIND,
            false,
            Arc::new(|def: &LayerDefinition, services: &LayerServices| {
                Ok(Box::new(ExternalLayer::from_definition(def, services)?)
                    as Box<dyn LayerController>)
            }),
        );
        registry
    }

    /// Register (or replace) a kind.
    pub fn register(&mut self, kind: impl Into<String>, requires_source: bool, factory: LayerFactory) {
        self.kinds.insert(
            kind.into(),
            KindEntry {
                requires_source,
                factory,
            },
        );
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Whether layers of `kind` must declare a `source`. Unknown kinds do not.
    pub fn requires_source(&self, kind: &str) -> bool {
        self.kinds.get(kind).is_some_and(|k| k.requires_source)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build the controller for `def`.
    pub fn build(
        &self,
        def: &LayerDefinition,
        services: &LayerServices,
    ) -> StackResult<Box<dyn LayerController>> {
        let entry = self
            .kinds
            .get(&def.deployment.kind)
            .ok_or_else(|| StackError::UnknownKind {
                layer: def.name.clone(),
                kind: def.deployment.kind.clone(),
            })?;
        (entry.factory)(def, services)
    }
}
