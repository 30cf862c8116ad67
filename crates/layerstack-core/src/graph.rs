//! Layer dependency graph and execution ordering.
//!
//! Layers are nodes of a directed acyclic graph. An edge `A → B` means
//! "B depends on A": A must be processed before B.
//!
//! Ordering uses a depth-first search with three-colour marking. Roots are
//! visited in declaration order and each layer's dependencies in the order
//! they are listed, so identical input always yields the identical order.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::config::RawStackConfig;
use crate::error::{StackError, StackResult};
use crate::source::SourceRef;

/// Opaque deployment descriptor. Only `kind` (and `source`, when present)
/// is interpreted by the engine; `spec` is handed to the kind's factory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentDescriptor {
    pub kind: String,
    pub source: Option<SourceRef>,
    /// The full `deployment` mapping, including `kind` and `source`.
    pub spec: serde_json::Value,
}

/// A validated layer declaration. Immutable for the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerDefinition {
    pub name: String,
    /// Direct prerequisites, de-duplicated, in declaration order.
    pub depends_on: Vec<String>,
    pub enabled: bool,
    pub deployment: DeploymentDescriptor,
    pub config: BTreeMap<String, serde_json::Value>,
}

impl LayerDefinition {
    /// Convenience constructor used by tests and programmatic stacks.
    pub fn new(name: impl Into<String>, kind: impl Into<String>, depends_on: &[&str]) -> Self {
        let kind = kind.into();
        Self {
            name: name.into(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            enabled: true,
            deployment: DeploymentDescriptor {
                spec: serde_json::json!({ "kind": kind }),
                kind,
                source: None,
            },
            config: BTreeMap::new(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Validated layer topology.
#[derive(Debug, Clone)]
pub struct ConfigGraph {
    layers: Vec<LayerDefinition>,
    index: HashMap<String, usize>,
}

impl ConfigGraph {
    /// Validate raw declarations into [`LayerDefinition`]s.
    ///
    /// `requires_source` tells whether a deployment kind needs a `source`
    /// descriptor. Errors name the offending field path.
    pub fn validate(
        raw: &RawStackConfig,
        requires_source: impl Fn(&str) -> bool,
    ) -> StackResult<Vec<LayerDefinition>> {
        let names: HashSet<&str> = raw.layers.iter().map(|(n, _)| n.as_str()).collect();
        let mut defs = Vec::with_capacity(raw.layers.len());

        for (name, layer) in &raw.layers {
            if name.trim().is_empty() {
                return Err(StackError::ConfigValidation {
                    field: "layers".to_string(),
                    reason: "layer names must not be empty".to_string(),
                });
            }
            let field = |suffix: &str| format!("layers.{name}.{suffix}");

            let deployment_yaml =
                layer
                    .deployment
                    .as_ref()
                    .ok_or_else(|| StackError::ConfigValidation {
                        field: field("deployment"),
                        reason: "missing deployment descriptor".to_string(),
                    })?;
            let spec = serde_json::to_value(deployment_yaml).map_err(|e| {
                StackError::ConfigValidation {
                    field: field("deployment"),
                    reason: e.to_string(),
                }
            })?;
            let obj = spec
                .as_object()
                .ok_or_else(|| StackError::ConfigValidation {
                    field: field("deployment"),
                    reason: "deployment descriptor must be a mapping".to_string(),
                })?;

            let kind = obj
                .get("kind")
                .and_then(|k| k.as_str())
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| StackError::ConfigValidation {
                    field: field("deployment.kind"),
                    reason: "missing deployment kind".to_string(),
                })?
                .to_string();

            let source = match obj.get("source") {
                Some(value) => Some(serde_json::from_value::<SourceRef>(value.clone()).map_err(
                    |_| StackError::ConfigValidation {
                        field: field("deployment.source"),
                        reason: "source must be `{ path: ... }` or `{ git: ..., rev: ... }`"
                            .to_string(),
                    },
                )?),
                None if requires_source(&kind) => {
                    return Err(StackError::ConfigValidation {
                        field: field("deployment.source"),
                        reason: format!("kind '{kind}' requires a source descriptor"),
                    });
                }
                None => None,
            };

            let mut depends_on: Vec<String> = Vec::with_capacity(layer.depends_on.len());
            for (i, dep) in layer.depends_on.iter().enumerate() {
                if dep == name {
                    return Err(StackError::CyclicDependency {
                        layer: name.clone(),
                    });
                }
                if !names.contains(dep.as_str()) {
                    return Err(StackError::ConfigValidation {
                        field: field(&format!("depends_on[{i}]")),
                        reason: format!("unknown layer '{dep}'"),
                    });
                }
                if !depends_on.contains(dep) {
                    depends_on.push(dep.clone());
                }
            }

            let mut config = BTreeMap::new();
            for (key, value) in &layer.config {
                let key = key
                    .as_str()
                    .ok_or_else(|| StackError::ConfigValidation {
                        field: field("config"),
                        reason: "config keys must be strings".to_string(),
                    })?
                    .to_string();
                let value =
                    serde_json::to_value(value).map_err(|e| StackError::ConfigValidation {
                        field: field(&format!("config.{key}")),
                        reason: e.to_string(),
                    })?;
                config.insert(key, value);
            }

            defs.push(LayerDefinition {
                name: name.clone(),
                depends_on,
                enabled: layer.enabled,
                deployment: DeploymentDescriptor {
                    kind,
                    source,
                    spec,
                },
                config,
            });
        }

        Ok(defs)
    }

    /// Build the graph. The full declared graph (disabled layers included)
    /// must be acyclic.
    pub fn new(layers: Vec<LayerDefinition>) -> StackResult<Self> {
        let mut index = HashMap::with_capacity(layers.len());
        for (i, def) in layers.iter().enumerate() {
            if index.insert(def.name.clone(), i).is_some() {
                return Err(StackError::ConfigValidation {
                    field: format!("layers.{}", def.name),
                    reason: "duplicate layer name".to_string(),
                });
            }
        }
        for def in &layers {
            for (i, dep) in def.depends_on.iter().enumerate() {
                if !index.contains_key(dep) {
                    return Err(StackError::ConfigValidation {
                        field: format!("layers.{}.depends_on[{i}]", def.name),
                        reason: format!("unknown layer '{dep}'"),
                    });
                }
            }
        }

        let graph = Self { layers, index };
        graph.order_where(|_| true)?;
        Ok(graph)
    }

    /// All layers in declaration order.
    pub fn layers(&self) -> &[LayerDefinition] {
        &self.layers
    }

    pub fn definition(&self, name: &str) -> Option<&LayerDefinition> {
        self.index.get(name).map(|&i| &self.layers[i])
    }

    /// Topological order over the enabled layers, dependencies first.
    pub fn execution_order(&self) -> StackResult<Vec<String>> {
        self.order_where(|def| def.enabled)
    }

    /// Every layer needed to process `targets`: the targets plus all their
    /// transitive dependencies, in global execution order. Empty `targets`
    /// means every enabled layer. A disabled prerequisite of any selected
    /// layer is an error.
    pub fn required_closure(&self, targets: &[String]) -> StackResult<Vec<String>> {
        let mut closure: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&str, &str)> = Vec::new();
        if targets.is_empty() {
            stack.extend(
                self.layers
                    .iter()
                    .filter(|def| def.enabled)
                    .map(|def| (def.name.as_str(), def.name.as_str())),
            );
        }
        for target in targets {
            let def = self
                .definition(target)
                .ok_or_else(|| StackError::UnknownLayer {
                    layer: target.clone(),
                })?;
            if !def.enabled {
                return Err(StackError::DisabledDependency {
                    dependency: target.clone(),
                    required_by: "requested targets".to_string(),
                });
            }
            stack.push((def.name.as_str(), def.name.as_str()));
        }

        while let Some((name, required_by)) = stack.pop() {
            let Some(def) = self.definition(name) else {
                continue;
            };
            if !def.enabled {
                return Err(StackError::DisabledDependency {
                    dependency: name.to_string(),
                    required_by: required_by.to_string(),
                });
            }
            if !closure.insert(def.name.as_str()) {
                continue;
            }
            for dep in &def.depends_on {
                if !closure.contains(dep.as_str()) {
                    stack.push((dep.as_str(), def.name.as_str()));
                }
            }
        }

        Ok(self
            .execution_order()?
            .into_iter()
            .filter(|name| closure.contains(name.as_str()))
            .collect())
    }

    /// Direct dependents of `name` (layers listing it in `depends_on`).
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|def| def.depends_on.iter().any(|d| d == name))
            .map(|def| def.name.as_str())
            .collect()
    }

    /// Transitive prerequisites of `name`, enabled or not, in no particular order.
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self
            .definition(name)
            .map(|d| d.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(def) = self.definition(current) {
                stack.extend(def.depends_on.iter().map(String::as_str));
            }
        }
        let mut ancestors: Vec<&str> = seen.into_iter().collect();
        ancestors.sort_unstable();
        ancestors
    }

    fn order_where(&self, include: impl Fn(&LayerDefinition) -> bool) -> StackResult<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.layers.len()];
        let mut order = Vec::with_capacity(self.layers.len());
        for i in 0..self.layers.len() {
            if include(&self.layers[i]) {
                self.visit(i, &mut marks, &include, &mut order)?;
            }
        }
        Ok(order)
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut [Mark],
        include: &impl Fn(&LayerDefinition) -> bool,
        order: &mut Vec<String>,
    ) -> StackResult<()> {
        match marks[idx] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                return Err(StackError::CyclicDependency {
                    layer: self.layers[idx].name.clone(),
                })
            }
            Mark::Unvisited => {}
        }

        marks[idx] = Mark::InProgress;
        for dep in &self.layers[idx].depends_on {
            let dep_idx = self.index[dep];
            if include(&self.layers[dep_idx]) {
                self.visit(dep_idx, marks, include, order)?;
            }
        }
        marks[idx] = Mark::Done;
        order.push(self.layers[idx].name.clone());
        Ok(())
    }
}
