//! Module registry
//!
//! Engine capabilities are packaged as modules with explicit dependencies
//! on each other. The registry computes a deterministic initialization
//! order: dependencies first, lexicographic among modules whose relative
//! order is otherwise unconstrained. Registering the same modules always
//! yields the same order, regardless of registration sequence.

use std::collections::{BTreeMap, BTreeSet};

use veld_core::ModuleId;

use crate::error::{EngineError, EngineResult};

/// One registered module.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub id: ModuleId,
    pub name: String,
    pub dependencies: Vec<String>,
    /// The record types this module's mappers own.
    pub record_types: Vec<String>,
}

/// Registry of engine modules.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module under a unique name, with the record types its
    /// mappers own.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        dependencies: impl IntoIterator<Item = String>,
        record_types: impl IntoIterator<Item = String>,
    ) -> EngineResult<ModuleId> {
        let name = name.into();
        if self.modules.contains_key(&name) {
            return Err(EngineError::DuplicateModule { name });
        }
        let id = ModuleId::new();
        self.modules.insert(
            name.clone(),
            ModuleDescriptor {
                id,
                name,
                dependencies: dependencies.into_iter().collect(),
                record_types: record_types.into_iter().collect(),
            },
        );
        Ok(id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Initialization order: every module after all of its dependencies,
    /// ties broken by name.
    pub fn init_order(&self) -> EngineResult<Vec<&ModuleDescriptor>> {
        for module in self.modules.values() {
            for dependency in &module.dependencies {
                if !self.modules.contains_key(dependency) {
                    return Err(EngineError::UnknownDependency {
                        module: module.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let mut remaining: BTreeSet<&str> = self.modules.keys().map(String::as_str).collect();
        let mut order = Vec::with_capacity(self.modules.len());

        while !remaining.is_empty() {
            // BTreeSet iteration makes the pick lexicographic among the
            // modules whose dependencies are all placed.
            let next = remaining
                .iter()
                .copied()
                .find(|name| {
                    self.modules[*name]
                        .dependencies
                        .iter()
                        .all(|dep| !remaining.contains(dep.as_str()))
                })
                .ok_or_else(|| EngineError::DependencyCycle {
                    module: remaining
                        .iter()
                        .next()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                })?;

            remaining.remove(next);
            order.push(&self.modules[next]);
        }

        Ok(order)
    }
}
