//! Deterministic resource naming
//!
//! Provider-side resources belonging to a managed composite are named
//! `<prefix><logical-name><suffix>`, where the suffix identifies the leaf
//! kind. The scheme is its own inverse: given a resource name and a kind,
//! the logical composite name can be recovered, which is how the engine
//! recognizes composites it manages among unrelated provider resources.

use serde::{Deserialize, Serialize};

use crate::types::LeafKind;

/// Default prefix marking resources as engine-managed.
pub const DEFAULT_NAME_PREFIX: &str = "veld-ecs-";

/// Generates and parses provider resource names for managed composites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNamer {
    prefix: String,
}

impl Default for ResourceNamer {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl ResourceNamer {
    /// Create a namer with a custom prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The prefix marking resources as engine-managed.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The provider-facing name for one leaf of the given composite.
    pub fn leaf_name(&self, kind: LeafKind, logical_name: &str) -> String {
        format!("{}{}{}", self.prefix, logical_name, kind.name_suffix())
    }

    /// Recovers the logical composite name from a provider resource name,
    /// if the name follows this namer's scheme for the given kind.
    ///
    /// Returns `None` for names with the wrong prefix, the wrong suffix, or
    /// an empty logical part.
    pub fn parse_logical<'a>(&self, kind: LeafKind, name: &'a str) -> Option<&'a str> {
        let rest = name.strip_prefix(self.prefix.as_str())?;
        let logical = rest.strip_suffix(kind.name_suffix())?;
        if logical.is_empty() {
            None
        } else {
            Some(logical)
        }
    }

    /// Tries every kind's suffix against the name and returns the first
    /// match in dependency order.
    pub fn parse_any<'a>(&self, name: &'a str) -> Option<(LeafKind, &'a str)> {
        LeafKind::ALL
            .iter()
            .find_map(|kind| self.parse_logical(*kind, name).map(|l| (*kind, l)))
    }
}
