//! # Routing
//!
//! Which stores receive a change, how long the cache keeps it, and which
//! store is authoritative for a refresh.
//!
//! ## Default Routing Matrix
//! ```text
//! ┌────────────┬──────────────────────────────┬────────────────────────────┐
//! │ entity     │ source                       │ targets                    │
//! ├────────────┼──────────────────────────────┼────────────────────────────┤
//! │ knowledge  │ cache                        │ graph, warehouse, vector   │
//! │            │ graph                        │ cache, warehouse           │
//! │            │ warehouse                    │ cache, graph               │
//! │            │ vector                       │ cache                      │
//! │ agent      │ cache                        │ graph, warehouse           │
//! │            │ graph / warehouse            │ cache                      │
//! │ task       │ cache / graph                │ graph|cache, warehouse     │
//! │            │ warehouse                    │ cache                      │
//! │ context    │ cache ↔ warehouse            │                            │
//! │ pattern    │ cache                        │ graph, warehouse           │
//! │            │ graph                        │ cache, warehouse           │
//! │            │ warehouse                    │ cache, graph               │
//! └────────────┴──────────────────────────────┴────────────────────────────┘
//! ```
//! Unknown entity types and unknown sources route nowhere.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::DataSource;

/// Config-file shape of the routing matrix: entity type → source → targets.
pub type RoutingSpec = BTreeMap<String, BTreeMap<String, Vec<DataSource>>>;

// =============================================================================
// Routing Table
// =============================================================================

/// Entity-type × source → target stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<String, BTreeMap<DataSource, Vec<DataSource>>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        use DataSource::*;

        let mut table = RoutingTable::empty();
        table.set_route("knowledge", Cache, vec![Graph, Warehouse, Vector]);
        table.set_route("knowledge", Graph, vec![Cache, Warehouse]);
        table.set_route("knowledge", Warehouse, vec![Cache, Graph]);
        table.set_route("knowledge", Vector, vec![Cache]);

        table.set_route("agent", Cache, vec![Graph, Warehouse]);
        table.set_route("agent", Graph, vec![Cache]);
        table.set_route("agent", Warehouse, vec![Cache]);

        table.set_route("task", Cache, vec![Graph, Warehouse]);
        table.set_route("task", Graph, vec![Cache, Warehouse]);
        table.set_route("task", Warehouse, vec![Cache]);

        table.set_route("context", Cache, vec![Warehouse]);
        table.set_route("context", Warehouse, vec![Cache]);

        table.set_route("pattern", Cache, vec![Graph, Warehouse]);
        table.set_route("pattern", Graph, vec![Cache, Warehouse]);
        table.set_route("pattern", Warehouse, vec![Cache, Graph]);
        table
    }
}

impl RoutingTable {
    /// A table with no routes.
    pub fn empty() -> Self {
        RoutingTable {
            routes: BTreeMap::new(),
        }
    }

    /// Builds a table from its config-file form. Source names accept the
    /// same aliases as [`DataSource`]'s `FromStr`.
    pub fn from_spec(spec: &RoutingSpec) -> Result<Self, crate::error::CoreError> {
        let mut table = RoutingTable::empty();
        for (entity_type, sources) in spec {
            for (source, targets) in sources {
                let source: DataSource = source.parse()?;
                table.set_route(entity_type, source, targets.clone());
            }
        }
        Ok(table)
    }

    /// Config-file form of this table.
    pub fn to_spec(&self) -> RoutingSpec {
        self.routes
            .iter()
            .map(|(entity_type, sources)| {
                let sources = sources
                    .iter()
                    .map(|(source, targets)| (source.to_string(), targets.clone()))
                    .collect();
                (entity_type.clone(), sources)
            })
            .collect()
    }

    /// Replaces the targets for `(entity_type, source)`. A source never
    /// routes to itself and each target appears once.
    pub fn set_route(&mut self, entity_type: &str, source: DataSource, targets: Vec<DataSource>) {
        let mut cleaned: Vec<DataSource> = Vec::with_capacity(targets.len());
        for target in targets {
            if target != source && !cleaned.contains(&target) {
                cleaned.push(target);
            }
        }
        self.routes
            .entry(entity_type.to_string())
            .or_default()
            .insert(source, cleaned);
    }

    /// Target stores for a change of `entity_type` that originated in `source`.
    pub fn targets(&self, entity_type: &str, source: DataSource) -> &[DataSource] {
        self.routes
            .get(entity_type)
            .and_then(|sources| sources.get(&source))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every store that takes part in routing for `entity_type`.
    pub fn routing_set(&self, entity_type: &str) -> Vec<DataSource> {
        let mut set: Vec<DataSource> = Vec::new();
        if let Some(sources) = self.routes.get(entity_type) {
            for (source, targets) in sources {
                set.push(*source);
                set.extend(targets.iter().copied());
            }
        }
        set.sort();
        set.dedup();
        set
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

// =============================================================================
// Cache Rules
// =============================================================================

/// How the cache keeps entities of one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRule {
    pub ttl_seconds: u64,
    /// Invalidate `{type}:*:related:{id}` keys when the entity changes.
    #[serde(default)]
    pub refresh_on_update: bool,
}

/// Per-entity-type cache rules with a fallback TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRules {
    #[serde(default)]
    pub rules: BTreeMap<String, CacheRule>,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_seconds: u64,
}

fn default_cache_ttl() -> u64 {
    3600
}

impl Default for CacheRules {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        let mut rule = |name: &str, ttl_seconds: u64, refresh_on_update: bool| {
            rules.insert(
                name.to_string(),
                CacheRule {
                    ttl_seconds,
                    refresh_on_update,
                },
            );
        };
        rule("knowledge", 3600, true);
        rule("context", 1800, true);
        rule("pattern", 7200, false);
        rule("agent", 300, true);

        CacheRules {
            rules,
            default_ttl_seconds: default_cache_ttl(),
        }
    }
}

impl CacheRules {
    /// The rule for `entity_type`, or the default TTL without invalidation.
    pub fn rule_for(&self, entity_type: &str) -> CacheRule {
        self.rules.get(entity_type).copied().unwrap_or(CacheRule {
            ttl_seconds: self.default_ttl_seconds,
            refresh_on_update: false,
        })
    }

    /// Glob matching the related-entity keys to drop when `entity_id` changes.
    pub fn related_pattern(entity_type: &str, entity_id: &str) -> String {
        format!("{}:*:related:{}", entity_type, entity_id)
    }
}

// =============================================================================
// Authoritative Sources
// =============================================================================

/// Store each entity type is refreshed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeSources {
    #[serde(default)]
    pub by_entity_type: BTreeMap<String, DataSource>,
    #[serde(default = "default_authoritative")]
    pub fallback: DataSource,
}

fn default_authoritative() -> DataSource {
    DataSource::Graph
}

impl Default for AuthoritativeSources {
    fn default() -> Self {
        let by_entity_type = [
            ("knowledge", DataSource::Graph),
            ("agent", DataSource::Graph),
            ("task", DataSource::Graph),
            ("context", DataSource::Warehouse),
            ("pattern", DataSource::Warehouse),
        ]
        .into_iter()
        .map(|(t, s)| (t.to_string(), s))
        .collect();

        AuthoritativeSources {
            by_entity_type,
            fallback: default_authoritative(),
        }
    }
}

impl AuthoritativeSources {
    pub fn for_entity_type(&self, entity_type: &str) -> DataSource {
        self.by_entity_type
            .get(entity_type)
            .copied()
            .unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DataSource::*;

    #[test]
    fn test_default_routes() {
        let table = RoutingTable::default();
        assert_eq!(table.targets("knowledge", Cache), &[Graph, Warehouse, Vector]);
        assert_eq!(table.targets("context", Warehouse), &[Cache]);
        assert!(table.targets("context", Graph).is_empty());
        assert!(table.targets("unknown", Cache).is_empty());
    }

    #[test]
    fn test_routing_set() {
        let table = RoutingTable::default();
        assert_eq!(table.routing_set("context"), vec![Cache, Warehouse]);
        assert_eq!(
            table.routing_set("knowledge"),
            vec![Cache, Graph, Warehouse, Vector]
        );
    }

    #[test]
    fn test_routing_round_trip_and_self_routes() {
        let mut spec = RoutingSpec::new();
        spec.entry("note".to_string())
            .or_default()
            .insert("redis".to_string(), vec![Cache, Graph, Graph]);

        let table = RoutingTable::from_spec(&spec).unwrap();
        assert_eq!(table.targets("note", Cache), &[Graph]);
        assert_eq!(table.to_spec()["note"]["cache"], vec![Graph]);

        spec.entry("note".to_string())
            .or_default()
            .insert("mysql".to_string(), vec![Cache]);
        assert!(RoutingTable::from_spec(&spec).is_err());
    }

    #[test]
    fn test_cache_rules() {
        let rules = CacheRules::default();
        assert_eq!(rules.rule_for("agent").ttl_seconds, 300);
        assert!(!rules.rule_for("pattern").refresh_on_update);
        assert_eq!(
            rules.rule_for("other"),
            CacheRule {
                ttl_seconds: 3600,
                refresh_on_update: false
            }
        );
        assert_eq!(
            CacheRules::related_pattern("knowledge", "k1"),
            "knowledge:*:related:k1"
        );
    }

    #[test]
    fn test_authoritative_sources() {
        let sources = AuthoritativeSources::default();
        assert_eq!(sources.for_entity_type("task"), Graph);
        assert_eq!(sources.for_entity_type("pattern"), Warehouse);
        assert_eq!(sources.for_entity_type("misc"), Graph);
    }
}
