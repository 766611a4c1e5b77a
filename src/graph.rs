/// Graph layer: typed items plus directed weighted edges.
///
/// `MemoryGraph` owns every item and edge and is the only code allowed to
/// mutate them, so the structural invariants hold by construction:
///
/// - every edge endpoint references an existing item (edges cascade on
///   item removal),
/// - importance and edge weights stay in [0, 1],
/// - at most one edge exists per (from, to, relation) triple,
/// - counters never decrease.
///
/// Adjacency indexes are derived data: they are skipped during
/// serialization and rebuilt on load.
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MemoryError, MemoryResult};
use crate::types::{EdgeKey, ItemId, ItemType, MemoryEdge, MemoryItem, Ttl, EDGE_EPSILON};

/// Maximum outgoing edges per node. Exceeding the cap evicts the
/// lowest-weight outgoing edge so co-activation growth stays bounded.
pub const MAX_OUT_EDGES: usize = 256;

/// Which incident edges `neighbors` should walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges leaving the item
    Out,
    /// Edges arriving at the item
    In,
    /// Both
    Both,
}

/// The in-memory item/edge store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryGraph {
    /// id -> item, ordered so iteration and serialization are canonical
    items: BTreeMap<ItemId, MemoryItem>,

    /// Edges, serialized as a flat list (struct keys don't survive JSON)
    #[serde(with = "edge_list")]
    edges: HashMap<EdgeKey, MemoryEdge>,

    /// Derived: outgoing edge keys per item
    #[serde(skip)]
    out_index: HashMap<ItemId, HashSet<EdgeKey>>,

    /// Derived: incoming edge keys per item
    #[serde(skip)]
    in_index: HashMap<ItemId, HashSet<EdgeKey>>,
}

impl MemoryGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Create an item and return its generated id.
    ///
    /// Rejects empty text; importance is clamped into [0, 1].
    #[allow(clippy::too_many_arguments)]
    pub fn create_item(
        &mut self,
        item_type: ItemType,
        text: impl Into<String>,
        tags: Vec<String>,
        importance: f64,
        ttl: Ttl,
        scope: Option<String>,
        now_ms: u64,
    ) -> MemoryResult<ItemId> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(MemoryError::InvalidArgument {
                reason: "item text must not be empty".to_string(),
            });
        }
        let id = Uuid::new_v4().to_string();
        let item = MemoryItem {
            id: id.clone(),
            item_type,
            text,
            tags,
            importance: importance.clamp(0.0, 1.0),
            energy: 0.0,
            ttl,
            scope,
            created_at: now_ms,
            updated_at: now_ms,
            last_accessed_at: now_ms,
            access_count: 0,
            success: 0,
            fail: 0,
        };
        self.items.insert(id.clone(), item);
        Ok(id)
    }

    /// Insert a fully-formed item, preserving its id. Used by consolidation
    /// when building a merged item.
    pub fn insert_item(&mut self, item: MemoryItem) {
        self.items.insert(item.id.clone(), item);
    }

    /// Look up an item.
    pub fn get_item(&self, id: &str) -> Option<&MemoryItem> {
        self.items.get(id)
    }

    /// Replace an item's energy (clamped to >= 0).
    pub fn update_item_energy(&mut self, id: &str, new_energy: f64) -> MemoryResult<()> {
        let item = self.item_mut(id)?;
        item.energy = new_energy.max(0.0);
        Ok(())
    }

    /// Mark an item as accessed at the given time.
    pub fn record_access(&mut self, id: &str, at_ms: u64) -> MemoryResult<()> {
        let item = self.item_mut(id)?;
        item.last_accessed_at = at_ms;
        item.access_count += 1;
        Ok(())
    }

    /// Increment an item's success or fail counter.
    pub fn record_feedback(&mut self, id: &str, success: bool, at_ms: u64) -> MemoryResult<()> {
        let item = self.item_mut(id)?;
        if success {
            item.success += 1;
        } else {
            item.fail += 1;
        }
        item.updated_at = at_ms;
        Ok(())
    }

    /// Explicitly update an item's importance (clamped to [0, 1]).
    pub fn update_item_importance(&mut self, id: &str, importance: f64, at_ms: u64) -> MemoryResult<()> {
        let item = self.item_mut(id)?;
        item.importance = importance.clamp(0.0, 1.0);
        item.updated_at = at_ms;
        Ok(())
    }

    /// Create an edge or reinforce an existing one.
    ///
    /// Reinforcement is asymptotic toward 1: `w <- w + delta * (1 - w)`, so
    /// repeated co-activation strengthens without ever saturating past the
    /// bound. A brand-new edge starts at `clamp(delta)`. Returns the
    /// resulting weight.
    pub fn create_or_reinforce_edge(
        &mut self,
        from: &str,
        to: &str,
        relation: &str,
        delta: f64,
        now_ms: u64,
        context: Option<String>,
    ) -> MemoryResult<f64> {
        if !self.items.contains_key(from) || !self.items.contains_key(to) {
            return Err(MemoryError::DanglingEdge {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let delta = delta.clamp(0.0, 1.0);
        let key = EdgeKey::new(from, to, relation);

        if let Some(edge) = self.edges.get_mut(&key) {
            edge.weight = (edge.weight + delta * (1.0 - edge.weight)).clamp(0.0, 1.0);
            edge.last_reinforced_at = now_ms;
            if context.is_some() {
                edge.context = context;
            }
            return Ok(edge.weight);
        }

        // New edge. Enforce the per-node out-degree cap first.
        if self
            .out_index
            .get(from)
            .map(|s| s.len() >= MAX_OUT_EDGES)
            .unwrap_or(false)
        {
            if let Some(weakest) = self.weakest_out_edge(from) {
                debug!(from = %from, evicted = ?weakest, "out-edge cap reached, evicting weakest");
                self.drop_edge(&weakest);
            }
        }

        let edge = MemoryEdge {
            from: from.to_string(),
            to: to.to_string(),
            relation: relation.to_string(),
            weight: delta,
            last_reinforced_at: now_ms,
            context,
        };
        self.index_edge(&key);
        self.edges.insert(key, edge);
        Ok(delta)
    }

    /// Multiply an edge's weight by `factor`, dropping it if the weight
    /// falls below [`EDGE_EPSILON`]. Returns the surviving weight.
    pub fn decay_edge(&mut self, key: &EdgeKey, factor: f64) -> Option<f64> {
        let weight = {
            let edge = self.edges.get_mut(key)?;
            edge.weight = (edge.weight * factor).clamp(0.0, 1.0);
            edge.weight
        };
        if weight < EDGE_EPSILON {
            self.drop_edge(key);
            None
        } else {
            Some(weight)
        }
    }

    /// Apply multiplicative decay to every edge, dropping those that fall
    /// below the epsilon threshold. Returns how many edges were dropped.
    pub fn decay_all_edges(&mut self, factor: f64) -> usize {
        let keys: Vec<EdgeKey> = self.edges.keys().cloned().collect();
        let before = self.edges.len();
        for key in keys {
            self.decay_edge(&key, factor);
        }
        before - self.edges.len()
    }

    /// Incident edges of an item in the requested direction.
    ///
    /// Each entry pairs the neighbor's id with the connecting edge. The
    /// caller must not mutate the graph while holding the result.
    pub fn neighbors(&self, id: &str, direction: Direction) -> Vec<(ItemId, &MemoryEdge)> {
        let mut out = Vec::new();
        if matches!(direction, Direction::Out | Direction::Both) {
            if let Some(keys) = self.out_index.get(id) {
                for key in keys {
                    if let Some(edge) = self.edges.get(key) {
                        out.push((edge.to.clone(), edge));
                    }
                }
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            if let Some(keys) = self.in_index.get(id) {
                for key in keys {
                    if let Some(edge) = self.edges.get(key) {
                        out.push((edge.from.clone(), edge));
                    }
                }
            }
        }
        out
    }

    /// Remove an item together with all incident edges.
    pub fn remove_item(&mut self, id: &str) -> MemoryResult<MemoryItem> {
        let item = self
            .items
            .remove(id)
            .ok_or_else(|| MemoryError::ItemNotFound { id: id.to_string() })?;

        let mut incident: Vec<EdgeKey> = Vec::new();
        if let Some(keys) = self.out_index.get(id) {
            incident.extend(keys.iter().cloned());
        }
        if let Some(keys) = self.in_index.get(id) {
            incident.extend(keys.iter().cloned());
        }
        for key in incident {
            self.drop_edge(&key);
        }
        self.out_index.remove(id);
        self.in_index.remove(id);
        Ok(item)
    }

    /// Iterate all items, optionally filtered.
    ///
    /// Lazy over the underlying map; callers must not mutate while
    /// iterating.
    pub fn iter_items(&self) -> impl Iterator<Item = &MemoryItem> {
        self.items.values()
    }

    /// Iterate all edges.
    pub fn iter_edges(&self) -> impl Iterator<Item = &MemoryEdge> {
        self.edges.values()
    }

    /// Look up an edge by key.
    pub fn get_edge(&self, key: &EdgeKey) -> Option<&MemoryEdge> {
        self.edges.get(key)
    }

    /// Total energy across all items.
    pub fn total_energy(&self) -> f64 {
        self.items.values().map(|i| i.energy).sum()
    }

    /// Rebuild adjacency indexes and repair invariant violations found in a
    /// loaded snapshot. Dangling edges are dropped and out-of-range values
    /// clamped; each repair is returned as a human-readable note.
    pub fn repair(&mut self) -> Vec<String> {
        let mut notes = Vec::new();

        let dangling: Vec<EdgeKey> = self
            .edges
            .values()
            .filter(|e| !self.items.contains_key(&e.from) || !self.items.contains_key(&e.to))
            .map(|e| e.key())
            .collect();
        for key in &dangling {
            self.edges.remove(key);
            notes.push(format!(
                "dropped dangling edge {} -> {} ({})",
                key.from, key.to, key.relation
            ));
        }

        for item in self.items.values_mut() {
            if !(0.0..=1.0).contains(&item.importance) || item.importance.is_nan() {
                notes.push(format!("clamped importance of {}", item.id));
                item.importance = if item.importance.is_nan() {
                    0.0
                } else {
                    item.importance.clamp(0.0, 1.0)
                };
            }
            if item.energy < 0.0 || item.energy.is_nan() {
                notes.push(format!("reset negative energy of {}", item.id));
                item.energy = 0.0;
            }
        }
        for edge in self.edges.values_mut() {
            if !(0.0..=1.0).contains(&edge.weight) || edge.weight.is_nan() {
                notes.push(format!("clamped weight of {} -> {}", edge.from, edge.to));
                edge.weight = if edge.weight.is_nan() {
                    0.0
                } else {
                    edge.weight.clamp(0.0, 1.0)
                };
            }
        }

        self.rebuild_indexes();
        if !notes.is_empty() {
            warn!(repairs = notes.len(), "graph repaired on load");
        }
        notes
    }

    /// Rebuild the adjacency indexes from the edge map.
    pub fn rebuild_indexes(&mut self) {
        self.out_index.clear();
        self.in_index.clear();
        let keys: Vec<EdgeKey> = self.edges.keys().cloned().collect();
        for key in keys {
            self.index_edge(&key);
        }
    }

    fn item_mut(&mut self, id: &str) -> MemoryResult<&mut MemoryItem> {
        self.items
            .get_mut(id)
            .ok_or_else(|| MemoryError::ItemNotFound { id: id.to_string() })
    }

    fn index_edge(&mut self, key: &EdgeKey) {
        self.out_index
            .entry(key.from.clone())
            .or_default()
            .insert(key.clone());
        self.in_index
            .entry(key.to.clone())
            .or_default()
            .insert(key.clone());
    }

    fn drop_edge(&mut self, key: &EdgeKey) {
        self.edges.remove(key);
        if let Some(set) = self.out_index.get_mut(&key.from) {
            set.remove(key);
        }
        if let Some(set) = self.in_index.get_mut(&key.to) {
            set.remove(key);
        }
    }

    fn weakest_out_edge(&self, from: &str) -> Option<EdgeKey> {
        self.out_index.get(from).and_then(|keys| {
            keys.iter()
                .filter_map(|k| self.edges.get(k))
                .min_by(|a, b| {
                    a.weight
                        .partial_cmp(&b.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.to.cmp(&b.to))
                })
                .map(|e| e.key())
        })
    }
}

/// Serialize the edge map as a plain list of edges; keys are reconstructed
/// on deserialize.
mod edge_list {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(
        edges: &HashMap<EdgeKey, MemoryEdge>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut list: Vec<&MemoryEdge> = edges.values().collect();
        list.sort_by(|a, b| {
            (&a.from, &a.to, &a.relation).cmp(&(&b.from, &b.to, &b.relation))
        });
        serializer.collect_seq(list)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<EdgeKey, MemoryEdge>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<MemoryEdge>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|e| (e.key(), e)).collect())
    }
}
