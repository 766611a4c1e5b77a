/// Common types used throughout mnemon.
///
/// This module defines the entities of the memory model: labeled text items,
/// directed weighted edges between them, and the record types the engine
/// appends as it operates. Items and edges never hold references to each
/// other; every relation is "id + lookup" so the cyclic graph stays plainly
/// serializable.
use serde::{Deserialize, Serialize};

use crate::clock::DAY_MS;
use crate::error::{MemoryError, MemoryResult};

/// Opaque, stable item identifier.
pub type ItemId = String;

/// Relation used for edges created by co-activation during recall.
pub const CO_ACTIVATED: &str = ":co_activated";

/// Weight below which decayed edges are dropped from the graph.
pub const EDGE_EPSILON: f64 = 0.01;

/// Upper bound on the lifetime of an item.
///
/// TTL is a hard expiry horizon: the decay pass may evict an item earlier,
/// but never keeps it past `created_at + ttl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Ttl {
    /// Seven days
    #[serde(rename = "7d")]
    Days7,
    /// Thirty days
    #[default]
    #[serde(rename = "30d")]
    Days30,
    /// Ninety days
    #[serde(rename = "90d")]
    Days90,
    /// One year
    #[serde(rename = "365d")]
    Days365,
    /// Never expires by age alone
    #[serde(rename = "perpetual")]
    Perpetual,
}

impl Ttl {
    /// Lifetime in milliseconds, or `None` for perpetual items.
    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            Ttl::Days7 => Some(7 * DAY_MS),
            Ttl::Days30 => Some(30 * DAY_MS),
            Ttl::Days90 => Some(90 * DAY_MS),
            Ttl::Days365 => Some(365 * DAY_MS),
            Ttl::Perpetual => None,
        }
    }
}

impl std::fmt::Display for Ttl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ttl::Days7 => write!(f, "7d"),
            Ttl::Days30 => write!(f, "30d"),
            Ttl::Days90 => write!(f, "90d"),
            Ttl::Days365 => write!(f, "365d"),
            Ttl::Perpetual => write!(f, "perpetual"),
        }
    }
}

impl std::str::FromStr for Ttl {
    type Err = MemoryError;

    fn from_str(s: &str) -> MemoryResult<Self> {
        match s {
            "7d" => Ok(Ttl::Days7),
            "30d" => Ok(Ttl::Days30),
            "90d" => Ok(Ttl::Days90),
            "365d" => Ok(Ttl::Days365),
            "perpetual" => Ok(Ttl::Perpetual),
            other => Err(MemoryError::InvalidArgument {
                reason: format!("unknown ttl '{other}' (expected 7d, 30d, 90d, 365d or perpetual)"),
            }),
        }
    }
}

/// The kind label of a memory item.
///
/// The set is open: callers may introduce new kinds at creation time, and a
/// kind is never mutated afterwards. The well-known kinds used by agent
/// integrations are provided as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemType(String);

impl ItemType {
    /// Something that happened at a specific time.
    pub const EVENT: &'static str = "event";
    /// Stable knowledge.
    pub const FACT: &'static str = "fact";
    /// An intended course of action.
    pub const PLAN: &'static str = "plan";
    /// A conclusion drawn from other items.
    pub const REFLECTION: &'static str = "reflection";
    /// A named person, system or thing.
    pub const ENTITY: &'static str = "entity";
    /// A rule the agent tries to follow.
    pub const PRINCIPLE: &'static str = "principle";
    /// How-to knowledge.
    pub const TECHNIQUE: &'static str = "technique";
    /// A known failure mode.
    pub const WARNING: &'static str = "warning";
    /// A multi-step procedure.
    pub const WORKFLOW: &'static str = "workflow";
    /// A link between otherwise distant topics.
    pub const BRIDGE: &'static str = "bridge";
    /// A realization worth keeping.
    pub const INSIGHT: &'static str = "insight";
    /// A recurring structure.
    pub const PATTERN: &'static str = "pattern";
    /// An abstract notion.
    pub const CONCEPT: &'static str = "concept";

    /// Create an item type, rejecting empty labels.
    pub fn new(label: impl Into<String>) -> MemoryResult<Self> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(MemoryError::InvalidArgument {
                reason: "item type must not be empty".to_string(),
            });
        }
        Ok(Self(label))
    }

    /// The label as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored memory item.
///
/// Items are created by `remember` and afterwards mutated only through a
/// small set of paths: recall touches `energy`, `last_accessed_at` and
/// `access_count`; feedback touches `success`/`fail`; explicit policy
/// actions may update `importance`. Text, type, tags, ttl and scope are
/// fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique, stable id
    pub id: ItemId,

    /// Kind label (open set)
    #[serde(rename = "type")]
    pub item_type: ItemType,

    /// UTF-8 payload
    pub text: String,

    /// Short categorization strings
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,

    /// Creation-time weight in [0, 1]
    pub importance: f64,

    /// Accumulated recall energy, >= 0
    pub energy: f64,

    /// Hard lifetime bound
    pub ttl: Ttl,

    /// Optional namespace (e.g. agent identity)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,

    /// When the item was created (epoch ms)
    pub created_at: u64,

    /// When the item was last mutated (epoch ms)
    pub updated_at: u64,

    /// When the item was last returned by recall (epoch ms)
    pub last_accessed_at: u64,

    /// Number of times recall returned this item
    pub access_count: u64,

    /// Positive feedback count
    pub success: u64,

    /// Negative feedback count
    pub fail: u64,
}

impl MemoryItem {
    /// Length of the preview emitted in recall results.
    pub const PREVIEW_CHARS: usize = 80;

    /// First [`Self::PREVIEW_CHARS`] characters of the text.
    pub fn preview(&self) -> String {
        self.text.chars().take(Self::PREVIEW_CHARS).collect()
    }

    /// Whether the item's hard TTL horizon has passed.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.ttl.duration_ms() {
            Some(ms) => now_ms > self.created_at.saturating_add(ms),
            None => false,
        }
    }

    /// Age of the item in milliseconds.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at)
    }
}

/// Key identifying an edge: at most one edge exists per (from, to, relation)
/// triple; repeated association reinforces the existing edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    /// Source item id
    pub from: ItemId,
    /// Target item id
    pub to: ItemId,
    /// Symbolic relation label (open set, e.g. ":relates_to")
    pub relation: String,
}

impl EdgeKey {
    /// Create an edge key.
    pub fn new(
        from: impl Into<ItemId>,
        to: impl Into<ItemId>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relation: relation.into(),
        }
    }
}

/// A directed weighted edge between two items.
///
/// Self-loops and cycles are permitted. Weights stay in [0, 1]; repeated
/// reinforcement approaches 1 asymptotically and passive decay multiplies
/// the weight down until it crosses [`EDGE_EPSILON`] and the edge is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEdge {
    /// Source item id
    pub from: ItemId,
    /// Target item id
    pub to: ItemId,
    /// Symbolic relation label
    pub relation: String,
    /// Strength in [0, 1]
    pub weight: f64,
    /// When the edge was created or last reinforced (epoch ms)
    pub last_reinforced_at: u64,
    /// Optional free-text context recorded at association time
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<String>,
}

impl MemoryEdge {
    /// The key identifying this edge.
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.from.clone(), self.to.clone(), self.relation.clone())
    }
}

/// One entry of a ranked recall result.
///
/// Recall returns previews, not full payloads; callers fetch the complete
/// item via `get_item` when they need it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedItem {
    /// Item id
    pub id: ItemId,
    /// Rank score under the active recallScore policy
    pub score: f64,
    /// Kind label
    #[serde(rename = "type")]
    pub item_type: ItemType,
    /// First 80 characters of the text
    pub preview: String,
    /// Creation-time importance
    pub importance: f64,
    /// Tags
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

/// Append-only operation log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation ran (epoch ms)
    pub at: u64,
    /// Operation name (remember, recall, decay, ...)
    pub op: String,
    /// Compact argument rendering
    pub args: String,
    /// Compact outcome rendering
    pub result_summary: String,
}

impl HistoryEntry {
    /// Create a history entry.
    pub fn new(
        at: u64,
        op: impl Into<String>,
        args: impl Into<String>,
        result_summary: impl Into<String>,
    ) -> Self {
        Self {
            at,
            op: op.into(),
            args: args.into(),
            result_summary: result_summary.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn item(created_at: u64, ttl: Ttl) -> MemoryItem {
        MemoryItem {
            id: "i1".to_string(),
            item_type: ItemType::new(ItemType::FACT).unwrap(),
            text: "x".repeat(200),
            tags: vec![],
            importance: 0.5,
            energy: 0.0,
            ttl,
            scope: None,
            created_at,
            updated_at: created_at,
            last_accessed_at: created_at,
            access_count: 0,
            success: 0,
            fail: 0,
        }
    }

    #[test]
    fn test_ttl_round_trip() {
        for s in ["7d", "30d", "90d", "365d", "perpetual"] {
            assert_eq!(Ttl::from_str(s).unwrap().to_string(), s);
        }
        assert!(Ttl::from_str("14d").is_err());
    }

    #[test]
    fn test_ttl_serde_uses_short_form() {
        let json = serde_json::to_string(&Ttl::Days7).unwrap();
        assert_eq!(json, "\"7d\"");
        let back: Ttl = serde_json::from_str("\"365d\"").unwrap();
        assert_eq!(back, Ttl::Days365);
    }

    #[test]
    fn test_item_type_rejects_empty() {
        assert!(ItemType::new("").is_err());
        assert!(ItemType::new("   ").is_err());
        assert!(ItemType::new("ritual").is_ok());
    }

    #[test]
    fn test_preview_truncates_at_80_chars() {
        let it = item(0, Ttl::Days30);
        assert_eq!(it.preview().chars().count(), MemoryItem::PREVIEW_CHARS);
    }

    #[test]
    fn test_expiry_horizon() {
        let it = item(0, Ttl::Days7);
        assert!(!it.is_expired(7 * DAY_MS));
        assert!(it.is_expired(7 * DAY_MS + 1));
        let forever = item(0, Ttl::Perpetual);
        assert!(!forever.is_expired(u64::MAX));
    }

    #[test]
    fn test_edge_key_identity() {
        let a = EdgeKey::new("x", "y", ":supports");
        let b = EdgeKey::new("x", "y", ":supports");
        let c = EdgeKey::new("y", "x", ":supports");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
