/// Memory-about-memory: the manifest generator.
///
/// The manifest is a bounded textual description of the whole store's
/// thematic and topological shape: Louvain communities named by a
/// summarizer, PageRank-weighted importance, temporal activity labels and
/// a topology one-liner. It is regenerated on demand from a cloned
/// snapshot in a background task and served fail-open: readers always get
/// the last good manifest (or a one-line placeholder), never an error and
/// never a torn write.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::DAY_MS;
use crate::types::{ItemId, MemoryEdge, MemoryItem, EDGE_EPSILON};

mod community;
mod keywords;
mod topology;
mod summarizer;

pub use community::{louvain, CommunityResult};
pub use keywords::{extract_keywords, KEYWORDS_PER_COMMUNITY};
pub use summarizer::{
    clip_theme_name, keyword_fallback_name, KeywordSummarizer, Summarizer, ThemeName,
    ThemeRequest, MAX_THEME_WORDS,
};
#[cfg(feature = "http")]
pub use summarizer::HttpSummarizer;
pub use topology::{
    average_clustering, bridges, connected_components, density, largest_component_ratio,
    pagerank, PAGERANK_DAMPING,
};

/// How many themes the description names.
pub const THEME_LIMIT: usize = 5;

/// How many representative previews accompany each naming request.
const PREVIEWS_PER_THEME: usize = 10;

/// Hard cap on the rendered description (~2000 tokens).
pub const MAX_DESCRIPTION_CHARS: usize = 8_000;

/// Default cache TTL.
pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(60);

/// Default number of item changes that invalidates the cache early.
pub const DEFAULT_CHANGE_THRESHOLD: u64 = 100;

/// Activity classification of an item or community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalLabel {
    /// Created within the last 24 hours
    Emerging,
    /// Accessed within the last 7 days
    Active,
    /// Older than 30 days and not recently accessed
    Stable,
    /// Everything else: aging without use
    Decaying,
}

impl std::fmt::Display for TemporalLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemporalLabel::Emerging => write!(f, "emerging"),
            TemporalLabel::Active => write!(f, "active"),
            TemporalLabel::Stable => write!(f, "stable"),
            TemporalLabel::Decaying => write!(f, "decaying"),
        }
    }
}

/// Classify one item's temporal state.
pub fn classify_temporal(item: &MemoryItem, now_ms: u64) -> TemporalLabel {
    let age = item.age_ms(now_ms);
    if age < DAY_MS {
        TemporalLabel::Emerging
    } else if now_ms.saturating_sub(item.last_accessed_at) < 7 * DAY_MS {
        TemporalLabel::Active
    } else if age > 30 * DAY_MS {
        TemporalLabel::Stable
    } else {
        TemporalLabel::Decaying
    }
}

/// One named theme in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeSummary {
    /// Opaque community label
    pub community_id: usize,
    /// Theme name from the summarizer (or keyword fallback)
    pub name: String,
    /// Sum of member PageRank, in [0, 1]
    pub importance: f64,
    /// Number of member items
    pub item_count: usize,
    /// Top keywords
    pub keywords: Vec<String>,
    /// Majority temporal label of members
    pub temporal: TemporalLabel,
    /// Preview of the most recently accessed member
    pub recent_preview: String,
}

/// Graph-level metrics reported in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyReport {
    /// Items in the projection
    pub node_count: usize,
    /// Undirected edges in the projection
    pub edge_count: usize,
    /// Edge density over possible pairs
    pub density: f64,
    /// Average clustering coefficient
    pub avg_clustering: f64,
    /// Modularity of the community partition
    pub modularity: f64,
    /// Fraction of nodes in the largest component
    pub largest_component_ratio: f64,
    /// Bridges whose endpoints lie in different communities
    pub cross_community_bridges: usize,
}

/// A generated manifest plus the inputs that date it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// When generation ran (engine clock, epoch ms)
    pub generated_at: u64,
    /// State change counter at generation time
    pub change_counter: u64,
    /// Named themes, most important first
    pub themes: Vec<ThemeSummary>,
    /// Graph metrics
    pub topology: TopologyReport,
    /// Rendered description served to callers
    pub description: String,
}

/// Immutable clone of the graph taken under the engine lock.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    /// All items
    pub items: Vec<MemoryItem>,
    /// All edges
    pub edges: Vec<MemoryEdge>,
    /// Engine clock at snapshot time
    pub taken_at: u64,
    /// State change counter at snapshot time
    pub change_counter: u64,
}

/// Generate a manifest from a snapshot.
///
/// Pure except for the summarizer call; summarizer failure degrades to
/// keyword-based theme names and never fails the generation.
pub async fn generate(snapshot: &GraphSnapshot, summarizer: &dyn Summarizer) -> Manifest {
    let now_ms = snapshot.taken_at;

    // 1. Projection: ids in sorted order, edges above the drop threshold.
    let mut ids: Vec<&ItemId> = snapshot.items.iter().map(|i| &i.id).collect();
    ids.sort();
    let index: HashMap<&ItemId, usize> =
        ids.iter().enumerate().map(|(n, id)| (*id, n)).collect();
    let items_by_id: HashMap<&ItemId, &MemoryItem> =
        snapshot.items.iter().map(|i| (&i.id, i)).collect();
    let n = ids.len();

    let live_edges: Vec<&MemoryEdge> = snapshot
        .edges
        .iter()
        .filter(|e| {
            e.weight > EDGE_EPSILON
                && index.contains_key(&e.from)
                && index.contains_key(&e.to)
        })
        .collect();

    // Undirected weight projection: merge directions and relations, drop
    // self-loops.
    let mut pair_weights: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    let mut directed: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    for edge in &live_edges {
        let a = index[&edge.from];
        let b = index[&edge.to];
        directed[a].push((b, edge.weight));
        if a != b {
            let key = (a.min(b), a.max(b));
            *pair_weights.entry(key).or_insert(0.0) += edge.weight;
        }
    }
    let mut undirected_weighted: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    let mut undirected: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut bridge_adj: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
    let mut pair_list: Vec<(usize, usize)> = Vec::with_capacity(pair_weights.len());
    for (edge_idx, (&(a, b), &w)) in pair_weights.iter().enumerate() {
        undirected_weighted[a].push((b, w));
        undirected_weighted[b].push((a, w));
        undirected[a].push(b);
        undirected[b].push(a);
        bridge_adj[a].push((b, edge_idx));
        bridge_adj[b].push((a, edge_idx));
        pair_list.push((a, b));
    }

    // 2. Communities.
    let communities = louvain(&undirected_weighted);

    // 3. Centrality.
    let ranks = pagerank(&directed);
    let mut community_importance: HashMap<usize, f64> = HashMap::new();
    let mut community_members: HashMap<usize, Vec<usize>> = HashMap::new();
    for v in 0..n {
        let c = communities.assignment[v];
        *community_importance.entry(c).or_insert(0.0) += ranks.get(v).copied().unwrap_or(0.0);
        community_members.entry(c).or_default().push(v);
    }

    // 6. Temporal labels per item; communities take the majority.
    let temporal: Vec<TemporalLabel> = ids
        .iter()
        .map(|id| classify_temporal(items_by_id[*id], now_ms))
        .collect();

    // Rank communities by importance for the theme list.
    let mut ranked_communities: Vec<(usize, f64)> = community_importance
        .iter()
        .map(|(&c, &imp)| (c, imp))
        .collect();
    ranked_communities.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    let top: Vec<(usize, f64)> = ranked_communities
        .into_iter()
        .take(THEME_LIMIT)
        .collect();

    // 4 + 5. Keywords and theme naming for the top communities.
    let mut requests = Vec::with_capacity(top.len());
    for (c, _) in &top {
        let members = &community_members[c];
        let member_items: Vec<&MemoryItem> =
            members.iter().map(|&v| items_by_id[ids[v]]).collect();
        let kws = extract_keywords(&member_items, KEYWORDS_PER_COMMUNITY);

        // Representatives: most central members first.
        let mut by_rank: Vec<usize> = members.clone();
        by_rank.sort_by(|&a, &b| {
            ranks[b]
                .partial_cmp(&ranks[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ids[a].cmp(ids[b]))
        });
        let previews: Vec<String> = by_rank
            .iter()
            .take(PREVIEWS_PER_THEME)
            .map(|&v| items_by_id[ids[v]].preview())
            .collect();
        requests.push(ThemeRequest {
            community_id: *c,
            keywords: kws,
            previews,
        });
    }

    let names: HashMap<usize, String> = match summarizer.name_themes(&requests).await {
        Ok(named) => named
            .into_iter()
            .map(|t| (t.community_id, clip_theme_name(&t.name)))
            .collect(),
        Err(e) => {
            warn!(error = %e, "summarizer failed, using keyword theme names");
            HashMap::new()
        }
    };

    let mut themes = Vec::with_capacity(top.len());
    for (request, (c, importance)) in requests.iter().zip(top.iter()) {
        let members = &community_members[c];
        let name = names
            .get(c)
            .cloned()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| keyword_fallback_name(&request.keywords));

        // Majority temporal label; ties break toward the more active state.
        let mut counts: BTreeMap<TemporalLabel, usize> = BTreeMap::new();
        let order = [
            TemporalLabel::Emerging,
            TemporalLabel::Active,
            TemporalLabel::Stable,
            TemporalLabel::Decaying,
        ];
        for &v in members {
            *counts.entry(temporal[v]).or_insert(0) += 1;
        }
        let majority = order
            .iter()
            .rev()
            .copied()
            .max_by_key(|l| counts.get(l).copied().unwrap_or(0))
            .unwrap_or(TemporalLabel::Decaying);

        let recent_preview = members
            .iter()
            .map(|&v| items_by_id[ids[v]])
            .max_by_key(|i| (i.last_accessed_at, std::cmp::Reverse(i.id.clone())))
            .map(|i| i.preview())
            .unwrap_or_default();

        themes.push(ThemeSummary {
            community_id: *c,
            name,
            importance: *importance,
            item_count: members.len(),
            keywords: request.keywords.clone(),
            temporal: majority,
            recent_preview,
        });
    }

    // 7 + 8. Topology metrics and cross-community bridges.
    let bridge_edges = bridges(&bridge_adj);
    let cross_community_bridges = bridge_edges
        .iter()
        .filter(|&&e| {
            let (a, b) = pair_list[e];
            communities.assignment[a] != communities.assignment[b]
        })
        .count();
    let topology = TopologyReport {
        node_count: n,
        edge_count: pair_list.len(),
        density: density(n, pair_list.len()),
        avg_clustering: average_clustering(&undirected),
        modularity: communities.modularity,
        largest_component_ratio: largest_component_ratio(&undirected),
        cross_community_bridges,
    };

    // 9. Render, dropping low-importance themes before truncating text.
    let mut activity: BTreeMap<&'static str, usize> = BTreeMap::new();
    for label in &temporal {
        let key = match label {
            TemporalLabel::Emerging => "emerging",
            TemporalLabel::Active => "active",
            TemporalLabel::Stable => "stable",
            TemporalLabel::Decaying => "decaying",
        };
        *activity.entry(key).or_insert(0) += 1;
    }
    let mut kept = themes.clone();
    let mut description = render_description(&kept, &topology, &activity, n);
    while description.chars().count() > MAX_DESCRIPTION_CHARS && kept.len() > 1 {
        kept.pop();
        description = render_description(&kept, &topology, &activity, n);
    }
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        description = description.chars().take(MAX_DESCRIPTION_CHARS).collect();
    }

    debug!(
        items = n,
        communities = communities.community_count,
        themes = themes.len(),
        "manifest generated"
    );

    Manifest {
        generated_at: now_ms,
        change_counter: snapshot.change_counter,
        themes,
        topology,
        description,
    }
}

fn render_description(
    themes: &[ThemeSummary],
    topology: &TopologyReport,
    activity: &BTreeMap<&'static str, usize>,
    item_count: usize,
) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Associative memory: {} items, {} edges, {} themes.",
        item_count,
        topology.edge_count,
        themes.len()
    );
    for (rank, theme) in themes.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. {} [{}] ({} items, importance {:.3}): keywords {}; latest: {:?}",
            rank + 1,
            theme.name,
            theme.temporal,
            theme.item_count,
            theme.importance,
            theme.keywords.join(", "),
            theme.recent_preview,
        );
    }
    let activity_line = activity
        .iter()
        .map(|(label, count)| format!("{count} {label}"))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "Activity: {activity_line}.");
    let _ = writeln!(
        out,
        "Topology: density {:.4}, clustering {:.3}, modularity {:.3}, largest component {:.0}%, {} cross-theme bridges.",
        topology.density,
        topology.avg_clustering,
        topology.modularity,
        topology.largest_component_ratio * 100.0,
        topology.cross_community_bridges,
    );
    out
}

/// Placeholder served before the first successful generation.
pub fn placeholder_description(item_count: usize) -> String {
    format!("Associative memory: {item_count} items; manifest not generated yet.")
}

/// Cached manifest with background regeneration and supersede semantics.
///
/// The cache itself is the only structure shared between the engine task
/// and generation tasks; it is replaced by pointer swap so readers see
/// either the old or the new manifest, never a torn one.
#[derive(Debug)]
pub struct ManifestService {
    ttl_ms: u64,
    change_threshold: u64,
    summarizer: Arc<dyn Summarizer>,
    current: RwLock<Option<Arc<Manifest>>>,
    /// Trigger sequence; a finishing run publishes only if it is still the
    /// newest trigger.
    trigger_seq: AtomicU64,
    /// Completed generations.
    epoch: AtomicU64,
}

impl ManifestService {
    /// Create a service with the given cache policy and summarizer.
    pub fn new(ttl: Duration, change_threshold: u64, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            change_threshold,
            summarizer,
            current: RwLock::new(None),
            trigger_seq: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Completed generation count.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// The cached manifest, if any.
    pub async fn current(&self) -> Option<Arc<Manifest>> {
        self.current.read().await.clone()
    }

    /// Whether the cached manifest is still fresh for the given clock and
    /// change counter.
    pub async fn is_fresh(&self, now_ms: u64, change_counter: u64) -> bool {
        match self.current.read().await.as_ref() {
            Some(m) => {
                now_ms.saturating_sub(m.generated_at) < self.ttl_ms
                    && change_counter.saturating_sub(m.change_counter) < self.change_threshold
            }
            None => false,
        }
    }

    /// Generate from the snapshot and publish, superseding any in-flight
    /// run. Returns the published manifest.
    pub async fn refresh(self: &Arc<Self>, snapshot: GraphSnapshot) -> Arc<Manifest> {
        let seq = self.trigger_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let manifest = Arc::new(generate(&snapshot, self.summarizer.as_ref()).await);
        self.publish(seq, manifest.clone()).await;
        manifest
    }

    /// Kick off a background regeneration; the caller keeps serving the
    /// current manifest meanwhile. A newer trigger supersedes this one.
    pub fn trigger(self: &Arc<Self>, snapshot: GraphSnapshot) {
        let seq = self.trigger_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let manifest = Arc::new(generate(&snapshot, service.summarizer.as_ref()).await);
            service.publish(seq, manifest).await;
        });
    }

    async fn publish(&self, seq: u64, manifest: Arc<Manifest>) {
        if self.trigger_seq.load(Ordering::SeqCst) != seq {
            // A newer trigger superseded this run; discard its result.
            debug!(seq, "manifest generation superseded, discarding");
            return;
        }
        let mut slot = self.current.write().await;
        *slot = Some(manifest);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        info!(epoch = self.epoch(), "manifest published");
    }
}
