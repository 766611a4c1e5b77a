/// Spreading-activation recall.
///
/// Retrieval here is deliberately not keyword or vector search: query
/// tokens only pick the seed nodes, then activation spreads over the
/// weighted edge graph and the graph's learned shape decides what else
/// surfaces. The pipeline is pure (it reads the graph and produces a
/// ranked candidate list plus the raw activation map); the engine performs
/// the write-back of energy, access marks, co-activation edges and the
/// session record under its own lock.
///
/// Propagation is additive and non-normalizing: activation gained in one
/// step pushes `a * weight * activation_decay` along outgoing edges on the
/// next, accumulating into the receiving nodes while every node keeps what
/// it already holds. With decay < 1 the frontier mass shrinks
/// geometrically, which bounds the total.
use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::clock::recency;
use crate::error::MemoryResult;
use crate::graph::{Direction, MemoryGraph};
use crate::policy::{Evaluator, PolicyFnName, PolicyStore, Value};
use crate::types::{ItemId, MemoryEdge, RankedItem};

/// Tail size multiplier for the exploration window: the candidates ranked
/// directly below the returned page.
const EXPLORATION_TAIL_FACTOR: usize = 2;

/// Outcome of the pure recall computation.
#[derive(Debug, Clone)]
pub struct RecallOutcome {
    /// Final ranked page, exploration substitution already applied
    pub ranked: Vec<RankedItem>,
    /// Activation per returned item (input to energy write-back)
    pub activations: HashMap<ItemId, f64>,
    /// Whether recallScore evaluation failed and ranking fell back to raw
    /// activation
    pub score_fallback: bool,
    /// Whether exploration evaluation failed
    pub exploration_failed: bool,
}

/// A node of a `trace` subgraph, with its BFS distance from the start.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TraceNode {
    /// Item id
    pub id: ItemId,
    /// Preview of the item text
    pub preview: String,
    /// Hops from the start item
    pub depth: u32,
}

/// Subgraph returned by `trace`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Subgraph {
    /// Visited nodes in BFS order
    pub nodes: Vec<TraceNode>,
    /// Edges between visited nodes
    pub edges: Vec<MemoryEdge>,
}

/// Lowercase alphanumeric tokens of a query.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Lexical seed scores in [0, 1] for every item matching the query.
///
/// Exact substring hits on the text and exact tag matches contribute most;
/// the sum is normalized by the token count so long queries don't dominate.
/// Items with no overlap are absent from the result.
pub fn seed_scores(graph: &MemoryGraph, tokens: &[String]) -> HashMap<ItemId, f64> {
    let mut seeds = HashMap::new();
    if tokens.is_empty() {
        return seeds;
    }
    let max_per_token = 2.5; // substring (1.0) + tag (1.5)
    for item in graph.iter_items() {
        let text = item.text.to_lowercase();
        let tags: Vec<String> = item.tags.iter().map(|t| t.to_lowercase()).collect();
        let mut raw = 0.0;
        for token in tokens {
            if text.contains(token.as_str()) {
                raw += 1.0;
            }
            if tags.iter().any(|t| t == token) {
                raw += 1.5;
            }
        }
        if raw > 0.0 {
            let seed = (raw / (max_per_token * tokens.len() as f64)).min(1.0);
            seeds.insert(item.id.clone(), seed);
        }
    }
    seeds
}

/// Fallback seeds when the query matches nothing: the top-k items by
/// importance scaled by recency.
pub fn fallback_seeds(
    graph: &MemoryGraph,
    now_ms: u64,
    half_life_ms: f64,
    k: usize,
) -> HashMap<ItemId, f64> {
    let mut scored: Vec<(ItemId, f64)> = graph
        .iter_items()
        .map(|item| {
            let r = recency(now_ms, item.last_accessed_at, half_life_ms);
            (item.id.clone(), item.importance * r)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.into_iter().take(k).filter(|(_, s)| *s > 0.0).collect()
}

/// Propagate activation over outgoing edges.
///
/// `initial` maps item id to starting activation. Propagation is
/// frontier-based: each step, activation gained in the previous step (and
/// only that) pushes `a * w * decay` along outgoing edges of nodes above
/// `threshold`, accumulating into a running total that every node keeps.
/// Per-step frontier mass shrinks by at least `decay * fan_out * weight`,
/// so the total is bounded by the seeds times a geometric series.
pub fn propagate(
    graph: &MemoryGraph,
    initial: &HashMap<ItemId, f64>,
    steps: u32,
    decay: f64,
    threshold: f64,
) -> HashMap<ItemId, f64> {
    let mut total = initial.clone();
    let mut frontier = initial.clone();
    for _ in 0..steps {
        // Fixed accumulation order keeps floating-point sums identical
        // across runs and processes, which recall determinism depends on.
        let mut sources: Vec<(&ItemId, f64)> = frontier
            .iter()
            .filter(|(_, a)| **a > threshold)
            .map(|(id, a)| (id, *a))
            .collect();
        sources.sort_by(|a, b| a.0.cmp(b.0));

        let mut next: HashMap<ItemId, f64> = HashMap::new();
        for (id, activation) in sources {
            let mut out = graph.neighbors(id, Direction::Out);
            out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.relation.cmp(&b.1.relation)));
            for (neighbor, edge) in out {
                let contribution = activation * edge.weight * decay;
                if contribution > 0.0 {
                    *next.entry(neighbor).or_insert(0.0) += contribution;
                }
            }
        }
        if next.is_empty() {
            break;
        }
        for (id, contribution) in &next {
            *total.entry(id.clone()).or_insert(0.0) += contribution;
        }
        frontier = next;
    }
    total
}

/// Full recall computation: seed, propagate, rank, explore.
///
/// Pure with respect to the graph; the caller applies write-back. The
/// `score_fallback` / `exploration_failed` flags tell the caller which
/// policy versions to blame.
pub fn recall(
    graph: &MemoryGraph,
    policy: &PolicyStore,
    evaluator: &dyn Evaluator,
    query: &str,
    limit: usize,
    now_ms: u64,
) -> MemoryResult<RecallOutcome> {
    let params = policy.params();
    let half_life_ms = params.half_life_ms();

    // 1. Seed selection
    let tokens = tokenize(query);
    let mut seeds = seed_scores(graph, &tokens);
    if seeds.is_empty() {
        seeds = fallback_seeds(graph, now_ms, half_life_ms, limit.max(1));
    }
    if seeds.is_empty() {
        return Ok(RecallOutcome {
            ranked: Vec::new(),
            activations: HashMap::new(),
            score_fallback: false,
            exploration_failed: false,
        });
    }

    // 2. Initial activation: seed * importance
    let initial: HashMap<ItemId, f64> = seeds
        .into_iter()
        .filter_map(|(id, seed)| {
            graph.get_item(&id).map(|item| (id, seed * item.importance))
        })
        .collect();

    // 3. Propagation
    let activations = propagate(
        graph,
        &initial,
        params.activation_steps,
        params.activation_decay,
        params.activation_threshold,
    );

    // 4. Ranking under the active recallScore expression. A single eval
    // failure flips the whole run to activation-as-score so the ordering
    // stays internally consistent.
    let mut score_fallback = false;
    let mut scored: Vec<(ItemId, f64, f64)> = Vec::with_capacity(activations.len());
    for (id, activation) in activations.iter().filter(|(_, a)| **a > 0.0) {
        let item = match graph.get_item(id) {
            Some(item) => item,
            None => continue,
        };
        let item_recency = recency(now_ms, item.last_accessed_at, half_life_ms);
        let score = if score_fallback {
            *activation
        } else {
            let args = [
                Value::Num(*activation),
                Value::Num(item_recency),
                Value::Num(item.importance),
                Value::Num(item.access_count as f64),
                Value::Num(item.success as f64),
                Value::Num(item.fail as f64),
            ];
            match policy.evaluate(PolicyFnName::RecallScore, &args, evaluator) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "recallScore evaluation failed, ranking by activation");
                    score_fallback = true;
                    *activation
                }
            }
        };
        scored.push((id.clone(), score, item_recency));
    }
    if score_fallback {
        // Re-score everything by activation for a consistent ordering.
        for entry in &mut scored {
            entry.1 = *activations.get(&entry.0).unwrap_or(&0.0);
        }
    }

    // Deterministic ordering: score desc, recency desc, id asc.
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.0.cmp(&b.0))
    });

    // 5. Exploration substitution from the tail window.
    let mut top: Vec<(ItemId, f64)> = scored
        .iter()
        .take(limit)
        .map(|(id, score, _)| (id.clone(), *score))
        .collect();
    let tail: Vec<&(ItemId, f64, f64)> = scored
        .iter()
        .skip(limit)
        .take(EXPLORATION_TAIL_FACTOR * limit)
        .collect();
    let mut exploration_failed = false;
    if !top.is_empty() && !tail.is_empty() {
        let mut tail_activations = Vec::with_capacity(tail.len());
        let mut tail_recencies = Vec::with_capacity(tail.len());
        let mut tail_importances = Vec::with_capacity(tail.len());
        let mut tail_access_counts = Vec::with_capacity(tail.len());
        let mut tail_successes = Vec::with_capacity(tail.len());
        let mut tail_fails = Vec::with_capacity(tail.len());
        for (id, _, item_recency) in &tail {
            tail_activations.push(*activations.get(id).unwrap_or(&0.0));
            tail_recencies.push(*item_recency);
            if let Some(item) = graph.get_item(id) {
                tail_importances.push(item.importance);
                tail_access_counts.push(item.access_count as f64);
                tail_successes.push(item.success as f64);
                tail_fails.push(item.fail as f64);
            } else {
                tail_importances.push(0.0);
                tail_access_counts.push(0.0);
                tail_successes.push(0.0);
                tail_fails.push(0.0);
            }
        }
        let args = [
            Value::Num(limit as f64),
            Value::Num(tail.len() as f64),
            Value::Vec(tail_activations),
            Value::Vec(tail_recencies),
            Value::Vec(tail_importances),
            Value::Vec(tail_access_counts),
            Value::Vec(tail_successes),
            Value::Vec(tail_fails),
        ];
        match policy.evaluate(PolicyFnName::Exploration, &args, evaluator) {
            Ok(k) if k >= 0.0 && (k as usize) < tail.len() => {
                let (id, score, _) = tail[k as usize];
                debug!(substitute = %id, "exploration substitution");
                let last = top.len() - 1;
                top[last] = (id.clone(), *score);
            }
            Ok(_) => {} // -1 or out of range: no substitution
            Err(e) => {
                warn!(error = %e, "exploration evaluation failed");
                exploration_failed = true;
            }
        }
    }

    // 7. Emit previews only.
    let ranked: Vec<RankedItem> = top
        .iter()
        .filter_map(|(id, score)| {
            graph.get_item(id).map(|item| RankedItem {
                id: id.clone(),
                score: *score,
                item_type: item.item_type.clone(),
                preview: item.preview(),
                importance: item.importance,
                tags: item.tags.clone(),
            })
        })
        .collect();

    let returned_activations = ranked
        .iter()
        .map(|r| (r.id.clone(), *activations.get(&r.id).unwrap_or(&0.0)))
        .collect();

    Ok(RecallOutcome {
        ranked,
        activations: returned_activations,
        score_fallback,
        exploration_failed,
    })
}

/// Raw activation run over explicit seeds: the diagnostic `activate`
/// operation. No policy involvement, no write-back.
pub fn activate(
    graph: &MemoryGraph,
    seed_ids: &[ItemId],
    steps: u32,
    decay: f64,
    threshold: f64,
) -> Vec<(ItemId, f64)> {
    let initial: HashMap<ItemId, f64> = seed_ids
        .iter()
        .filter(|id| graph.get_item(id).is_some())
        .map(|id| (id.clone(), 1.0))
        .collect();
    let activations = propagate(graph, &initial, steps, decay, threshold);
    let mut out: Vec<(ItemId, f64)> = activations
        .into_iter()
        .filter(|(_, a)| *a > 0.0)
        .collect();
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    out
}

/// Breadth-first subgraph walk from a start item, following edges in both
/// directions up to `depth` hops.
pub fn trace(graph: &MemoryGraph, start: &ItemId, depth: u32) -> Subgraph {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let mut seen: HashSet<ItemId> = HashSet::new();
    let mut seen_edges: HashSet<crate::types::EdgeKey> = HashSet::new();
    let mut queue: VecDeque<(ItemId, u32)> = VecDeque::new();

    if graph.get_item(start).is_none() {
        return Subgraph { nodes, edges };
    }
    seen.insert(start.clone());
    queue.push_back((start.clone(), 0));

    while let Some((id, d)) = queue.pop_front() {
        if let Some(item) = graph.get_item(&id) {
            nodes.push(TraceNode {
                id: id.clone(),
                preview: item.preview(),
                depth: d,
            });
        }
        if d >= depth {
            continue;
        }
        let mut next: Vec<(ItemId, MemoryEdge)> = graph
            .neighbors(&id, Direction::Both)
            .into_iter()
            .map(|(n, e)| (n, e.clone()))
            .collect();
        // Stable expansion order keeps traces reproducible.
        next.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.relation.cmp(&b.1.relation)));
        for (neighbor, edge) in next {
            if seen_edges.insert(edge.key()) {
                edges.push(edge);
            }
            if seen.insert(neighbor.clone()) {
                queue.push_back((neighbor, d + 1));
            }
        }
    }
    Subgraph { nodes, edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ExprEvaluator;
    use crate::types::{ItemType, Ttl};
    use proptest::prelude::*;

    fn fact() -> ItemType {
        ItemType::new(ItemType::FACT).unwrap()
    }

    fn add_item(graph: &mut MemoryGraph, text: &str, importance: f64, tags: &[&str]) -> ItemId {
        graph
            .create_item(
                fact(),
                text,
                tags.iter().map(|t| t.to_string()).collect(),
                importance,
                Ttl::Days30,
                None,
                1_000,
            )
            .unwrap()
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Rust's borrow-checker!"),
            vec!["rust", "s", "borrow", "checker"]
        );
        assert!(tokenize("  ").is_empty());
    }

    #[test]
    fn test_seed_scores_prefer_tag_matches() {
        let mut g = MemoryGraph::new();
        let by_text = add_item(&mut g, "the rust borrow checker", 0.5, &[]);
        let by_tag = add_item(&mut g, "ownership rules", 0.5, &["rust"]);
        let none = add_item(&mut g, "unrelated", 0.5, &[]);
        let seeds = seed_scores(&g, &tokenize("rust"));
        assert!(seeds.contains_key(&by_text));
        assert!(seeds[&by_tag] > seeds[&by_text]);
        assert!(!seeds.contains_key(&none));
    }

    #[test]
    fn test_propagation_retains_source_activation() {
        let mut g = MemoryGraph::new();
        let a = add_item(&mut g, "a", 1.0, &[]);
        let b = add_item(&mut g, "b", 1.0, &[]);
        g.create_or_reinforce_edge(&a, &b, ":relates_to", 0.8, 0, None)
            .unwrap();
        let initial = HashMap::from([(a.clone(), 1.0)]);
        let result = propagate(&g, &initial, 1, 0.5, 0.0);
        assert_eq!(result[&a], 1.0);
        assert!((result[&b] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_propagation_respects_threshold() {
        let mut g = MemoryGraph::new();
        let a = add_item(&mut g, "a", 1.0, &[]);
        let b = add_item(&mut g, "b", 1.0, &[]);
        g.create_or_reinforce_edge(&a, &b, ":relates_to", 1.0, 0, None)
            .unwrap();
        let initial = HashMap::from([(a.clone(), 0.01)]);
        let result = propagate(&g, &initial, 3, 0.9, 0.05);
        assert!(!result.contains_key(&b));
    }

    #[test]
    fn test_recall_spreads_to_associated_item() {
        // Two items, one matches the query, the other is reachable over an
        // edge. Both come back, seed first.
        let mut g = MemoryGraph::new();
        let a = add_item(&mut g, "x marks the spot", 0.9, &[]);
        let b = add_item(&mut g, "y is elsewhere", 0.9, &[]);
        g.create_or_reinforce_edge(&a, &b, ":relates_to", 0.8, 0, None)
            .unwrap();
        let policy = PolicyStore::new(0);
        let evaluator = ExprEvaluator::new();
        let outcome = recall(&g, &policy, &evaluator, "x", 5, 2_000).unwrap();
        let ids: Vec<&str> = outcome.ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str()]);
        assert!(outcome.ranked[0].score > outcome.ranked[1].score);
        assert!(!outcome.score_fallback);
    }

    #[test]
    fn test_recall_empty_graph_returns_empty() {
        let g = MemoryGraph::new();
        let policy = PolicyStore::new(0);
        let evaluator = ExprEvaluator::new();
        let outcome = recall(&g, &policy, &evaluator, "anything", 5, 0).unwrap();
        assert!(outcome.ranked.is_empty());
    }

    #[test]
    fn test_recall_seedless_query_falls_back_to_importance() {
        let mut g = MemoryGraph::new();
        let hi = add_item(&mut g, "alpha", 0.9, &[]);
        let _lo = add_item(&mut g, "beta", 0.1, &[]);
        let policy = PolicyStore::new(0);
        let evaluator = ExprEvaluator::new();
        let outcome = recall(&g, &policy, &evaluator, "zzz-no-match", 1, 2_000).unwrap();
        assert_eq!(outcome.ranked.len(), 1);
        assert_eq!(outcome.ranked[0].id, hi);
    }

    #[test]
    fn test_recall_previews_are_truncated() {
        let mut g = MemoryGraph::new();
        add_item(&mut g, &"query ".repeat(40), 0.9, &[]);
        let policy = PolicyStore::new(0);
        let evaluator = ExprEvaluator::new();
        let outcome = recall(&g, &policy, &evaluator, "query", 5, 2_000).unwrap();
        assert_eq!(outcome.ranked[0].preview.chars().count(), 80);
    }

    #[test]
    fn test_exploration_substitutes_tail_item() {
        let mut g = MemoryGraph::new();
        for i in 0..6 {
            add_item(&mut g, &format!("topic entry {i}"), 0.9 - 0.1 * i as f64, &[]);
        }
        let mut policy = PolicyStore::new(0);
        let evaluator = ExprEvaluator::new();
        // Always pick tail index 0
        policy
            .set_fn(
                PolicyFnName::Exploration,
                "(lambda (limit tail-n activations recencies importances access-counts successes fails) 0)",
                &evaluator,
                0,
            )
            .unwrap();
        let limit = 2;
        let outcome = recall(&g, &policy, &evaluator, "topic", limit, 2_000).unwrap();
        assert_eq!(outcome.ranked.len(), limit);
        // The last slot holds the first tail candidate, not the rank-2 item.
        let plain = {
            let default_policy = PolicyStore::new(0);
            recall(&g, &default_policy, &evaluator, "topic", limit, 2_000).unwrap()
        };
        assert_eq!(outcome.ranked[0].id, plain.ranked[0].id);
        assert_ne!(outcome.ranked[1].id, plain.ranked[1].id);
    }

    #[test]
    fn test_activate_diagnostic_sorted_desc() {
        let mut g = MemoryGraph::new();
        let a = add_item(&mut g, "a", 1.0, &[]);
        let b = add_item(&mut g, "b", 1.0, &[]);
        let c = add_item(&mut g, "c", 1.0, &[]);
        g.create_or_reinforce_edge(&a, &b, ":relates_to", 0.9, 0, None)
            .unwrap();
        g.create_or_reinforce_edge(&b, &c, ":relates_to", 0.9, 0, None)
            .unwrap();
        let out = activate(&g, &[a.clone()], 2, 0.5, 0.0);
        assert_eq!(out[0].0, a);
        assert_eq!(out.len(), 3);
        assert!(out[1].1 > out[2].1);
    }

    #[test]
    fn test_trace_depth_limit() {
        let mut g = MemoryGraph::new();
        let a = add_item(&mut g, "a", 1.0, &[]);
        let b = add_item(&mut g, "b", 1.0, &[]);
        let c = add_item(&mut g, "c", 1.0, &[]);
        g.create_or_reinforce_edge(&a, &b, ":relates_to", 0.9, 0, None)
            .unwrap();
        g.create_or_reinforce_edge(&b, &c, ":relates_to", 0.9, 0, None)
            .unwrap();
        let shallow = trace(&g, &a, 1);
        assert_eq!(shallow.nodes.len(), 2);
        assert_eq!(shallow.edges.len(), 1);
        let deep = trace(&g, &a, 2);
        assert_eq!(deep.nodes.len(), 3);
        assert_eq!(deep.edges.len(), 2);
    }

    #[test]
    fn test_trace_missing_start_is_empty() {
        let g = MemoryGraph::new();
        let sub = trace(&g, &"ghost".to_string(), 3);
        assert!(sub.nodes.is_empty());
    }

    proptest! {
        /// Total activation mass is bounded by the geometric series of
        /// per-step gain, for any graph decay below 1.
        #[test]
        fn prop_activation_mass_bounded(
            weights in proptest::collection::vec(0.0f64..=1.0, 2..8),
            decay in 0.1f64..0.95,
            steps in 1u32..5,
        ) {
            let mut g = MemoryGraph::new();
            let hub = add_item(&mut g, "hub", 1.0, &[]);
            let mut fan_out = 0usize;
            for (i, w) in weights.iter().enumerate() {
                let spoke = add_item(&mut g, &format!("spoke {i}"), 1.0, &[]);
                if *w > 0.0 {
                    g.create_or_reinforce_edge(&hub, &spoke, ":relates_to", *w, 0, None).unwrap();
                    fan_out += 1;
                }
            }
            let initial = HashMap::from([(hub.clone(), 1.0)]);
            let result = propagate(&g, &initial, steps, decay, 0.0);
            let mass: f64 = result.values().sum();
            // Seed mass 1.0; per-step gain factor <= decay * fan_out * max_weight
            let gain = decay * fan_out as f64;
            let mut bound = 1.0;
            let mut term = 1.0;
            for _ in 0..steps {
                term *= gain.max(1e-9);
                bound += term;
            }
            // Generous epsilon over the analytic bound
            prop_assert!(mass <= bound + 1e-6);
        }
    }
}
