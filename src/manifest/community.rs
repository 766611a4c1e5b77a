//! Louvain community detection.
//!
//! Standard modularity maximization at resolution 1.0 over the undirected
//! weight projection: repeated local moving followed by graph aggregation,
//! until a level produces no moves. Labels are opaque; no ground-truth
//! ordering is required, so the greedy method is acceptable. The
//! implementation is fully deterministic: nodes are visited in index order
//! and candidate communities in label order, with no randomized restarts.

use std::collections::BTreeMap;

/// Result of a community detection run.
#[derive(Debug, Clone)]
pub struct CommunityResult {
    /// Node index to dense community label
    pub assignment: Vec<usize>,
    /// Number of communities
    pub community_count: usize,
    /// Modularity of the final partition on the input graph
    pub modularity: f64,
}

/// Maximum aggregation levels; real graphs converge in two or three.
const MAX_LEVELS: usize = 10;

/// Run Louvain over an undirected weighted adjacency.
///
/// `adj[v]` lists `(neighbor, weight)` with every edge present in both
/// endpoint lists and no self-loops.
pub fn louvain(adj: &[Vec<(usize, f64)>]) -> CommunityResult {
    let n = adj.len();
    if n == 0 {
        return CommunityResult {
            assignment: Vec::new(),
            community_count: 0,
            modularity: 0.0,
        };
    }

    let two_m: f64 = adj
        .iter()
        .map(|nbrs| nbrs.iter().map(|(_, w)| w).sum::<f64>())
        .sum();
    if two_m <= 0.0 {
        // No edges: every node is its own community.
        return CommunityResult {
            assignment: (0..n).collect(),
            community_count: n,
            modularity: 0.0,
        };
    }

    // node -> community on the ORIGINAL graph, refined level by level
    let mut assignment: Vec<usize> = (0..n).collect();

    // Current level's graph: adjacency plus self weight (internal weight,
    // already double-counted so degrees stay consistent).
    let mut level_adj: Vec<Vec<(usize, f64)>> = adj.to_vec();
    let mut level_self: Vec<f64> = vec![0.0; n];

    for _ in 0..MAX_LEVELS {
        let (community, moved) = local_move(&level_adj, &level_self, two_m);
        if !moved {
            break;
        }

        // Dense relabel of this level's communities.
        let mut dense: BTreeMap<usize, usize> = BTreeMap::new();
        for &c in &community {
            let next = dense.len();
            dense.entry(c).or_insert(next);
        }
        let community_dense: Vec<usize> = community.iter().map(|c| dense[c]).collect();

        // Project the original assignment through this level.
        for slot in assignment.iter_mut() {
            *slot = community_dense[*slot];
        }

        // Aggregate into the next level's graph.
        let nc = dense.len();
        if nc == level_adj.len() {
            break; // nothing merged
        }
        let mut next_self = vec![0.0; nc];
        let mut next_weights: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); nc];
        for v in 0..level_adj.len() {
            let cv = community_dense[v];
            next_self[cv] += level_self[v];
            for &(u, w) in &level_adj[v] {
                let cu = community_dense[u];
                if cu == cv {
                    next_self[cv] += w; // both directions sum to 2x internal
                } else {
                    *next_weights[cv].entry(cu).or_insert(0.0) += w;
                }
            }
        }
        level_adj = next_weights
            .into_iter()
            .map(|m| m.into_iter().collect())
            .collect();
        level_self = next_self;
    }

    // Dense relabel of the final assignment, in first-seen order.
    let mut dense: BTreeMap<usize, usize> = BTreeMap::new();
    for &c in &assignment {
        let next = dense.len();
        dense.entry(c).or_insert(next);
    }
    let assignment: Vec<usize> = assignment.iter().map(|c| dense[c]).collect();
    let community_count = dense.len();
    let modularity = modularity(adj, &assignment, two_m);

    CommunityResult {
        assignment,
        community_count,
        modularity,
    }
}

/// One local-moving phase. Returns the community of each node and whether
/// any node moved at all.
fn local_move(
    adj: &[Vec<(usize, f64)>],
    self_w: &[f64],
    two_m: f64,
) -> (Vec<usize>, bool) {
    let n = adj.len();
    let k: Vec<f64> = (0..n)
        .map(|v| self_w[v] + adj[v].iter().map(|(_, w)| w).sum::<f64>())
        .collect();
    let mut community: Vec<usize> = (0..n).collect();
    let mut tot = k.clone();
    let mut moved_ever = false;

    loop {
        let mut moved_this_pass = false;
        for v in 0..n {
            let c_old = community[v];

            // Weight from v to each neighboring community.
            let mut weights_to: BTreeMap<usize, f64> = BTreeMap::new();
            for &(u, w) in &adj[v] {
                *weights_to.entry(community[u]).or_insert(0.0) += w;
            }

            tot[c_old] -= k[v];
            let mut best_c = c_old;
            let mut best_gain =
                weights_to.get(&c_old).copied().unwrap_or(0.0) - tot[c_old] * k[v] / two_m;
            for (&c, &w) in &weights_to {
                if c == c_old {
                    continue;
                }
                let gain = w - tot[c] * k[v] / two_m;
                if gain > best_gain + 1e-12 {
                    best_gain = gain;
                    best_c = c;
                }
            }
            tot[best_c] += k[v];
            if best_c != c_old {
                community[v] = best_c;
                moved_this_pass = true;
                moved_ever = true;
            }
        }
        if !moved_this_pass {
            break;
        }
    }
    (community, moved_ever)
}

/// Modularity of a partition over the original adjacency.
fn modularity(adj: &[Vec<(usize, f64)>], assignment: &[usize], two_m: f64) -> f64 {
    let community_count = assignment.iter().copied().max().map_or(0, |m| m + 1);
    let mut internal = vec![0.0; community_count]; // double-counted
    let mut tot = vec![0.0; community_count];
    for (v, nbrs) in adj.iter().enumerate() {
        let cv = assignment[v];
        for &(u, w) in nbrs {
            tot[cv] += w;
            if assignment[u] == cv {
                internal[cv] += w;
            }
        }
    }
    (0..community_count)
        .map(|c| internal[c] / two_m - (tot[c] / two_m).powi(2))
        .sum()
}
