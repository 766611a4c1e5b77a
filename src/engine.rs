/// The memory engine: typed operation surface over the whole system.
///
/// `MemoryEngine` integrates the graph, the policy layer, the activation
/// engine, the manifest service and the snapshot store behind one flat set
/// of operations (`remember`, `recall`, `associate`, `feedback`, the policy
/// ops, `decay`, `consolidate`, `snapshot`, `stats`).
///
/// # Concurrency
///
/// All state mutation is single-writer: every operation runs under one
/// async mutex, which totally orders operations without finer locking. The
/// only work done outside that lock is disk flushing (snapshots are
/// serialized under the lock, flushed outside it, and a save cannot start
/// until the previous flush finished) and manifest generation (a background
/// task over a cloned snapshot that writes only to the manifest cache).
///
/// Cloning a `MemoryEngine` is cheap and shares the underlying state.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activation::{self, RecallOutcome, Subgraph};
use crate::clock::{recency, Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::manifest::{GraphSnapshot, Manifest, ManifestService};
use crate::persistence;
use crate::policy::{
    ExprEvaluator, Evaluator, PolicyFnName, PolicyInfo, PolicyParams, PolicySelection,
    PolicyVersion, SessionRecord, Value, ATTRIBUTION_WINDOW,
};
use crate::state::MemoryState;
use crate::types::{
    HistoryEntry, ItemId, ItemType, MemoryEdge, MemoryItem, RankedItem, Ttl, CO_ACTIVATED,
};

/// Counts and identity returned by `stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Stable memory identity
    pub id: String,
    /// When the memory was created (epoch ms)
    pub born: u64,
    /// Number of items
    pub item_count: usize,
    /// Number of edges
    pub edge_count: usize,
    /// Items per type label
    pub type_counts: BTreeMap<String, usize>,
    /// Sum of item energies
    pub global_energy: f64,
    /// Recall sessions retained for attribution
    pub session_count: usize,
    /// Installed policy versions
    pub policy_version_count: usize,
    /// History entries retained
    pub history_len: usize,
    /// Completed manifest generations
    pub manifest_epoch: u64,
}

/// Outcome of a `decay` pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayReport {
    /// Items evicted (TTL expiry or retention below threshold)
    pub evicted: usize,
    /// Edges dropped below the weight floor
    pub edges_dropped: usize,
}

/// Outcome of a `consolidate` pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidateReport {
    /// Duplicate items merged away
    pub merged: usize,
}

/// Active version of one policy function, as returned by `get-policy-fn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFnInfo {
    /// Function name
    pub name: String,
    /// Active version id
    pub version_id: String,
    /// Expression source
    pub source: String,
}

struct EngineInner {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    evaluator: Arc<dyn Evaluator>,
    manifest: Arc<ManifestService>,
    config: EngineConfig,
    /// Serializes disk flushes; a save waits for the previous flush.
    flush: Mutex<()>,
}

impl std::fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The persistent associative memory engine.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

impl MemoryEngine {
    /// Start with configuration from the environment.
    pub async fn start() -> MemoryResult<Self> {
        Self::start_with_config(EngineConfig::from_env()).await
    }

    /// Start with an explicit configuration and the system clock.
    pub async fn start_with_config(config: EngineConfig) -> MemoryResult<Self> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Start with an injected clock. Tests drive time through this.
    pub async fn start_with_clock(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> MemoryResult<Self> {
        let now = clock.now_ms();
        let evaluator: Arc<dyn Evaluator> =
            Arc::new(ExprEvaluator::with_timeout(config.eval_timeout));
        let manifest = Arc::new(ManifestService::new(
            config.manifest_ttl,
            config.manifest_change_threshold,
            config.build_summarizer(),
        ));

        let mut state = match persistence::load(&config.state_dir, now).await? {
            Some(mut loaded) => {
                let mut notes = loaded.graph.repair();
                notes.extend(loaded.policy.repair());
                if !notes.is_empty() {
                    loaded.push_history(HistoryEntry::new(
                        now,
                        "repair",
                        String::new(),
                        notes.join("; "),
                    ));
                }
                info!(
                    items = loaded.graph.item_count(),
                    edges = loaded.graph.edge_count(),
                    repairs = notes.len(),
                    "state loaded"
                );
                loaded
            }
            None => {
                let mut fresh = MemoryState::new(now);
                if let Some(steps) = config.activation_steps {
                    let mut params = *fresh.policy.params();
                    params.activation_steps = steps;
                    fresh.policy.set_params(params)?;
                }
                info!(dir = %config.state_dir.display(), "initialized fresh state");
                fresh
            }
        };
        state.note_changes(0);

        let engine = Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(state),
                clock,
                evaluator,
                manifest,
                config,
                flush: Mutex::new(()),
            }),
        };
        engine.snapshot().await?;
        Ok(engine)
    }

    // ------------------------------------------------------------------
    // Core operations
    // ------------------------------------------------------------------

    /// Store a new item and return its id.
    pub async fn remember(
        &self,
        type_label: &str,
        text: &str,
        importance: f64,
        ttl: Ttl,
        tags: Vec<String>,
        scope: Option<String>,
    ) -> MemoryResult<ItemId> {
        let item_type = ItemType::new(type_label)?;
        let now = self.now();
        let blob;
        let id;
        {
            let mut state = self.inner.state.lock().await;
            id = state
                .graph
                .create_item(item_type, text, tags, importance, ttl, scope, now)?;
            state.push_history(HistoryEntry::new(
                now,
                "remember",
                format!("type={type_label} ttl={ttl}"),
                format!("id={id}"),
            ));
            state.note_changes(1);
            blob = persistence::encode(&state)?;
        }
        self.flush_blob(blob).await;
        debug!(id = %id, "item remembered");
        Ok(id)
    }

    /// Spreading-activation recall: ranked previews, with write-back.
    ///
    /// Returned items gain energy and an access mark, every returned pair
    /// gets a co-activation edge, and the session is recorded against the
    /// active policy versions.
    pub async fn recall(&self, query: &str, limit: usize) -> MemoryResult<Vec<RankedItem>> {
        if limit == 0 {
            return Err(MemoryError::InvalidArgument {
                reason: "limit must be positive".to_string(),
            });
        }
        let now = self.now();
        let blob;
        let ranked;
        {
            let mut state = self.inner.state.lock().await;
            let outcome: RecallOutcome = activation::recall(
                &state.graph,
                &state.policy,
                self.inner.evaluator.as_ref(),
                query,
                limit,
                now,
            )?;
            if outcome.score_fallback {
                state.policy.record_eval_failure(PolicyFnName::RecallScore);
            }
            if outcome.exploration_failed {
                state.policy.record_eval_failure(PolicyFnName::Exploration);
            }

            // Write-back: energy, access marks, co-activation edges.
            let delta = state.policy.params().reinforce_delta;
            let returned: Vec<ItemId> = outcome.ranked.iter().map(|r| r.id.clone()).collect();
            for id in &returned {
                let activation = *outcome.activations.get(id).unwrap_or(&0.0);
                if let Some(item) = state.graph.get_item(id) {
                    let energy = item.energy + delta * activation;
                    state.graph.update_item_energy(id, energy)?;
                }
                state.graph.record_access(id, now)?;
            }
            for i in 0..returned.len() {
                for j in (i + 1)..returned.len() {
                    let a = &returned[i];
                    let b = &returned[j];
                    let strength = delta
                        * outcome
                            .activations
                            .get(a)
                            .unwrap_or(&0.0)
                            .min(*outcome.activations.get(b).unwrap_or(&0.0));
                    state
                        .graph
                        .create_or_reinforce_edge(a, b, CO_ACTIVATED, strength, now, None)?;
                }
            }

            let selection: PolicySelection = state.policy.active().clone();
            state.push_session(SessionRecord {
                session_id: Uuid::new_v4().to_string(),
                query: query.to_string(),
                at: now,
                returned_ids: returned.clone(),
                policy_versions: selection,
            });
            state.push_history(HistoryEntry::new(
                now,
                "recall",
                format!("query={query:?} limit={limit}"),
                format!("returned={}", returned.len()),
            ));
            state.note_changes(returned.len() as u64);
            blob = persistence::encode(&state)?;
            ranked = outcome.ranked;
        }
        self.flush_blob(blob).await;
        Ok(ranked)
    }

    /// Create or reinforce an edge between two existing items.
    pub async fn associate(
        &self,
        from: &str,
        to: &str,
        relation: &str,
        weight: f64,
        context: Option<String>,
    ) -> MemoryResult<f64> {
        if relation.trim().is_empty() {
            return Err(MemoryError::InvalidArgument {
                reason: "relation must not be empty".to_string(),
            });
        }
        let now = self.now();
        let blob;
        let new_weight;
        {
            let mut state = self.inner.state.lock().await;
            new_weight = state
                .graph
                .create_or_reinforce_edge(from, to, relation, weight, now, context)?;
            state.push_history(HistoryEntry::new(
                now,
                "associate",
                format!("{from} -> {to} {relation}"),
                format!("weight={new_weight:.3}"),
            ));
            state.note_changes(1);
            blob = persistence::encode(&state)?;
        }
        self.flush_blob(blob).await;
        Ok(new_weight)
    }

    /// BFS subgraph around an item. Read-only.
    pub async fn trace(&self, start: &str, depth: u32) -> MemoryResult<Subgraph> {
        let state = self.inner.state.lock().await;
        if state.graph.get_item(start).is_none() {
            return Err(MemoryError::ItemNotFound {
                id: start.to_string(),
            });
        }
        Ok(activation::trace(&state.graph, &start.to_string(), depth))
    }

    /// Raw activation over explicit seeds. Diagnostic; no write-back.
    pub async fn activate(
        &self,
        seed_ids: &[ItemId],
        steps: u32,
        decay: f64,
        threshold: f64,
    ) -> MemoryResult<Vec<(ItemId, f64)>> {
        if !(decay > 0.0 && decay <= 1.0) {
            return Err(MemoryError::InvalidArgument {
                reason: "decay must be in (0, 1]".to_string(),
            });
        }
        if steps > 32 {
            return Err(MemoryError::InvalidArgument {
                reason: "steps must be <= 32".to_string(),
            });
        }
        let state = self.inner.state.lock().await;
        Ok(activation::activate(
            &state.graph,
            seed_ids,
            steps,
            decay,
            threshold,
        ))
    }

    /// Fetch a full item. Returns `None` for unknown ids.
    pub async fn get_item(&self, id: &str) -> Option<MemoryItem> {
        let state = self.inner.state.lock().await;
        state.graph.get_item(id).cloned()
    }

    /// Record success or failure feedback on an item.
    ///
    /// The item's counter is incremented, and every policy version active
    /// in any of the last [`ATTRIBUTION_WINDOW`] sessions that returned the
    /// item is credited or blamed exactly once.
    pub async fn feedback(&self, id: &str, success: bool) -> MemoryResult<()> {
        let now = self.now();
        let blob;
        {
            let mut state = self.inner.state.lock().await;
            state.graph.record_feedback(id, success, now)?;

            let mut versions: HashSet<String> = HashSet::new();
            let mut seen_sessions = 0usize;
            for session in state.recent_sessions.iter().rev() {
                if seen_sessions >= ATTRIBUTION_WINDOW {
                    break;
                }
                if session.returned_ids.iter().any(|r| r == id) {
                    seen_sessions += 1;
                    for version_id in session.policy_versions.ids() {
                        versions.insert(version_id.to_string());
                    }
                }
            }
            state.policy.record_feedback(&versions, success);

            state.push_history(HistoryEntry::new(
                now,
                "feedback",
                format!("id={id} outcome={}", if success { "success" } else { "fail" }),
                format!("versions={}", versions.len()),
            ));
            state.note_changes(1);
            blob = persistence::encode(&state)?;
        }
        self.flush_blob(blob).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Policy operations
    // ------------------------------------------------------------------

    /// Numeric params plus the active version id of each function.
    pub async fn get_policy(&self) -> PolicyInfo {
        let state = self.inner.state.lock().await;
        state.policy.info()
    }

    /// Replace the numeric params.
    pub async fn set_policy(&self, params: PolicyParams) -> MemoryResult<()> {
        let now = self.now();
        let blob;
        {
            let mut state = self.inner.state.lock().await;
            state.policy.set_params(params)?;
            state.push_history(HistoryEntry::new(
                now,
                "set-policy",
                format!(
                    "halfLifeDays={} steps={} decay={} threshold={} delta={}",
                    params.half_life_days,
                    params.activation_steps,
                    params.activation_decay,
                    params.activation_threshold,
                    params.reinforce_delta
                ),
                "ok",
            ));
            blob = persistence::encode(&state)?;
        }
        self.flush_blob(blob).await;
        Ok(())
    }

    /// Active version and source of one policy function.
    pub async fn get_policy_fn(&self, name: &str) -> MemoryResult<PolicyFnInfo> {
        let name: PolicyFnName = name.parse()?;
        let state = self.inner.state.lock().await;
        Ok(PolicyFnInfo {
            name: name.to_string(),
            version_id: state.policy.active().get(name).to_string(),
            source: state.policy.active_source(name).to_string(),
        })
    }

    /// Install an expression as the active version of a function.
    ///
    /// The source is probe-validated before anything changes; an
    /// unparseable or failing expression is rejected with no state change.
    /// Returns the version id (SHA-1 of the source).
    pub async fn set_policy_fn(&self, name: &str, source: &str) -> MemoryResult<String> {
        let name: PolicyFnName = name.parse()?;
        let now = self.now();
        let blob;
        let version_id;
        {
            let mut state = self.inner.state.lock().await;
            version_id =
                state
                    .policy
                    .set_fn(name, source, self.inner.evaluator.as_ref(), now)?;
            state.push_history(HistoryEntry::new(
                now,
                "set-policy-fn",
                format!("name={name}"),
                format!("version={version_id}"),
            ));
            blob = persistence::encode(&state)?;
        }
        self.flush_blob(blob).await;
        Ok(version_id)
    }

    /// All installed policy versions with counters and lineage.
    pub async fn list_policy_versions(&self) -> Vec<PolicyVersion> {
        let state = self.inner.state.lock().await;
        state.policy.list_versions().to_vec()
    }

    /// Re-activate a previously installed version of a function.
    pub async fn revert_policy_fn(&self, name: &str, version_id: &str) -> MemoryResult<()> {
        let name: PolicyFnName = name.parse()?;
        let now = self.now();
        let blob;
        {
            let mut state = self.inner.state.lock().await;
            state.policy.revert(name, version_id)?;
            state.push_history(HistoryEntry::new(
                now,
                "revert-policy-fn",
                format!("name={name}"),
                format!("version={version_id}"),
            ));
            blob = persistence::encode(&state)?;
        }
        self.flush_blob(blob).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance operations
    // ------------------------------------------------------------------

    /// Run a decay pass.
    ///
    /// Every item's effective half-life comes from the active decay
    /// expression (falling back to the built-in scaling when it errors);
    /// energy shrinks by the recency factor under that half-life. Items
    /// past their TTL horizon are always evicted; items whose
    /// energy + importance drops below the retention threshold are evicted
    /// too. Edges decay by recency of reinforcement and are dropped below
    /// the weight floor.
    pub async fn decay(&self, half_life_days: Option<f64>) -> MemoryResult<DecayReport> {
        if let Some(days) = half_life_days {
            if !(days.is_finite() && days > 0.0) {
                return Err(MemoryError::InvalidArgument {
                    reason: "halfLifeDays must be positive".to_string(),
                });
            }
        }
        let now = self.now();
        let blob;
        let report;
        {
            let mut state = self.inner.state.lock().await;
            let base_half_ms = half_life_days
                .map(|d| d * crate::clock::DAY_MS as f64)
                .unwrap_or_else(|| state.policy.params().half_life_ms());

            let items: Vec<MemoryItem> = state.graph.iter_items().cloned().collect();
            let mut evicted = 0usize;
            let mut touched = 0u64;
            let mut decay_failed = false;

            for item in items {
                if item.is_expired(now) {
                    state.graph.remove_item(&item.id)?;
                    state.push_history(HistoryEntry::new(
                        now,
                        "evict",
                        format!("id={}", item.id),
                        "ttl expired".to_string(),
                    ));
                    evicted += 1;
                    continue;
                }

                let recency_ms = now.saturating_sub(item.last_accessed_at) as f64;
                let args = [
                    Value::Num(item.success as f64),
                    Value::Num(item.fail as f64),
                    Value::Num(item.energy),
                    Value::Num(item.importance),
                    Value::Num(recency_ms),
                    Value::Num(base_half_ms),
                ];
                let eff_half = match state.policy.evaluate(
                    PolicyFnName::Decay,
                    &args,
                    self.inner.evaluator.as_ref(),
                ) {
                    Ok(half) if half > 0.0 => half,
                    Ok(_) | Err(_) => {
                        if !decay_failed {
                            warn!("decay expression failed, using built-in scaling");
                            state.policy.record_eval_failure(PolicyFnName::Decay);
                            decay_failed = true;
                        }
                        crate::clock::default_half_life_ms(item.success, item.fail, base_half_ms)
                    }
                };

                let factor = recency(now, item.last_accessed_at, eff_half);
                let energy = item.energy * factor;
                if energy + item.importance < state.threshold {
                    state.graph.remove_item(&item.id)?;
                    state.push_history(HistoryEntry::new(
                        now,
                        "evict",
                        format!("id={}", item.id),
                        "retention below threshold".to_string(),
                    ));
                    evicted += 1;
                } else if energy != item.energy {
                    state.graph.update_item_energy(&item.id, energy)?;
                    touched += 1;
                }
            }

            // Passive edge decay by reinforcement recency.
            let edge_keys: Vec<crate::types::EdgeKey> =
                state.graph.iter_edges().map(|e| e.key()).collect();
            let mut edges_dropped = 0usize;
            for key in edge_keys {
                let factor = state
                    .graph
                    .get_edge(&key)
                    .map(|e| recency(now, e.last_reinforced_at, base_half_ms))
                    .unwrap_or(0.0);
                if state.graph.decay_edge(&key, factor).is_none() {
                    edges_dropped += 1;
                }
            }

            report = DecayReport {
                evicted,
                edges_dropped,
            };
            state.push_history(HistoryEntry::new(
                now,
                "decay",
                format!("baseHalfMs={base_half_ms:.0}"),
                format!("evicted={evicted} edgesDropped={edges_dropped}"),
            ));
            state.note_changes(touched + evicted as u64);
            blob = persistence::encode(&state)?;
        }
        self.flush_blob(blob).await;
        info!(
            evicted = report.evicted,
            edges_dropped = report.edges_dropped,
            "decay pass complete"
        );
        Ok(report)
    }

    /// Merge near-duplicate items.
    ///
    /// Items whose normalized text hashes to the same bucket are merged
    /// into the oldest of them: counters and tags accumulate, incident
    /// edges are rewired onto the survivor, and recorded sessions have the
    /// duplicates' ids rewritten so policy attribution survives the merge.
    pub async fn consolidate(&self) -> MemoryResult<ConsolidateReport> {
        let now = self.now();
        let blob;
        let report;
        {
            let mut state = self.inner.state.lock().await;

            let mut buckets: HashMap<String, Vec<ItemId>> = HashMap::new();
            for item in state.graph.iter_items() {
                buckets
                    .entry(normalized_text_hash(&item.text))
                    .or_default()
                    .push(item.id.clone());
            }

            let mut merged = 0usize;
            let mut bucket_groups: Vec<Vec<ItemId>> =
                buckets.into_values().filter(|ids| ids.len() > 1).collect();
            // Deterministic processing order
            for ids in bucket_groups.iter_mut() {
                ids.sort();
            }
            bucket_groups.sort();

            for ids in bucket_groups {
                let mut members: Vec<MemoryItem> = ids
                    .iter()
                    .filter_map(|id| state.graph.get_item(id).cloned())
                    .collect();
                if members.len() < 2 {
                    continue;
                }
                members.sort_by(|a, b| {
                    a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
                });
                let mut survivor = members[0].clone();
                let duplicates = &members[1..];

                for dup in duplicates {
                    for tag in &dup.tags {
                        if !survivor.tags.contains(tag) {
                            survivor.tags.push(tag.clone());
                        }
                    }
                    survivor.importance = survivor.importance.max(dup.importance);
                    survivor.energy += dup.energy;
                    survivor.access_count += dup.access_count;
                    survivor.success += dup.success;
                    survivor.fail += dup.fail;
                    survivor.last_accessed_at = survivor.last_accessed_at.max(dup.last_accessed_at);
                    survivor.ttl = longer_ttl(survivor.ttl, dup.ttl);
                }
                survivor.updated_at = now;

                // Rewire incident edges onto the survivor, then drop the
                // duplicates.
                for dup in duplicates {
                    let incident: Vec<MemoryEdge> = state
                        .graph
                        .neighbors(&dup.id, crate::graph::Direction::Both)
                        .into_iter()
                        .map(|(_, e)| e.clone())
                        .collect();
                    state.graph.remove_item(&dup.id)?;
                    for edge in incident {
                        let from = if edge.from == dup.id {
                            survivor.id.clone()
                        } else {
                            edge.from.clone()
                        };
                        let to = if edge.to == dup.id {
                            survivor.id.clone()
                        } else {
                            edge.to.clone()
                        };
                        if from == to {
                            continue;
                        }
                        if state.graph.get_item(&from).is_none()
                            || state.graph.get_item(&to).is_none()
                        {
                            continue; // other endpoint was itself a duplicate
                        }
                        state.graph.create_or_reinforce_edge(
                            &from,
                            &to,
                            &edge.relation,
                            edge.weight,
                            edge.last_reinforced_at,
                            edge.context.clone(),
                        )?;
                    }

                    // Attribution survives: sessions that returned the
                    // duplicate now credit the survivor.
                    for session in state.recent_sessions.iter_mut() {
                        let mut rewritten = false;
                        for slot in session.returned_ids.iter_mut() {
                            if *slot == dup.id {
                                *slot = survivor.id.clone();
                                rewritten = true;
                            }
                        }
                        if rewritten {
                            session.returned_ids.dedup();
                        }
                    }
                    merged += 1;
                }
                state.graph.insert_item(survivor);
            }

            report = ConsolidateReport { merged };
            state.push_history(HistoryEntry::new(
                now,
                "consolidate",
                String::new(),
                format!("merged={merged}"),
            ));
            state.note_changes(merged as u64);
            blob = persistence::encode(&state)?;
        }
        self.flush_blob(blob).await;
        info!(merged = report.merged, "consolidation complete");
        Ok(report)
    }

    /// Force a snapshot save. Unlike the implicit saves after mutating
    /// operations, failures here propagate to the caller.
    pub async fn snapshot(&self) -> MemoryResult<()> {
        let blob = {
            let state = self.inner.state.lock().await;
            persistence::encode(&state)?
        };
        let _flush = self.inner.flush.lock().await;
        persistence::write_blob(&self.inner.config.state_dir, &blob).await
    }

    /// Counts and identity.
    pub async fn stats(&self) -> MemoryStats {
        let state = self.inner.state.lock().await;
        let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
        for item in state.graph.iter_items() {
            *type_counts
                .entry(item.item_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        MemoryStats {
            id: state.id.clone(),
            born: state.born,
            item_count: state.graph.item_count(),
            edge_count: state.graph.edge_count(),
            type_counts,
            global_energy: state.global_energy,
            session_count: state.recent_sessions.len(),
            policy_version_count: state.policy.version_count(),
            history_len: state.history.len(),
            manifest_epoch: self.inner.manifest.epoch(),
        }
    }

    /// Tail of the operation history, newest last.
    pub async fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        let state = self.inner.state.lock().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history[skip..].to_vec()
    }

    /// The memory-about-memory description.
    ///
    /// Serves the cached manifest while fresh; otherwise kicks off a
    /// background regeneration from a cloned snapshot and serves the last
    /// good manifest (or a placeholder before the first generation
    /// completes). Never blocks recall on generation.
    pub async fn describe(&self) -> String {
        let now = self.now();
        let (item_count, snapshot) = {
            let state = self.inner.state.lock().await;
            if self.inner.manifest.is_fresh(now, state.change_counter).await {
                if let Some(manifest) = self.inner.manifest.current().await {
                    return manifest.description.clone();
                }
            }
            (state.graph.item_count(), self.clone_snapshot(&state, now))
        };
        self.inner.manifest.trigger(snapshot);
        match self.inner.manifest.current().await {
            Some(manifest) => manifest.description.clone(),
            None => crate::manifest::placeholder_description(item_count),
        }
    }

    /// Regenerate the manifest inline and return it. Used by tests and the
    /// CLI, where waiting for the background task would race.
    pub async fn refresh_manifest(&self) -> Arc<Manifest> {
        let now = self.now();
        let snapshot = {
            let state = self.inner.state.lock().await;
            self.clone_snapshot(&state, now)
        };
        self.inner.manifest.refresh(snapshot).await
    }

    /// Final snapshot before shutdown.
    pub async fn shutdown(&self) -> MemoryResult<()> {
        self.snapshot().await?;
        info!("engine shut down cleanly");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    fn clone_snapshot(&self, state: &MemoryState, now: u64) -> GraphSnapshot {
        GraphSnapshot {
            items: state.graph.iter_items().cloned().collect(),
            edges: state.graph.iter_edges().cloned().collect(),
            taken_at: now,
            change_counter: state.change_counter,
        }
    }

    /// Flush an encoded snapshot outside the state lock. Failures are
    /// logged and left for the next save to retry.
    async fn flush_blob(&self, blob: Vec<u8>) {
        let _flush = self.inner.flush.lock().await;
        if let Err(e) = persistence::write_blob(&self.inner.config.state_dir, &blob).await {
            error!(error = %e, "snapshot flush failed; state remains in memory");
        }
    }
}

/// Bucket key for consolidation: hash of lowercased, whitespace-collapsed
/// text.
fn normalized_text_hash(text: &str) -> String {
    use sha1::{Digest, Sha1};
    let normalized = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha1::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

fn longer_ttl(a: Ttl, b: Ttl) -> Ttl {
    match (a.duration_ms(), b.duration_ms()) {
        (None, _) | (_, None) => Ttl::Perpetual,
        (Some(da), Some(db)) => {
            if da >= db {
                a
            } else {
                b
            }
        }
    }
}
