/// Homoiconic policy layer.
///
/// The three functions that shape recall (`decay`, `recallScore` and
/// `exploration`) are not code in this crate; they are stored expressions,
/// versioned by the SHA-1 of their source text and evaluated through a
/// sandboxed [`Evaluator`]. Every version ever installed is kept with
/// success/fail counters, and recall sessions record which versions were
/// active, so feedback can be attributed back to the expressions that
/// produced a result. Replacing a function appends a version; reverting
/// re-activates an existing one. Versions are never deleted.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{MemoryError, MemoryResult};
use crate::types::ItemId;

pub mod expr;

pub use expr::{EvalLimits, ExprEvaluator};

/// How many recent sessions that returned an item receive credit or blame
/// when the item gets feedback.
pub const ATTRIBUTION_WINDOW: usize = 20;

/// How many recall sessions the state retains for attribution.
pub const SESSION_RING_CAPACITY: usize = 50;

/// An argument to (or intermediate value of) a policy expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A scalar.
    Num(f64),
    /// A vector of scalars (used by the exploration signature).
    Vec(Vec<f64>),
}

/// Sandboxed policy expression evaluator.
///
/// The contract is deliberately narrow: numeric and vector-of-number inputs,
/// a single finite numeric return, no host I/O, and a hard internal budget.
/// The crate ships [`ExprEvaluator`] as the default implementation; hosts
/// may substitute their own sandbox.
pub trait Evaluator: Send + Sync + std::fmt::Debug {
    /// Evaluate `source` on `args`, returning a single number.
    fn evaluate(&self, source: &str, args: &[Value]) -> MemoryResult<f64>;
}

/// The three replaceable policy functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyFnName {
    /// Per-item half-life from feedback counters.
    #[serde(rename = "decay")]
    Decay,
    /// Rank score of a recall candidate.
    #[serde(rename = "recallScore")]
    RecallScore,
    /// Serendipity slot selection from the ranking tail.
    #[serde(rename = "exploration")]
    Exploration,
}

impl PolicyFnName {
    /// All function names, in canonical order.
    pub const ALL: [PolicyFnName; 3] = [
        PolicyFnName::Decay,
        PolicyFnName::RecallScore,
        PolicyFnName::Exploration,
    ];
}

impl std::fmt::Display for PolicyFnName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyFnName::Decay => write!(f, "decay"),
            PolicyFnName::RecallScore => write!(f, "recallScore"),
            PolicyFnName::Exploration => write!(f, "exploration"),
        }
    }
}

impl std::str::FromStr for PolicyFnName {
    type Err = MemoryError;

    fn from_str(s: &str) -> MemoryResult<Self> {
        match s {
            "decay" => Ok(PolicyFnName::Decay),
            "recallScore" => Ok(PolicyFnName::RecallScore),
            "exploration" => Ok(PolicyFnName::Exploration),
            other => Err(MemoryError::UnknownPolicyFn {
                name: other.to_string(),
            }),
        }
    }
}

/// A single installed version of a policy function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVersion {
    /// Which function this version belongs to
    pub name: PolicyFnName,
    /// SHA-1 hex of the source text
    pub version_id: String,
    /// The expression source
    pub source: String,
    /// When the version was first installed (epoch ms)
    pub created_at: u64,
    /// Feedback credited to this version
    pub success: u64,
    /// Feedback blamed on this version
    pub fail: u64,
    /// The version that replaced this one as active, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub superseded_by: Option<String>,
}

/// Numeric knobs of the recall pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyParams {
    /// Base half-life for recency scoring, in days
    pub half_life_days: f64,
    /// Number of propagation steps per recall
    pub activation_steps: u32,
    /// Per-hop attenuation factor, in (0, 1]
    pub activation_decay: f64,
    /// Minimum activation for a node to propagate
    pub activation_threshold: f64,
    /// Write-back reinforcement magnitude, in [0, 1]
    pub reinforce_delta: f64,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            activation_steps: 2,
            activation_decay: 0.6,
            activation_threshold: 0.05,
            reinforce_delta: 0.1,
        }
    }
}

impl PolicyParams {
    /// Base half-life in milliseconds.
    pub fn half_life_ms(&self) -> f64 {
        self.half_life_days * crate::clock::DAY_MS as f64
    }

    /// Validate all ranges.
    pub fn validate(&self) -> MemoryResult<()> {
        if !(self.half_life_days.is_finite() && self.half_life_days > 0.0) {
            return Err(MemoryError::InvalidArgument {
                reason: "halfLifeDays must be positive".to_string(),
            });
        }
        if !(1..=32).contains(&self.activation_steps) {
            return Err(MemoryError::InvalidArgument {
                reason: "activationSteps must be in 1..=32".to_string(),
            });
        }
        if !(self.activation_decay > 0.0 && self.activation_decay <= 1.0) {
            return Err(MemoryError::InvalidArgument {
                reason: "activationDecay must be in (0, 1]".to_string(),
            });
        }
        if !(self.activation_threshold.is_finite() && self.activation_threshold >= 0.0) {
            return Err(MemoryError::InvalidArgument {
                reason: "activationThreshold must be >= 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.reinforce_delta) {
            return Err(MemoryError::InvalidArgument {
                reason: "reinforceDelta must be in [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// The version ids active for each function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySelection {
    /// Active decay version id
    pub decay: String,
    /// Active recallScore version id
    #[serde(rename = "recallScore")]
    pub recall_score: String,
    /// Active exploration version id
    pub exploration: String,
}

impl PolicySelection {
    /// Version id for a function name.
    pub fn get(&self, name: PolicyFnName) -> &str {
        match name {
            PolicyFnName::Decay => &self.decay,
            PolicyFnName::RecallScore => &self.recall_score,
            PolicyFnName::Exploration => &self.exploration,
        }
    }

    fn set(&mut self, name: PolicyFnName, version_id: String) {
        match name {
            PolicyFnName::Decay => self.decay = version_id,
            PolicyFnName::RecallScore => self.recall_score = version_id,
            PolicyFnName::Exploration => self.exploration = version_id,
        }
    }

    /// All three ids.
    pub fn ids(&self) -> [&str; 3] {
        [&self.decay, &self.recall_score, &self.exploration]
    }
}

/// One recall call, recorded for feedback attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session id
    pub session_id: String,
    /// The recall query
    pub query: String,
    /// When the recall ran (epoch ms)
    pub at: u64,
    /// Ids returned, in rank order
    pub returned_ids: Vec<ItemId>,
    /// Policy versions active at call time
    pub policy_versions: PolicySelection,
}

/// Snapshot of policy state returned by `get-policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInfo {
    /// Numeric knobs
    pub params: PolicyParams,
    /// Active version per function
    pub functions: PolicySelection,
}

/// Default decay source: the reference half-life scaling.
pub const DEFAULT_DECAY_SRC: &str = "(lambda (success fail energy importance recency-ms base-half-ms) \
     (* base-half-ms (+ 0.5 (* 1.5 (/ success (+ success fail 1))))))";

/// Default recallScore source: activation weighted by recency and importance.
pub const DEFAULT_RECALL_SCORE_SRC: &str = "(lambda (activation recency importance access-count success fail) \
     (* activation (+ 0.5 (* 0.3 recency) (* 0.2 importance))))";

/// Default exploration source: no serendipity substitution.
pub const DEFAULT_EXPLORATION_SRC: &str = "(lambda (limit tail-n activations recencies importances access-counts successes fails) -1)";

/// Compute a version id: SHA-1 hex of the source text.
pub fn version_id_of(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fixed probe arguments used to validate an expression at install time.
pub fn probe_args(name: PolicyFnName) -> Vec<Value> {
    match name {
        PolicyFnName::Decay => vec![
            Value::Num(1.0),             // success
            Value::Num(1.0),             // fail
            Value::Num(0.5),             // energy
            Value::Num(0.5),             // importance
            Value::Num(3_600_000.0),     // recency_ms
            Value::Num(2_592_000_000.0), // base_half_ms (30d)
        ],
        PolicyFnName::RecallScore => vec![
            Value::Num(0.5), // activation
            Value::Num(0.5), // recency
            Value::Num(0.5), // importance
            Value::Num(3.0), // access_count
            Value::Num(1.0), // success
            Value::Num(1.0), // fail
        ],
        PolicyFnName::Exploration => vec![
            Value::Num(5.0),
            Value::Num(2.0),
            Value::Vec(vec![0.3, 0.2]),
            Value::Vec(vec![0.9, 0.4]),
            Value::Vec(vec![0.5, 0.5]),
            Value::Vec(vec![1.0, 2.0]),
            Value::Vec(vec![0.0, 1.0]),
            Value::Vec(vec![1.0, 0.0]),
        ],
    }
}

/// Versioned store of policy expressions and numeric params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyStore {
    params: PolicyParams,
    active: PolicySelection,
    versions: Vec<PolicyVersion>,
}

impl PolicyStore {
    /// Create a store with the three default expressions installed and
    /// active.
    pub fn new(now_ms: u64) -> Self {
        let defaults = [
            (PolicyFnName::Decay, DEFAULT_DECAY_SRC),
            (PolicyFnName::RecallScore, DEFAULT_RECALL_SCORE_SRC),
            (PolicyFnName::Exploration, DEFAULT_EXPLORATION_SRC),
        ];
        let versions: Vec<PolicyVersion> = defaults
            .iter()
            .map(|(name, src)| PolicyVersion {
                name: *name,
                version_id: version_id_of(src),
                source: src.to_string(),
                created_at: now_ms,
                success: 0,
                fail: 0,
                superseded_by: None,
            })
            .collect();
        let active = PolicySelection {
            decay: versions[0].version_id.clone(),
            recall_score: versions[1].version_id.clone(),
            exploration: versions[2].version_id.clone(),
        };
        Self {
            params: PolicyParams::default(),
            active,
            versions,
        }
    }

    /// Current numeric params.
    pub fn params(&self) -> &PolicyParams {
        &self.params
    }

    /// Replace the numeric params after validation.
    pub fn set_params(&mut self, params: PolicyParams) -> MemoryResult<()> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    /// The active version ids.
    pub fn active(&self) -> &PolicySelection {
        &self.active
    }

    /// Params plus active selections, as returned by `get-policy`.
    pub fn info(&self) -> PolicyInfo {
        PolicyInfo {
            params: self.params,
            functions: self.active.clone(),
        }
    }

    /// Source text of the active version of a function.
    pub fn active_source(&self, name: PolicyFnName) -> &str {
        let id = self.active.get(name);
        // The active id always references an installed version.
        self.versions
            .iter()
            .find(|v| v.version_id == id)
            .map(|v| v.source.as_str())
            .unwrap_or("")
    }

    /// Install (or re-activate) an expression for a function.
    ///
    /// The source is probed on a fixed argument vector before anything is
    /// recorded; a parse failure or a failed probe rejects the set with no
    /// state change. Returns the version id.
    pub fn set_fn(
        &mut self,
        name: PolicyFnName,
        source: &str,
        evaluator: &dyn Evaluator,
        now_ms: u64,
    ) -> MemoryResult<String> {
        evaluator
            .evaluate(source, &probe_args(name))
            .map_err(|e| MemoryError::ExpressionRejected {
                reason: e.to_string(),
            })?;

        let version_id = version_id_of(source);
        let installed = self
            .versions
            .iter()
            .any(|v| v.version_id == version_id && v.name == name);
        if !installed {
            self.versions.push(PolicyVersion {
                name,
                version_id: version_id.clone(),
                source: source.to_string(),
                created_at: now_ms,
                success: 0,
                fail: 0,
                superseded_by: None,
            });
        }
        self.activate(name, &version_id);
        Ok(version_id)
    }

    /// Re-activate a previously installed version.
    pub fn revert(&mut self, name: PolicyFnName, version_id: &str) -> MemoryResult<()> {
        let exists = self
            .versions
            .iter()
            .any(|v| v.version_id == version_id && v.name == name);
        if !exists {
            return Err(MemoryError::UnknownPolicyVersion {
                name: name.to_string(),
                version_id: version_id.to_string(),
            });
        }
        self.activate(name, version_id);
        Ok(())
    }

    /// Evaluate the active version of a function on the given arguments.
    pub fn evaluate(
        &self,
        name: PolicyFnName,
        args: &[Value],
        evaluator: &dyn Evaluator,
    ) -> MemoryResult<f64> {
        evaluator.evaluate(self.active_source(name), args)
    }

    /// All versions, oldest first, with counters and lineage.
    pub fn list_versions(&self) -> &[PolicyVersion] {
        &self.versions
    }

    /// Number of installed versions.
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Credit or blame a set of versions by id, incrementing each exactly
    /// once.
    pub fn record_feedback(&mut self, version_ids: &std::collections::HashSet<String>, success: bool) {
        for version in &mut self.versions {
            if version_ids.contains(&version.version_id) {
                if success {
                    version.success += 1;
                } else {
                    version.fail += 1;
                }
            }
        }
    }

    /// Blame the active version of a function for a runtime failure.
    pub fn record_eval_failure(&mut self, name: PolicyFnName) {
        let id = self.active.get(name).to_string();
        if let Some(version) = self.versions.iter_mut().find(|v| v.version_id == id) {
            version.fail += 1;
        }
    }

    /// Validate that the active selections reference installed versions.
    /// Used by the load path; a broken selection is repaired by falling back
    /// to the newest installed version of that function.
    pub fn repair(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        let installed: HashMap<String, PolicyFnName> = self
            .versions
            .iter()
            .map(|v| (v.version_id.clone(), v.name))
            .collect();
        for name in PolicyFnName::ALL {
            let id = self.active.get(name).to_string();
            if installed.get(&id) != Some(&name) {
                if let Some(latest) = self
                    .versions
                    .iter()
                    .rev()
                    .find(|v| v.name == name)
                    .map(|v| v.version_id.clone())
                {
                    notes.push(format!("re-pointed active {name} to {latest}"));
                    self.active.set(name, latest);
                }
            }
        }
        notes
    }

    fn activate(&mut self, name: PolicyFnName, version_id: &str) {
        let previous = self.active.get(name).to_string();
        if previous != version_id {
            if let Some(prev) = self
                .versions
                .iter_mut()
                .find(|v| v.version_id == previous && v.name == name)
            {
                prev.superseded_by = Some(version_id.to_string());
            }
        }
        self.active.set(name, version_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (PolicyStore, ExprEvaluator) {
        (PolicyStore::new(1_000), ExprEvaluator::new())
    }

    #[test]
    fn test_defaults_installed_and_active() {
        let (store, evaluator) = store();
        assert_eq!(store.version_count(), 3);
        for name in PolicyFnName::ALL {
            let id = store.active.get(name);
            assert_eq!(id.len(), 40, "sha1 hex is 40 chars");
            // Every default must pass its own probe
            store.evaluate(name, &probe_args(name), &evaluator).unwrap();
        }
    }

    #[test]
    fn test_version_id_is_sha1_of_source() {
        let id = version_id_of("(lambda (a r i ac s f) a)");
        assert_eq!(id, version_id_of("(lambda (a r i ac s f) a)"));
        assert_ne!(id, version_id_of("(lambda (a r i ac s f) r)"));
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_set_fn_appends_and_activates() {
        let (mut store, evaluator) = store();
        let id = store
            .set_fn(
                PolicyFnName::RecallScore,
                "(lambda (a r i ac s f) a)",
                &evaluator,
                2_000,
            )
            .unwrap();
        assert_eq!(store.version_count(), 4);
        assert_eq!(store.active.recall_score, id);
        // The default it replaced now carries lineage
        let default_id = version_id_of(DEFAULT_RECALL_SCORE_SRC);
        let default = store
            .list_versions()
            .iter()
            .find(|v| v.version_id == default_id)
            .unwrap();
        assert_eq!(default.superseded_by.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_set_fn_same_source_is_idempotent() {
        let (mut store, evaluator) = store();
        let src = "(lambda (a r i ac s f) a)";
        let id1 = store
            .set_fn(PolicyFnName::RecallScore, src, &evaluator, 2_000)
            .unwrap();
        let id2 = store
            .set_fn(PolicyFnName::RecallScore, src, &evaluator, 3_000)
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.version_count(), 4);
    }

    #[test]
    fn test_set_fn_rejects_unparseable_source() {
        let (mut store, evaluator) = store();
        let err = store.set_fn(PolicyFnName::Decay, "(lambda (a", &evaluator, 0);
        assert!(matches!(err, Err(MemoryError::ExpressionRejected { .. })));
        assert_eq!(store.version_count(), 3);
    }

    #[test]
    fn test_set_fn_rejects_failing_probe() {
        let (mut store, evaluator) = store();
        // Parses fine, but divides by zero on the probe vector
        let err = store.set_fn(
            PolicyFnName::RecallScore,
            "(lambda (a r i ac s f) (/ a 0 0))",
            &evaluator,
            0,
        );
        assert!(matches!(err, Err(MemoryError::ExpressionRejected { .. })));
    }

    #[test]
    fn test_revert_round_trip() {
        let (mut store, evaluator) = store();
        let v1 = store
            .set_fn(
                PolicyFnName::RecallScore,
                "(lambda (a r i ac s f) a)",
                &evaluator,
                1,
            )
            .unwrap();
        let v2 = store
            .set_fn(
                PolicyFnName::RecallScore,
                "(lambda (a r i ac s f) (+ a (* 10 i)))",
                &evaluator,
                2,
            )
            .unwrap();
        assert_eq!(store.active.recall_score, v2);
        store.revert(PolicyFnName::RecallScore, &v1).unwrap();
        assert_eq!(store.active.recall_score, v1);
        // Behaviour matches the original version on probe inputs
        let a = store
            .evaluate(
                PolicyFnName::RecallScore,
                &probe_args(PolicyFnName::RecallScore),
                &evaluator,
            )
            .unwrap();
        assert_eq!(a, 0.5);
    }

    #[test]
    fn test_revert_unknown_version_fails() {
        let (mut store, _) = store();
        let err = store.revert(PolicyFnName::Decay, "deadbeef");
        assert!(matches!(
            err,
            Err(MemoryError::UnknownPolicyVersion { .. })
        ));
    }

    #[test]
    fn test_revert_wrong_function_fails() {
        let (mut store, evaluator) = store();
        let id = store
            .set_fn(
                PolicyFnName::RecallScore,
                "(lambda (a r i ac s f) a)",
                &evaluator,
                1,
            )
            .unwrap();
        // A recallScore version id is not a decay version id
        assert!(store.revert(PolicyFnName::Decay, &id).is_err());
    }

    #[test]
    fn test_feedback_increments_each_version_once() {
        let (mut store, _) = store();
        let ids: std::collections::HashSet<String> = store
            .active
            .ids()
            .iter()
            .map(|s| s.to_string())
            .collect();
        store.record_feedback(&ids, true);
        store.record_feedback(&ids, false);
        for v in store.list_versions() {
            assert_eq!(v.success, 1);
            assert_eq!(v.fail, 1);
        }
    }

    #[test]
    fn test_params_validation() {
        let mut p = PolicyParams::default();
        p.validate().unwrap();
        p.activation_decay = 0.0;
        assert!(p.validate().is_err());
        p.activation_decay = 1.0;
        p.validate().unwrap();
        p.reinforce_delta = 1.5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_repair_repoints_broken_selection() {
        let (mut store, _) = store();
        store.active.decay = "0000000000000000000000000000000000000000".to_string();
        let notes = store.repair();
        assert_eq!(notes.len(), 1);
        assert_eq!(store.active.decay, version_id_of(DEFAULT_DECAY_SRC));
    }
}
