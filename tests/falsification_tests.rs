/// Falsification tests for the memory engine.
///
/// These actively try to break the system rather than confirm it works:
/// determinism under restart, snapshot atomicity and idempotence,
/// corruption recovery, runtime policy failures mid-recall, and invariant
/// attacks through the public surface. If we can't break it, we gain
/// confidence it's correct.
use std::sync::Arc;

use mnemon::{EngineConfig, ManualClock, MemoryEngine, MemoryError, Ttl};
use tempfile::TempDir;

async fn engine_at(dir: &std::path::Path, clock: &ManualClock) -> MemoryEngine {
    MemoryEngine::start_with_clock(EngineConfig::at(dir), Arc::new(clock.clone()))
        .await
        .unwrap()
}

// ============================================================================
// SECTION 1: DETERMINISM
// ============================================================================

/// Falsification: does recall stay deterministic across a restart from the
/// same snapshot at the same clock?
#[tokio::test]
async fn falsify_recall_determinism_from_identical_state() {
    let dir_a = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir_a.path(), &clock).await;

    let mut ids = Vec::new();
    for i in 0..8 {
        let id = memory
            .remember(
                "fact",
                &format!("graph theory note {i}"),
                0.3 + 0.08 * i as f64,
                Ttl::Days90,
                vec!["graph".to_string()],
                None,
            )
            .await
            .unwrap();
        ids.push(id);
    }
    for pair in ids.windows(2) {
        memory
            .associate(&pair[0], &pair[1], ":relates_to", 0.6, None)
            .await
            .unwrap();
    }
    memory.shutdown().await.unwrap();

    // Clone the persisted state into a second directory
    let dir_b = TempDir::new().unwrap();
    std::fs::copy(
        dir_a.path().join("state.json"),
        dir_b.path().join("state.json"),
    )
    .unwrap();

    clock.advance(5_000);
    let engine_one = engine_at(dir_a.path(), &clock).await;
    let engine_two = engine_at(dir_b.path(), &clock).await;

    let r1: Vec<String> = engine_one
        .recall("graph theory", 5)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id.clone())
        .collect();
    let r2: Vec<String> = engine_two
        .recall("graph theory", 5)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id.clone())
        .collect();
    assert_eq!(r1, r2, "identical state and clock must rank identically");
    assert_eq!(r1.len(), 5);
}

// ============================================================================
// SECTION 2: SNAPSHOT ATOMICITY AND IDEMPOTENCE
// ============================================================================

/// Falsification: does a snapshot/load cycle change anything at all?
#[tokio::test]
async fn falsify_snapshot_idempotence() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir.path(), &clock).await;

    let a = memory
        .remember("fact", "alpha", 0.9, Ttl::Days30, vec!["x".to_string()], None)
        .await
        .unwrap();
    let b = memory
        .remember("fact", "beta", 0.4, Ttl::Perpetual, vec![], None)
        .await
        .unwrap();
    memory.associate(&a, &b, ":supports", 0.7, None).await.unwrap();
    memory.recall("alpha", 5).await.unwrap();
    memory.feedback(&a, true).await.unwrap();
    memory.snapshot().await.unwrap();

    let bytes_before = std::fs::read(dir.path().join("state.json")).unwrap();

    // Restart from the snapshot without touching anything, save again:
    // the snapshot must be byte-identical.
    drop(memory);
    let reloaded = engine_at(dir.path(), &clock).await;
    let bytes_after = std::fs::read(dir.path().join("state.json")).unwrap();
    assert_eq!(bytes_before, bytes_after);

    // And the loaded state answers identically
    let item = reloaded.get_item(&a).await.unwrap();
    assert_eq!(item.text, "alpha");
    assert_eq!(item.success, 1);
    assert_eq!(item.access_count, 1);
}

/// Falsification: can a failed save corrupt subsequent reads? Saves go to
/// a temp file first, so a previous good snapshot must survive.
#[tokio::test]
async fn falsify_no_partial_snapshot_visible() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir.path(), &clock).await;
    memory
        .remember("fact", "durable", 0.5, Ttl::Days30, vec![], None)
        .await
        .unwrap();
    memory.shutdown().await.unwrap();

    // No temp file left behind
    assert!(!dir.path().join("state.json.tmp").exists());

    let reloaded = engine_at(dir.path(), &clock).await;
    assert_eq!(reloaded.stats().await.item_count, 1);
}

// ============================================================================
// SECTION 3: CORRUPTION RECOVERY
// ============================================================================

/// Falsification: a corrupted snapshot must not crash the engine, must be
/// preserved for inspection, and the engine must serve a placeholder
/// manifest.
#[tokio::test]
async fn falsify_corruption_recovery() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    {
        let memory = engine_at(dir.path(), &clock).await;
        memory
            .remember("fact", "soon to be lost", 0.5, Ttl::Days30, vec![], None)
            .await
            .unwrap();
        memory.shutdown().await.unwrap();
    }

    // Corrupt the blob in place
    std::fs::write(dir.path().join("state.json"), b"crc32:00000000\ngarbage").unwrap();

    clock.advance(1_000);
    let memory = engine_at(dir.path(), &clock).await;
    assert_eq!(memory.stats().await.item_count, 0, "engine starts fresh");

    // The corrupt blob was quarantined, not deleted
    let quarantined: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("state.corrupt-"))
        .collect();
    assert_eq!(quarantined.len(), 1);
    assert!(dir.path().join("corruption.log").exists());

    // Placeholder manifest until the first generation completes
    let description = memory.describe().await;
    assert!(description.contains("manifest not generated"));
}

// ============================================================================
// SECTION 4: POLICY RUNTIME FAILURES
// ============================================================================

/// Falsification: an expression that passes its probe but blows up on real
/// data must degrade recall, not break it, and the failure must be blamed
/// on the version.
#[tokio::test]
async fn falsify_runtime_score_failure_degrades_gracefully() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir.path(), &clock).await;

    let id = memory
        .remember("fact", "resilient item", 0.9, Ttl::Days30, vec![], None)
        .await
        .unwrap();

    // Probe runs with access_count = 3, so division by (ac - 4) passes
    // validation; once the item has been recalled 4 times it divides by
    // zero at ranking time.
    let version = memory
        .set_policy_fn("recallScore", "(lambda (a r i ac s f) (/ 1 (- ac 4)))")
        .await
        .unwrap();

    for _ in 0..4 {
        let results = memory.recall("resilient", 5).await.unwrap();
        assert_eq!(results.len(), 1);
    }
    // access_count is now 4: the expression fails, recall falls back
    let results = memory.recall("resilient", 5).await.unwrap();
    assert_eq!(results.len(), 1, "fallback ranking still returns the item");
    assert_eq!(results[0].id, id);

    let versions = memory.list_policy_versions().await;
    let failing = versions
        .iter()
        .find(|v| v.version_id == version)
        .unwrap();
    assert!(failing.fail >= 1, "runtime failure must be blamed");
}

/// Falsification: feedback after a policy change credits the versions that
/// were active when the session ran, not the current ones.
#[tokio::test]
async fn falsify_attribution_tracks_session_versions() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir.path(), &clock).await;

    let id = memory
        .remember("fact", "attributed item", 0.9, Ttl::Days30, vec![], None)
        .await
        .unwrap();

    let old_version = memory.get_policy().await.functions.recall_score;
    memory.recall("attributed", 5).await.unwrap();

    // Swap in a new scorer AFTER the session was recorded
    let new_version = memory
        .set_policy_fn("recallScore", "(lambda (a r i ac s f) a)")
        .await
        .unwrap();
    memory.feedback(&id, true).await.unwrap();

    let versions = memory.list_policy_versions().await;
    let old = versions.iter().find(|v| v.version_id == old_version).unwrap();
    let new = versions.iter().find(|v| v.version_id == new_version).unwrap();
    assert_eq!(old.success, 1, "the session's scorer gets the credit");
    assert_eq!(new.success, 0, "the bystander version gets nothing");
}

// ============================================================================
// SECTION 5: INVARIANT ATTACKS THROUGH THE PUBLIC SURFACE
// ============================================================================

#[tokio::test]
async fn falsify_unknown_ids_are_user_errors() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir.path(), &clock).await;

    assert!(memory.get_item("ghost").await.is_none());
    assert!(matches!(
        memory.feedback("ghost", true).await,
        Err(MemoryError::ItemNotFound { .. })
    ));
    assert!(matches!(
        memory.trace("ghost", 2).await,
        Err(MemoryError::ItemNotFound { .. })
    ));
    assert!(matches!(
        memory.associate("ghost", "phantom", ":relates_to", 0.5, None).await,
        Err(MemoryError::DanglingEdge { .. })
    ));
    assert!(matches!(
        memory.revert_policy_fn("decay", "deadbeef").await,
        Err(MemoryError::UnknownPolicyVersion { .. })
    ));
    assert!(matches!(
        memory.get_policy_fn("speed").await,
        Err(MemoryError::UnknownPolicyFn { .. })
    ));
}

/// Falsification: do rapid interleaved writes from cloned handles lose
/// items? The single-writer queue must serialize them all.
#[tokio::test]
async fn falsify_concurrent_writes_lose_nothing() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir.path(), &clock).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let clone = memory.clone();
        handles.push(tokio::spawn(async move {
            clone
                .remember("event", &format!("concurrent write {i}"), 0.5, Ttl::Days30, vec![], None)
                .await
                .unwrap()
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20, "every write must land with a distinct id");
    assert_eq!(memory.stats().await.item_count, 20);
}

/// Falsification: can energy or counters ever go backwards through normal
/// operation?
#[tokio::test]
async fn falsify_counters_never_decrease() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir.path(), &clock).await;

    let id = memory
        .remember("fact", "counter item", 0.9, Ttl::Perpetual, vec![], None)
        .await
        .unwrap();

    let mut last_access = 0;
    let mut last_feedback = 0;
    for round in 0..5 {
        memory.recall("counter", 3).await.unwrap();
        memory.feedback(&id, round % 2 == 0).await.unwrap();
        clock.advance_days(1);
        memory.decay(None).await.unwrap();

        let item = memory.get_item(&id).await.unwrap();
        assert!(item.access_count > last_access);
        assert!(item.success + item.fail > last_feedback);
        assert!(item.energy >= 0.0);
        last_access = item.access_count;
        last_feedback = item.success + item.fail;
    }
}

/// Falsification: a decay pass must never retain an item past its TTL
/// horizon, whatever the policy expression says.
#[tokio::test]
async fn falsify_ttl_is_a_hard_bound() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let memory = engine_at(dir.path(), &clock).await;

    // A decay expression that claims everything lives forever
    memory
        .set_policy_fn(
            "decay",
            "(lambda (s f e i rm bh) 99999999999999)",
        )
        .await
        .unwrap();

    let id = memory
        .remember("event", "bounded", 1.0, Ttl::Days7, vec![], None)
        .await
        .unwrap();
    clock.advance_days(8);
    memory.decay(None).await.unwrap();
    assert!(
        memory.get_item(&id).await.is_none(),
        "TTL expiry must override the decay expression"
    );
}

/// Falsification: restart after shutdown preserves policy lineage and
/// counters exactly.
#[tokio::test]
async fn falsify_policy_versions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000);
    let v1;
    {
        let memory = engine_at(dir.path(), &clock).await;
        let id = memory
            .remember("fact", "lineage", 0.9, Ttl::Days30, vec![], None)
            .await
            .unwrap();
        v1 = memory
            .set_policy_fn("recallScore", "(lambda (a r i ac s f) a)")
            .await
            .unwrap();
        memory.recall("lineage", 5).await.unwrap();
        memory.feedback(&id, true).await.unwrap();
        memory.shutdown().await.unwrap();
    }

    let memory = engine_at(dir.path(), &clock).await;
    let versions = memory.list_policy_versions().await;
    assert_eq!(versions.len(), 4);
    let v = versions.iter().find(|v| v.version_id == v1).unwrap();
    assert_eq!(v.success, 1);
    let info = memory.get_policy().await;
    assert_eq!(info.functions.recall_score, v1);
}
