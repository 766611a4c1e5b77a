//! # mnemon: Persistent Associative Memory
//!
//! mnemon is a memory engine for long-running AI assistants. It stores
//! labeled text items, relates them through a reinforcement-weighted graph,
//! retrieves by **spreading activation** instead of keyword or vector
//! search, ages items through a tunable decay function, and serves a
//! compact "memory-about-memory" manifest describing the store's thematic
//! shape.
//!
//! ## Quick Start
//!
//! ```ignore
//! use mnemon::{MemoryEngine, Ttl};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let memory = MemoryEngine::start().await?;
//!
//!     // Store items
//!     let a = memory
//!         .remember("fact", "Rust enforces ownership at compile time",
//!                   0.9, Ttl::Days90, vec!["rust".into()], None)
//!         .await?;
//!     let b = memory
//!         .remember("technique", "Use Arc<Mutex<T>> for shared mutable state",
//!                   0.7, Ttl::Days90, vec!["rust".into()], None)
//!         .await?;
//!
//!     // Relate them; recall will spread activation across the edge
//!     memory.associate(&a, &b, ":relates_to", 0.8, None).await?;
//!     let results = memory.recall("ownership", 5).await?;
//!     for item in results {
//!         println!("{:.3} {}", item.score, item.preview);
//!     }
//!
//!     // Tell the memory what worked; credit flows back to the policy
//!     // expressions that produced the ranking
//!     memory.feedback(&a, true).await?;
//!
//!     // A bounded description of everything the memory holds
//!     println!("{}", memory.describe().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Graph** (`graph`): typed items plus directed weighted edges, with
//!    invariant-preserving mutators and bounded co-activation growth.
//! 2. **Activation engine** (`activation`): lexical seeding, bounded
//!    propagation, policy-scored ranking, exploration substitution.
//! 3. **Policy** (`policy`): scoring, decay and exploration live as stored
//!    expressions, versioned by content hash and attributable through
//!    recall sessions. Feedback flows back to the versions that produced
//!    each result.
//! 4. **Manifest** (`manifest`): Louvain communities, PageRank importance,
//!    topology metrics and summarizer-named themes, cached and regenerated
//!    in the background.
//! 5. **Store** (`persistence`): the whole state as one atomic,
//!    checksummed snapshot; corruption is quarantined, never fatal.
//!
//! ## Concurrency
//!
//! All mutation is single-writer: operations are totally ordered through
//! one async mutex. Disk flushes and manifest generation run outside that
//! lock (generation reads a cloned snapshot and publishes by pointer
//! swap), so reads stay consistent without lock hierarchies.
//!
//! `MemoryEngine` clones cheaply and can be shared across tasks.

pub mod activation;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod persistence;
pub mod policy;
pub mod state;
pub mod types;

// Public API exports
pub use config::{EngineConfig, SummarizerConfig};
pub use engine::{
    ConsolidateReport, DecayReport, MemoryEngine, MemoryStats, PolicyFnInfo,
};
pub use error::{MemoryError, MemoryResult};
pub use types::{
    EdgeKey, HistoryEntry, ItemId, ItemType, MemoryEdge, MemoryItem, RankedItem, Ttl,
    CO_ACTIVATED, EDGE_EPSILON,
};

// Clock exports (tests inject ManualClock for determinism)
pub use clock::{Clock, ManualClock, SystemClock};

// Activation exports
pub use activation::{Subgraph, TraceNode};

// Policy exports
pub use policy::{
    ExprEvaluator, Evaluator, PolicyFnName, PolicyInfo, PolicyParams, PolicySelection,
    PolicyVersion, SessionRecord, Value,
};

// Manifest exports
pub use manifest::{
    KeywordSummarizer, Manifest, Summarizer, TemporalLabel, ThemeName, ThemeRequest,
    ThemeSummary, TopologyReport,
};
#[cfg(feature = "http")]
pub use manifest::HttpSummarizer;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use mnemon::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{MemoryEngine, MemoryStats};
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::policy::{PolicyFnName, PolicyParams};
    pub use crate::types::{MemoryItem, RankedItem, Ttl};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// Call once at application startup; configures the tracing subscriber
/// with an environment filter. The log level is controlled via the
/// `MNEMON_LOG` environment variable:
/// - `MNEMON_LOG=error` - Only errors
/// - `MNEMON_LOG=warn` - Errors and warnings
/// - `MNEMON_LOG=info` - General information (default)
/// - `MNEMON_LOG=debug` - Debug information
/// - `MNEMON_LOG=trace` - Verbose tracing
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("MNEMON_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
