/// Engine configuration.
///
/// Zero configuration by default: state lives under `~/.mnemon`, the cache
/// policy uses the spec defaults and theme naming falls back to keywords.
/// Environment variables override individual knobs for deployment without
/// code changes.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::manifest::{KeywordSummarizer, Summarizer, DEFAULT_CHANGE_THRESHOLD, DEFAULT_MANIFEST_TTL};

/// Which summarizer the manifest generator uses for theme naming.
#[derive(Debug, Clone, Default)]
pub enum SummarizerConfig {
    /// Name themes from extracted keywords (no network)
    #[default]
    Keyword,
    /// POST naming batches to an LLM endpoint
    Http {
        /// Endpoint URL
        endpoint: String,
        /// Optional bearer token
        api_key: Option<String>,
    },
}

/// Configuration for a [`crate::MemoryEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the state snapshot
    pub state_dir: PathBuf,
    /// Manifest cache TTL
    pub manifest_ttl: Duration,
    /// Item changes that invalidate the manifest cache early
    pub manifest_change_threshold: u64,
    /// Wall-clock budget per policy expression evaluation
    pub eval_timeout: Duration,
    /// Theme naming backend
    pub summarizer: SummarizerConfig,
    /// Override for activation steps, applied to freshly created states
    pub activation_steps: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mnemon");
        Self {
            state_dir,
            manifest_ttl: DEFAULT_MANIFEST_TTL,
            manifest_change_threshold: DEFAULT_CHANGE_THRESHOLD,
            eval_timeout: Duration::from_secs(5),
            summarizer: SummarizerConfig::default(),
            activation_steps: None,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the environment.
    ///
    /// Recognized variables: `MEMORY_STATE_DIR`, `MEMORY_SUMMARIZER_ENDPOINT`,
    /// `MEMORY_SUMMARIZER_KEY`, `MEMORY_MANIFEST_TTL_SEC`,
    /// `MEMORY_ACTIVATION_STEPS`. Unset variables keep their defaults;
    /// unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("MEMORY_STATE_DIR") {
            if !dir.is_empty() {
                config.state_dir = PathBuf::from(dir);
            }
        }
        if let Ok(endpoint) = std::env::var("MEMORY_SUMMARIZER_ENDPOINT") {
            if !endpoint.is_empty() {
                config.summarizer = SummarizerConfig::Http {
                    endpoint,
                    api_key: std::env::var("MEMORY_SUMMARIZER_KEY").ok(),
                };
            }
        }
        if let Ok(raw) = std::env::var("MEMORY_MANIFEST_TTL_SEC") {
            match raw.parse::<u64>() {
                Ok(secs) => config.manifest_ttl = Duration::from_secs(secs),
                Err(_) => warn!(value = %raw, "ignoring unparseable MEMORY_MANIFEST_TTL_SEC"),
            }
        }
        if let Ok(raw) = std::env::var("MEMORY_ACTIVATION_STEPS") {
            match raw.parse::<u32>() {
                Ok(steps) => config.activation_steps = Some(steps),
                Err(_) => warn!(value = %raw, "ignoring unparseable MEMORY_ACTIVATION_STEPS"),
            }
        }
        config
    }

    /// Directory for a throwaway in-memory style engine rooted at `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Instantiate the configured summarizer.
    pub fn build_summarizer(&self) -> Arc<dyn Summarizer> {
        match &self.summarizer {
            SummarizerConfig::Keyword => Arc::new(KeywordSummarizer),
            #[cfg(feature = "http")]
            SummarizerConfig::Http { endpoint, api_key } => Arc::new(
                crate::manifest::HttpSummarizer::new(endpoint.clone(), api_key.clone()),
            ),
            #[cfg(not(feature = "http"))]
            SummarizerConfig::Http { .. } => {
                warn!("http feature disabled, falling back to keyword summarizer");
                Arc::new(KeywordSummarizer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.state_dir.ends_with(".mnemon"));
        assert_eq!(config.manifest_ttl, Duration::from_secs(60));
        assert_eq!(config.manifest_change_threshold, 100);
        assert!(config.activation_steps.is_none());
    }

    #[test]
    fn test_at_overrides_state_dir() {
        let config = EngineConfig::at("/tmp/somewhere");
        assert_eq!(config.state_dir, PathBuf::from("/tmp/somewhere"));
    }
}
