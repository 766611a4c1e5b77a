//! Theme naming for manifest communities.
//!
//! The generator batches the top communities into one request and expects a
//! short name back for each. The trait is the seam: production wires an
//! LLM-backed HTTP endpoint, tests script the responses, and the keyword
//! fallback keeps the manifest readable when no summarizer is reachable.
//! Summarizer failure is always recoverable; it never fails a generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryResult;

/// Maximum words allowed in a theme name; longer answers are truncated.
pub const MAX_THEME_WORDS: usize = 8;

/// One community to be named.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeRequest {
    /// Opaque community label
    pub community_id: usize,
    /// Extracted keywords, most frequent first
    pub keywords: Vec<String>,
    /// Up to ten representative item previews
    pub previews: Vec<String>,
}

/// A name produced for one community.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeName {
    /// Matches the request's community label
    pub community_id: usize,
    /// Short human-readable theme name
    pub name: String,
}

/// Batched theme-naming collaborator.
///
/// Implementations must be idempotent on identical input; the generator may
/// retry a superseded run with the same communities.
#[async_trait]
pub trait Summarizer: Send + Sync + std::fmt::Debug {
    /// Name every community in the batch.
    async fn name_themes(&self, batch: &[ThemeRequest]) -> MemoryResult<Vec<ThemeName>>;
}

/// Clip a name to the word budget.
pub fn clip_theme_name(name: &str) -> String {
    name.split_whitespace()
        .take(MAX_THEME_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fallback name for a community: its top two keywords joined.
pub fn keyword_fallback_name(keywords: &[String]) -> String {
    match keywords {
        [] => "unlabeled".to_string(),
        [one] => one.clone(),
        [one, two, ..] => format!("{one} / {two}"),
    }
}

/// Summarizer that names every community from its keywords.
///
/// Used when no endpoint is configured, and as the behaviour the generator
/// falls back to when the configured summarizer errors.
#[derive(Debug, Clone, Default)]
pub struct KeywordSummarizer;

#[async_trait]
impl Summarizer for KeywordSummarizer {
    async fn name_themes(&self, batch: &[ThemeRequest]) -> MemoryResult<Vec<ThemeName>> {
        Ok(batch
            .iter()
            .map(|req| ThemeName {
                community_id: req.community_id,
                name: keyword_fallback_name(&req.keywords),
            })
            .collect())
    }
}

/// LLM-backed summarizer speaking a small JSON protocol.
///
/// POSTs `{"batch": [...]}` to the configured endpoint and expects
/// `{"batch": [{"communityId": n, "themeName": "..."}]}` back. Configured
/// through `MEMORY_SUMMARIZER_ENDPOINT` / `MEMORY_SUMMARIZER_KEY`.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpSummarizer {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpSummarizer {
    /// Create a summarizer for the given endpoint.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn name_themes(&self, batch: &[ThemeRequest]) -> MemoryResult<Vec<ThemeName>> {
        use crate::error::MemoryError;

        #[derive(Serialize)]
        struct WireRequest<'a> {
            batch: Vec<WireCommunity<'a>>,
        }
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct WireCommunity<'a> {
            community_id: usize,
            keywords: &'a [String],
            previews: &'a [String],
        }
        #[derive(Deserialize)]
        struct WireResponse {
            batch: Vec<WireTheme>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct WireTheme {
            community_id: usize,
            theme_name: String,
        }

        let body = WireRequest {
            batch: batch
                .iter()
                .map(|req| WireCommunity {
                    community_id: req.community_id,
                    keywords: &req.keywords,
                    previews: &req.previews,
                })
                .collect(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| MemoryError::StorageError(format!("summarizer request failed: {e}")))?
            .error_for_status()
            .map_err(|e| MemoryError::StorageError(format!("summarizer returned error: {e}")))?;
        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::StorageError(format!("summarizer response invalid: {e}")))?;

        Ok(parsed
            .batch
            .into_iter()
            .map(|t| ThemeName {
                community_id: t.community_id,
                name: clip_theme_name(&t.theme_name),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyword_summarizer_joins_top_two() {
        let batch = vec![ThemeRequest {
            community_id: 7,
            keywords: vec!["rust".to_string(), "async".to_string(), "tokio".to_string()],
            previews: vec![],
        }];
        let names = KeywordSummarizer.name_themes(&batch).await.unwrap();
        assert_eq!(names[0].community_id, 7);
        assert_eq!(names[0].name, "rust / async");
    }

    #[tokio::test]
    async fn test_keyword_summarizer_handles_sparse_keywords() {
        let batch = vec![
            ThemeRequest {
                community_id: 0,
                keywords: vec![],
                previews: vec![],
            },
            ThemeRequest {
                community_id: 1,
                keywords: vec!["solo".to_string()],
                previews: vec![],
            },
        ];
        let names = KeywordSummarizer.name_themes(&batch).await.unwrap();
        assert_eq!(names[0].name, "unlabeled");
        assert_eq!(names[1].name, "solo");
    }

    #[test]
    fn test_clip_theme_name() {
        let long = "one two three four five six seven eight nine ten";
        assert_eq!(
            clip_theme_name(long),
            "one two three four five six seven eight"
        );
        assert_eq!(clip_theme_name("short name"), "short name");
    }
}
