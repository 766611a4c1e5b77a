//! Keyword extraction for community labeling.
//!
//! Nothing clever: token frequency over member items' text and tags, with a
//! stopword list and single-character filtering. The summarizer turns these
//! into readable theme names; when it is unavailable the top keywords ARE
//! the theme name.

use std::collections::HashMap;

use crate::activation::tokenize;
use crate::types::MemoryItem;

/// How many keywords to keep per community.
pub const KEYWORDS_PER_COMMUNITY: usize = 5;

/// Common English words that carry no thematic signal.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has", "have",
    "if", "in", "into", "is", "it", "its", "no", "not", "of", "on", "or", "our", "so", "than",
    "that", "the", "their", "then", "there", "these", "they", "this", "to", "was", "we", "were",
    "when", "which", "while", "will", "with", "you", "your",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Top keywords across a set of items, by frequency over text and tags.
///
/// Tags count double: they are deliberate labels, free text is not.
/// Ordering is deterministic: frequency descending, then alphabetical.
pub fn extract_keywords(items: &[&MemoryItem], limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for item in items {
        for token in tokenize(&item.text) {
            if token.chars().count() > 1 && !is_stopword(&token) {
                *counts.entry(token).or_insert(0) += 1;
            }
        }
        for tag in &item.tags {
            for token in tokenize(tag) {
                if token.chars().count() > 1 && !is_stopword(&token) {
                    *counts.entry(token).or_insert(0) += 2;
                }
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(t, _)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemType, Ttl};

    fn item(text: &str, tags: &[&str]) -> MemoryItem {
        MemoryItem {
            id: "t".to_string(),
            item_type: ItemType::new(ItemType::FACT).unwrap(),
            text: text.to_string(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            importance: 0.5,
            energy: 0.0,
            ttl: Ttl::Days30,
            scope: None,
            created_at: 0,
            updated_at: 0,
            last_accessed_at: 0,
            access_count: 0,
            success: 0,
            fail: 0,
        }
    }

    #[test]
    fn test_stopwords_and_short_tokens_filtered() {
        let it = item("the cat is on a mat", &[]);
        let kws = extract_keywords(&[&it], 5);
        assert!(kws.contains(&"cat".to_string()));
        assert!(kws.contains(&"mat".to_string()));
        assert!(!kws.contains(&"the".to_string()));
        assert!(!kws.contains(&"a".to_string()));
    }

    #[test]
    fn test_tags_outweigh_text() {
        let a = item("database tuning notes", &["rust"]);
        let b = item("database index design", &["rust"]);
        let kws = extract_keywords(&[&a, &b], 2);
        // "rust" appears twice as tag (weight 4), "database" twice as text
        assert_eq!(kws[0], "rust");
        assert_eq!(kws[1], "database");
    }

    #[test]
    fn test_deterministic_tie_break() {
        let it = item("zebra apple", &[]);
        let kws = extract_keywords(&[&it], 5);
        assert_eq!(kws, vec!["apple".to_string(), "zebra".to_string()]);
    }

    #[test]
    fn test_limit_respected() {
        let it = item("one two three four five six seven eight nine ten", &[]);
        let kws = extract_keywords(&[&it], KEYWORDS_PER_COMMUNITY);
        assert_eq!(kws.len(), KEYWORDS_PER_COMMUNITY);
    }
}
