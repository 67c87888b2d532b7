//! Second-stage scorers that read the query and a candidate together.

use crate::analysis::tokenize;
use crate::error::SearchError;
use std::collections::HashSet;

/// Built-in pairwise scorer needing no model weights.
pub const OVERLAP_RERANKER: &str = "overlap-cross";

pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;
    /// One score per document, in document order; higher is better.
    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>, SearchError>;
}

/// Scores a pair from query-term coverage, query-bigram overlap, and match density.
#[derive(Debug, Clone, Default)]
pub struct OverlapCrossScorer;

impl OverlapCrossScorer {
    fn score_pair(query_tokens: &[String], query_bigrams: &HashSet<(String, String)>, document: &str) -> f32 {
        let doc_tokens = tokenize(document);
        if query_tokens.is_empty() || doc_tokens.is_empty() {
            return 0.0;
        }

        let doc_set: HashSet<&String> = doc_tokens.iter().collect();
        let unique_query: HashSet<&String> = query_tokens.iter().collect();
        let covered = unique_query.iter().filter(|token| doc_set.contains(*token)).count();
        let coverage = covered as f32 / unique_query.len() as f32;

        let bigram_score = if query_bigrams.is_empty() {
            0.0
        } else {
            let doc_bigrams: HashSet<(String, String)> = bigrams(&doc_tokens);
            let shared = query_bigrams.intersection(&doc_bigrams).count();
            shared as f32 / query_bigrams.len() as f32
        };

        let matched = doc_tokens
            .iter()
            .filter(|token| unique_query.contains(token))
            .count();
        let density = matched as f32 / doc_tokens.len() as f32;

        0.6 * coverage + 0.25 * bigram_score + 0.15 * density
    }
}

impl Reranker for OverlapCrossScorer {
    fn name(&self) -> &str {
        OVERLAP_RERANKER
    }

    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>, SearchError> {
        let query_tokens = tokenize(query);
        let query_bigrams = bigrams(&query_tokens);
        Ok(documents
            .iter()
            .map(|document| Self::score_pair(&query_tokens, &query_bigrams, document))
            .collect())
    }
}

fn bigrams(tokens: &[String]) -> HashSet<(String, String)> {
    tokens
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

#[cfg(feature = "fastembed")]
pub use local::FastembedReranker;

#[cfg(feature = "fastembed")]
mod local {
    use super::Reranker;
    use crate::error::SearchError;
    use std::sync::Mutex;

    pub struct FastembedReranker {
        name: String,
        model: Mutex<fastembed::TextRerank>,
    }

    impl FastembedReranker {
        pub fn load(name: &str, model_id: &str) -> Result<Self, SearchError> {
            let model = match model_id {
                "bge-reranker-base" => fastembed::RerankerModel::BGERerankerBase,
                "bge-reranker-v2-m3" => fastembed::RerankerModel::BGERerankerV2M3,
                other => {
                    return Err(SearchError::RerankerUnavailable(format!(
                        "unknown fastembed reranker: {other}"
                    )))
                }
            };
            let reranker = fastembed::TextRerank::try_new(
                fastembed::RerankInitOptions::new(model).with_show_download_progress(false),
            )
            .map_err(|error| SearchError::RerankerUnavailable(format!("{model_id}: {error}")))?;

            Ok(Self {
                name: name.to_string(),
                model: Mutex::new(reranker),
            })
        }
    }

    impl Reranker for FastembedReranker {
        fn name(&self) -> &str {
            &self.name
        }

        fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>, SearchError> {
            let mut model = self
                .model
                .lock()
                .map_err(|_| SearchError::RerankerUnavailable(format!("{} lock poisoned", self.name)))?;
            let results = model
                .rerank(query, documents.to_vec(), false, None)
                .map_err(|error| SearchError::RerankerUnavailable(error.to_string()))?;

            let mut scores = vec![f32::MIN; documents.len()];
            for result in results {
                if let Some(slot) = scores.get_mut(result.index) {
                    *slot = result.score;
                }
            }
            Ok(scores)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_scorer_is_deterministic() -> Result<(), SearchError> {
        let scorer = OverlapCrossScorer;
        let documents = ["the quick brown fox", "brown fox jumps", "unrelated text"];
        let first = scorer.score("fox", &documents)?;
        let second = scorer.score("fox", &documents)?;

        assert_eq!(first, second);
        assert!(first[0] > first[2]);
        assert!(first[1] > first[2]);
        Ok(())
    }

    #[test]
    fn phrase_matches_outrank_scattered_terms() -> Result<(), SearchError> {
        let scorer = OverlapCrossScorer;
        let scores = scorer.score("brown fox", &["fox is brown", "a brown fox"])?;
        assert!(scores[1] > scores[0]);
        Ok(())
    }
}
