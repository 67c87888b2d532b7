//! Okapi BM25 over chunk texts, tokenized with the shared tokenizer.

use crate::analysis::tokenize;
use crate::error::SearchError;
use std::collections::HashMap;

const K1: f64 = 1.5;
const B: f64 = 0.75;

#[derive(Debug, Clone)]
struct Posting {
    chunk_id: String,
    term_counts: HashMap<String, u32>,
    length: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Bm25Index {
    postings: Vec<Posting>,
    document_frequency: HashMap<String, usize>,
    average_length: f64,
}

impl Bm25Index {
    pub fn build<'a>(documents: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut postings = Vec::new();
        let mut document_frequency: HashMap<String, usize> = HashMap::new();

        for (chunk_id, text) in documents {
            let tokens = tokenize(text);
            let mut term_counts: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_counts.entry(token.clone()).or_default() += 1;
            }
            for term in term_counts.keys() {
                *document_frequency.entry(term.clone()).or_default() += 1;
            }
            postings.push(Posting {
                chunk_id: chunk_id.to_string(),
                term_counts,
                length: tokens.len(),
            });
        }

        let total_length: usize = postings.iter().map(|posting| posting.length).sum();
        let average_length = if postings.is_empty() {
            0.0
        } else {
            total_length as f64 / postings.len() as f64
        };

        Self {
            postings,
            document_frequency,
            average_length,
        }
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let total = self.postings.len() as f64;
        let frequency = self.document_frequency.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (total - frequency + 0.5) / (frequency + 0.5)).ln()
    }

    /// Scores every chunk against the query; zero-score chunks are included.
    pub fn score_all(&self, query: &str) -> Result<HashMap<String, f64>, SearchError> {
        if self.is_empty() {
            return Err(SearchError::Bm25Unavailable(
                "no chunk text to score".to_string(),
            ));
        }
        let terms = tokenize(query);
        if terms.is_empty() {
            return Err(SearchError::Bm25Unavailable(
                "query has no lexical terms".to_string(),
            ));
        }

        let weights: Vec<(String, f64)> = terms
            .into_iter()
            .map(|term| {
                let idf = self.idf(&term);
                (term, idf)
            })
            .collect();

        Ok(self
            .postings
            .iter()
            .map(|posting| {
                let norm = if self.average_length > 0.0 {
                    1.0 - B + B * posting.length as f64 / self.average_length
                } else {
                    1.0
                };
                let score = weights
                    .iter()
                    .map(|(term, idf)| {
                        let tf = posting.term_counts.get(term).copied().unwrap_or(0) as f64;
                        if tf == 0.0 {
                            0.0
                        } else {
                            idf * tf * (K1 + 1.0) / (tf + K1 * norm)
                        }
                    })
                    .sum();
                (posting.chunk_id.clone(), score)
            })
            .collect())
    }

    /// Best `k` chunks with a positive score, descending, ties by chunk id.
    pub fn top_k(&self, query: &str, k: usize) -> Result<Vec<(String, f64)>, SearchError> {
        let mut scored: Vec<(String, f64)> = self
            .score_all(query)?
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|left, right| right.1.total_cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> Bm25Index {
        Bm25Index::build([
            ("a", "the quick brown fox"),
            ("b", "brown fox jumps"),
            ("c", "unrelated text"),
        ])
    }

    #[test]
    fn matching_chunks_score_above_unrelated() -> Result<(), SearchError> {
        let scores = index().score_all("fox")?;
        assert!(scores["a"] > 0.0);
        assert!(scores["b"] > 0.0);
        assert_eq!(scores["c"], 0.0);
        Ok(())
    }

    #[test]
    fn shorter_documents_win_equal_term_frequency() -> Result<(), SearchError> {
        let top = index().top_k("fox", 3)?;
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, "b");
        Ok(())
    }

    #[test]
    fn empty_index_reports_unavailable() {
        let empty = Bm25Index::build(Vec::<(&str, &str)>::new());
        assert!(matches!(
            empty.score_all("fox"),
            Err(SearchError::Bm25Unavailable(_))
        ));
    }

    #[test]
    fn chinese_terms_are_matched_as_words() -> Result<(), SearchError> {
        let index = Bm25Index::build([("zh", "如何安装Python环境"), ("other", "财务报表分析")]);
        let top = index.top_k("安装", 2)?;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, "zh");
        Ok(())
    }
}
