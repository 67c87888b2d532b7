use crate::cancel::CancelFlag;
use crate::embeddings::embed_one;
use crate::kb::{KbSnapshot, KnowledgeBase};
use crate::models::{RetrievalHit, RetrievalOptions};
use crate::registry::ModelRegistry;
use crate::SearchError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Dense retrieval with optional BM25 fusion and cross-encoder rerank.
///
/// Optional stages that fail fall back to the previous stage's ranking; only
/// the dense stage can fail a query.
pub struct Retriever {
    kb: Arc<KnowledgeBase>,
    registry: Arc<ModelRegistry>,
}

#[derive(Debug, Clone, Default)]
struct Candidate {
    dense: f64,
    lexical: Option<f64>,
    rerank: Option<f64>,
    score: f64,
}

impl Retriever {
    pub fn new(kb: Arc<KnowledgeBase>, registry: Arc<ModelRegistry>) -> Self {
        Self { kb, registry }
    }

    /// Ranks chunks for `query` and records a hit for each returned file.
    pub async fn search(
        &self,
        query: &str,
        options: &RetrievalOptions,
        cancel: &CancelFlag,
    ) -> Result<Vec<RetrievalHit>, SearchError> {
        self.rank(query, options, cancel, true).await
    }

    /// Dense-only lookup that leaves retrieval statistics untouched.
    pub async fn probe(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalHit>, SearchError> {
        let options = RetrievalOptions {
            top_k,
            candidate_k: top_k,
            enable_bm25: false,
            enable_rerank: false,
            ..RetrievalOptions::default()
        };
        self.rank(query, &options, &CancelFlag::new(), false).await
    }

    async fn rank(
        &self,
        query: &str,
        options: &RetrievalOptions,
        cancel: &CancelFlag,
        record_stats: bool,
    ) -> Result<Vec<RetrievalHit>, SearchError> {
        let query = query.trim();
        let snapshot = self.kb.snapshot();
        if query.is_empty() || options.top_k == 0 || snapshot.index().is_empty() {
            return Ok(Vec::new());
        }
        let candidate_k = options.candidate_k.max(options.top_k);

        checkpoint(cancel)?;
        let query_vector = {
            let embedder = self.kb.embedder();
            let text = query.to_string();
            tokio::task::spawn_blocking(move || embed_one(embedder.as_ref(), &text))
                .await
                .map_err(|error| SearchError::Request(error.to_string()))??
        };

        checkpoint(cancel)?;
        let mut candidates: BTreeMap<String, Candidate> = snapshot
            .index()
            .dense_search(&query_vector, candidate_k)?
            .into_iter()
            .map(|(chunk_id, similarity)| {
                let dense = f64::from(similarity);
                (
                    chunk_id,
                    Candidate {
                        dense,
                        score: dense,
                        ..Candidate::default()
                    },
                )
            })
            .collect();
        debug!(kb = self.kb.slug(), candidates = candidates.len(), "dense stage");

        if options.enable_bm25 {
            checkpoint(cancel)?;
            match lexical_scores(&snapshot, query, candidate_k) {
                Ok(lexical) => {
                    fuse(&snapshot, &query_vector, &mut candidates, &lexical, options);
                }
                Err(error) => {
                    warn!(kb = self.kb.slug(), kind = error.kind(), %error, "bm25 stage skipped");
                }
            }
        }

        if options.enable_rerank {
            checkpoint(cancel)?;
            if let Err(error) = self.rerank(&snapshot, query, &mut candidates, options).await {
                warn!(kb = self.kb.slug(), kind = error.kind(), %error, "rerank stage skipped");
            }
        }

        let mut ranked: Vec<(String, Candidate)> = candidates.into_iter().collect();
        ranked.sort_by(|left, right| {
            right
                .1
                .score
                .total_cmp(&left.1.score)
                .then_with(|| left.0.cmp(&right.0))
        });
        ranked.truncate(options.top_k);

        checkpoint(cancel)?;
        let hits: Vec<RetrievalHit> = ranked
            .into_iter()
            .filter_map(|(chunk_id, candidate)| {
                let entry = snapshot.index().entry(&chunk_id)?;
                Some(RetrievalHit {
                    text: entry.text.clone(),
                    source_name: entry.source_name.clone(),
                    page_index: entry.page_index,
                    score: candidate.score,
                    dense_score: candidate.dense,
                    lexical_score: candidate.lexical,
                    rerank_score: candidate.rerank,
                    file: snapshot.metadata().get_file(&entry.source_name).cloned(),
                    chunk_id,
                })
            })
            .collect();

        if record_stats && !hits.is_empty() {
            let stats: Vec<(String, f64)> = hits
                .iter()
                .map(|hit| (hit.source_name.clone(), hit.dense_score))
                .collect();
            if let Err(error) = snapshot.metadata().record_hits(&stats) {
                warn!(kb = self.kb.slug(), %error, "retrieval stats not recorded");
            }
        }

        Ok(hits)
    }

    async fn rerank(
        &self,
        snapshot: &KbSnapshot,
        query: &str,
        candidates: &mut BTreeMap<String, Candidate>,
        options: &RetrievalOptions,
    ) -> Result<(), SearchError> {
        let reranker = self.registry.reranker(&options.rerank_model)?;
        let ids: Vec<String> = candidates.keys().cloned().collect();
        let documents: Vec<String> = ids
            .iter()
            .map(|chunk_id| {
                snapshot
                    .index()
                    .entry(chunk_id)
                    .map(|entry| entry.text.clone())
                    .unwrap_or_default()
            })
            .collect();
        let query = query.to_string();

        let scores = tokio::task::spawn_blocking(move || {
            let documents: Vec<&str> = documents.iter().map(String::as_str).collect();
            reranker.score(&query, &documents)
        })
        .await
        .map_err(|error| SearchError::RerankerUnavailable(error.to_string()))??;

        if scores.len() != ids.len() {
            return Err(SearchError::RerankerUnavailable(format!(
                "{} scores for {} candidates",
                scores.len(),
                ids.len()
            )));
        }
        for (chunk_id, score) in ids.iter().zip(scores) {
            if let Some(candidate) = candidates.get_mut(chunk_id) {
                candidate.rerank = Some(f64::from(score));
                candidate.score = f64::from(score);
            }
        }
        Ok(())
    }
}

fn checkpoint(cancel: &CancelFlag) -> Result<(), SearchError> {
    if cancel.is_cancelled() {
        Err(SearchError::Cancelled)
    } else {
        Ok(())
    }
}

/// Raw BM25 scores for every chunk plus the ids of the lexical top `k`.
fn lexical_scores(
    snapshot: &KbSnapshot,
    query: &str,
    k: usize,
) -> Result<(HashMap<String, f64>, Vec<String>), SearchError> {
    let bm25 = snapshot.bm25();
    let all = bm25.score_all(query)?;
    let top = bm25.top_k(query, k)?.into_iter().map(|(chunk_id, _)| chunk_id).collect();
    Ok((all, top))
}

/// Unions the lexical top into the candidates and replaces scores with the weighted fusion.
fn fuse(
    snapshot: &KbSnapshot,
    query_vector: &[f32],
    candidates: &mut BTreeMap<String, Candidate>,
    lexical: &(HashMap<String, f64>, Vec<String>),
    options: &RetrievalOptions,
) {
    let (scores, top) = lexical;
    for chunk_id in top {
        if candidates.contains_key(chunk_id) {
            continue;
        }
        let dense = snapshot
            .index()
            .similarity(query_vector, chunk_id)
            .map(f64::from)
            .unwrap_or(0.0);
        candidates.insert(
            chunk_id.clone(),
            Candidate {
                dense,
                ..Candidate::default()
            },
        );
    }
    for (chunk_id, candidate) in candidates.iter_mut() {
        candidate.lexical = Some(scores.get(chunk_id).copied().unwrap_or(0.0));
    }

    let dense_range = range(candidates.values().map(|candidate| candidate.dense));
    let lexical_range = range(candidates.values().filter_map(|candidate| candidate.lexical));
    for candidate in candidates.values_mut() {
        let dense = min_max(candidate.dense, dense_range);
        let lexical = min_max(candidate.lexical.unwrap_or(0.0), lexical_range);
        candidate.score = options.dense_weight * dense + options.lexical_weight * lexical;
    }
}

fn range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), value| {
        (low.min(value), high.max(value))
    })
}

/// A flat range maps to 1.0 when positive, else 0.0.
fn min_max(value: f64, (low, high): (f64, f64)) -> f64 {
    if !low.is_finite() || !high.is_finite() {
        return 0.0;
    }
    if high - low <= f64::EPSILON {
        return if high > 0.0 { 1.0 } else { 0.0 };
    }
    (value - low) / (high - low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::make_chunk_id;
    use crate::embeddings::{Embedder, HashingEmbedder};
    use crate::models::{Chunk, FileRecord};
    use crate::rerank::Reranker;
    use chrono::Utc;
    use tempfile::{tempdir, TempDir};

    struct FailingReranker;

    impl Reranker for FailingReranker {
        fn name(&self) -> &str {
            "broken"
        }

        fn score(&self, _query: &str, _documents: &[&str]) -> Result<Vec<f32>, SearchError> {
            Err(SearchError::RerankerUnavailable("model file missing".to_string()))
        }
    }

    async fn kb_with(texts: &[&str]) -> Result<(TempDir, Arc<KnowledgeBase>), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new("E", 64));
        let kb = Arc::new(KnowledgeBase::create(dir.path(), "kb1", Arc::clone(&embedder))?);
        let writer = kb.lock_writer().await;
        let mut staged = kb.stage();
        for (position, text) in texts.iter().enumerate() {
            let hash = format!("hash{position}");
            let name = format!("doc{position}.txt");
            let chunk = Chunk {
                chunk_id: make_chunk_id(&hash, 0),
                source_name: name.clone(),
                content_hash: hash.clone(),
                chunk_index: 0,
                page_index: Some(0),
                offset: 0,
                text: text.to_string(),
                bounding_hint: None,
            };
            let vectors = embedder.embed_batch(&[chunk.text.clone()])?;
            let record = FileRecord {
                path: name.clone(),
                name,
                size: text.len() as u64,
                content_hash: hash,
                file_type: "txt".to_string(),
                language: "en".to_string(),
                category: "其他文档".to_string(),
                keywords: Vec::new(),
                summary: String::new(),
                chunk_ids: vec![chunk.chunk_id.clone()],
                aliases: Vec::new(),
                added_at: Utc::now(),
                updated_at: Utc::now(),
            };
            staged.add_file(record, &[chunk], &vectors)?;
        }
        kb.commit(&writer, staged)?;
        drop(writer);
        Ok((dir, kb))
    }

    #[test]
    fn flat_ranges_normalise_by_sign() {
        assert_eq!(min_max(0.5, (0.5, 0.5)), 1.0);
        assert_eq!(min_max(0.0, (0.0, 0.0)), 0.0);
        assert!((min_max(0.75, (0.5, 1.0)) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn empty_query_and_empty_kb_return_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, kb) = kb_with(&[]).await?;
        let retriever = Retriever::new(Arc::clone(&kb), Arc::new(ModelRegistry::new()));
        let options = RetrievalOptions::default();

        assert!(retriever.search("fox", &options, &CancelFlag::new()).await?.is_empty());
        assert!(retriever.search("   ", &options, &CancelFlag::new()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn hits_update_file_statistics() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, kb) = kb_with(&["the quick brown fox", "unrelated text"]).await?;
        let retriever = Retriever::new(Arc::clone(&kb), Arc::new(ModelRegistry::new()));
        let options = RetrievalOptions {
            top_k: 1,
            ..RetrievalOptions::default()
        };

        let hits = retriever.search("fox", &options, &CancelFlag::new()).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_name, "doc0.txt");
        let stats = kb.snapshot().metadata().stats("doc0.txt");
        assert_eq!(stats.map(|stats| stats.hit_count), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn probe_does_not_count_hits() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, kb) = kb_with(&["the quick brown fox"]).await?;
        let retriever = Retriever::new(Arc::clone(&kb), Arc::new(ModelRegistry::new()));

        assert_eq!(retriever.probe("fox", 2).await?.len(), 1);
        assert!(kb.snapshot().metadata().stats("doc0.txt").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn failing_reranker_keeps_fused_order() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, kb) = kb_with(&["the quick brown fox", "brown fox jumps", "unrelated text"]).await?;
        let registry = Arc::new(ModelRegistry::new());
        registry.insert_reranker(Arc::new(FailingReranker));
        let retriever = Retriever::new(Arc::clone(&kb), registry);

        let fused = RetrievalOptions {
            top_k: 3,
            enable_bm25: true,
            ..RetrievalOptions::default()
        };
        let with_broken_rerank = RetrievalOptions {
            enable_rerank: true,
            rerank_model: "broken".to_string(),
            ..fused.clone()
        };

        let expected: Vec<String> = retriever
            .search("fox", &fused, &CancelFlag::new())
            .await?
            .into_iter()
            .map(|hit| hit.chunk_id)
            .collect();
        let actual: Vec<String> = retriever
            .search("fox", &with_broken_rerank, &CancelFlag::new())
            .await?
            .into_iter()
            .map(|hit| hit.chunk_id)
            .collect();
        assert_eq!(expected, actual);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_query_stops_at_first_boundary() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, kb) = kb_with(&["the quick brown fox"]).await?;
        let retriever = Retriever::new(Arc::clone(&kb), Arc::new(ModelRegistry::new()));
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = retriever.search("fox", &RetrievalOptions::default(), &cancel).await;
        assert!(matches!(result, Err(SearchError::Cancelled)));
        Ok(())
    }
}
