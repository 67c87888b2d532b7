//! A live knowledge base: an immutable snapshot for readers, swapped whole on commit.
//!
//! Writers take the per-KB async mutex, clone the snapshot into
//! [`StagedChanges`], mutate it freely and hand it to
//! [`KnowledgeBase::commit`]. Readers hold an `Arc` to whichever snapshot was
//! current when they started, so a query never observes a half-applied batch.

use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::lexical::Bm25Index;
use crate::models::{Chunk, FileRecord, KbSummary};
use crate::stores::{IndexStore, MetadataStore, MANIFEST_FILE};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

pub struct KbSnapshot {
    index: IndexStore,
    metadata: MetadataStore,
    bm25: OnceLock<Bm25Index>,
}

impl KbSnapshot {
    fn new(index: IndexStore, metadata: MetadataStore) -> Self {
        Self {
            index,
            metadata,
            bm25: OnceLock::new(),
        }
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Lexical index over this snapshot's chunks, built on first use.
    pub fn bm25(&self) -> &Bm25Index {
        self.bm25.get_or_init(|| {
            Bm25Index::build(
                self.index
                    .entries()
                    .map(|(chunk_id, entry)| (chunk_id.as_str(), entry.text.as_str())),
            )
        })
    }
}

/// A private copy of the current snapshot that a writer mutates before commit.
pub struct StagedChanges {
    pub index: IndexStore,
    pub metadata: MetadataStore,
}

impl StagedChanges {
    /// Adds a file's chunks and record; chunk ids already indexed are kept as is.
    pub fn add_file(&mut self, record: FileRecord, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        self.index.add(chunks, vectors)?;
        self.metadata.put_file(record);
        Ok(())
    }

    /// Drops a record and every chunk no remaining record references.
    pub fn remove_file(&mut self, name: &str) -> Option<FileRecord> {
        let removed = self.metadata.remove_file(name)?;
        let live = self.metadata.live_chunk_ids();
        let dropped: HashSet<String> = removed
            .chunk_ids
            .iter()
            .filter(|chunk_id| !live.contains(*chunk_id))
            .cloned()
            .collect();
        self.index.remove_chunks(&dropped);
        Some(removed)
    }

    /// Marks an existing record as seen again without re-indexing it.
    pub fn touch_file(&mut self, name: &str) -> bool {
        match self.metadata.get_file_mut(name) {
            Some(record) => {
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Records `alias` as another name for the file stored under `name`.
    pub fn add_alias(&mut self, name: &str, alias: &str) -> bool {
        match self.metadata.get_file_mut(name) {
            Some(record) => {
                if record.name != alias && !record.aliases.iter().any(|known| known == alias) {
                    record.aliases.push(alias.to_string());
                }
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactReport {
    pub orphan_chunks: usize,
    pub pruned_stats: usize,
}

pub struct KnowledgeBase {
    slug: String,
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    state: RwLock<Arc<KbSnapshot>>,
    writer: Mutex<()>,
}

impl KnowledgeBase {
    pub fn create(dir: &Path, slug: &str, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        if dir.join(MANIFEST_FILE).exists() {
            return Err(IndexError::KbExists(slug.to_string()));
        }
        let index = IndexStore::create(dir, embedder.name(), embedder.dim())?;
        let metadata = MetadataStore::load(dir, index.generation())?;
        metadata.save_files(index.generation())?;
        metadata.save_stats()?;
        info!(kb = slug, model = embedder.name(), dim = embedder.dim(), "knowledge base created");
        Ok(Self::assemble(dir, slug, embedder, index, metadata))
    }

    pub fn open(dir: &Path, slug: &str, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        if !dir.join(MANIFEST_FILE).exists() {
            return Err(IndexError::KbMissing(slug.to_string()));
        }
        let index = IndexStore::open(dir, embedder.name(), embedder.dim())?;
        let metadata = MetadataStore::load(dir, index.generation())?;
        Ok(Self::assemble(dir, slug, embedder, index, metadata))
    }

    fn assemble(
        dir: &Path,
        slug: &str,
        embedder: Arc<dyn Embedder>,
        index: IndexStore,
        metadata: MetadataStore,
    ) -> Self {
        Self {
            slug: slug.to_string(),
            dir: dir.to_path_buf(),
            embedder,
            state: RwLock::new(Arc::new(KbSnapshot::new(index, metadata))),
            writer: Mutex::new(()),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    pub fn snapshot(&self) -> Arc<KbSnapshot> {
        match self.state.read() {
            Ok(state) => Arc::clone(&state),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Serializes writers to this knowledge base.
    pub async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub fn stage(&self) -> StagedChanges {
        let snapshot = self.snapshot();
        StagedChanges {
            index: snapshot.index.clone(),
            metadata: snapshot.metadata.clone(),
        }
    }

    /// Persists staged changes and publishes them.
    ///
    /// Docstore, vectors and file metadata go to files of the next generation;
    /// renaming the manifest that names them is the commit point. A failure
    /// before that rename leaves the previous generation on disk and in memory.
    pub fn commit(&self, _writer: &MutexGuard<'_, ()>, staged: StagedChanges) -> Result<(), IndexError> {
        let StagedChanges { mut index, metadata } = staged;
        let generation = index.generation() + 1;
        index.refresh_manifest(metadata.files());
        index.persist_data(generation)?;
        metadata.save_files(generation)?;
        let previous = index.persist_manifest(generation)?;

        index.remove_generation(previous);
        metadata.remove_generation(previous);
        metadata.prune_stats();
        if let Err(error) = metadata.flush_stats() {
            warn!(kb = %self.slug, %error, "retrieval stats not saved");
        }

        info!(
            kb = %self.slug,
            generation,
            files = index.manifest().file_count,
            chunks = index.chunk_count(),
            "manifest committed"
        );
        let next = Arc::new(KbSnapshot::new(index, metadata));
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }

    pub fn summary(&self) -> KbSummary {
        let snapshot = self.snapshot();
        let manifest = snapshot.index.manifest();
        KbSummary {
            slug: self.slug.clone(),
            embedding_model: manifest.embedding_model.clone(),
            embedding_dim: manifest.embedding_dim,
            file_count: manifest.file_count,
            chunk_count: snapshot.index.chunk_count(),
            total_size: manifest.total_size,
            created_at: manifest.created_at,
        }
    }

    /// Writes retrieval statistics still held in memory.
    pub fn flush_stats(&self) -> Result<(), IndexError> {
        self.snapshot().metadata.flush_stats()
    }

    pub fn list_files(&self) -> Vec<FileRecord> {
        self.snapshot().metadata.files().cloned().collect()
    }

    pub async fn remove_file(&self, name: &str) -> Result<FileRecord, IndexError> {
        let writer = self.lock_writer().await;
        let mut staged = self.stage();
        let removed = staged
            .remove_file(name)
            .ok_or_else(|| IndexError::FileMissing(name.to_string()))?;
        self.commit(&writer, staged)?;
        info!(kb = %self.slug, file = name, chunks = removed.chunk_ids.len(), "file removed");
        Ok(removed)
    }

    /// Drops chunks no record references and statistics of removed files.
    pub async fn compact(&self) -> Result<CompactReport, IndexError> {
        let writer = self.lock_writer().await;
        let mut staged = self.stage();
        let orphans = staged.index.orphans(&staged.metadata.live_chunk_ids());
        staged.index.remove_chunks(&orphans);
        let pruned_stats = staged.metadata.stale_stats();
        self.commit(&writer, staged)?;

        let report = CompactReport {
            orphan_chunks: orphans.len(),
            pruned_stats,
        };
        info!(kb = %self.slug, orphans = report.orphan_chunks, pruned = report.pruned_stats, "compacted");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::make_chunk_id;
    use crate::embeddings::HashingEmbedder;
    use crate::stores::vector_file;
    use tempfile::tempdir;

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::new("E", 16))
    }

    fn file(name: &str, hash: &str, texts: &[&str]) -> (FileRecord, Vec<Chunk>, Vec<Vec<f32>>) {
        let embedder = HashingEmbedder::new("E", 16);
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                chunk_id: make_chunk_id(hash, index as u64),
                source_name: name.to_string(),
                content_hash: hash.to_string(),
                chunk_index: index as u64,
                page_index: Some(0),
                offset: 0,
                text: text.to_string(),
                bounding_hint: None,
            })
            .collect();
        let vectors = chunks.iter().map(|chunk| embedder.embed_text(&chunk.text)).collect();
        let record = FileRecord {
            path: format!("/docs/{name}"),
            name: name.to_string(),
            size: texts.iter().map(|text| text.len() as u64).sum(),
            content_hash: hash.to_string(),
            file_type: "txt".to_string(),
            language: "en".to_string(),
            category: "其他文档".to_string(),
            keywords: Vec::new(),
            summary: String::new(),
            chunk_ids: chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect(),
            aliases: Vec::new(),
            added_at: Utc::now(),
            updated_at: Utc::now(),
        };
        (record, chunks, vectors)
    }

    #[tokio::test]
    async fn create_rejects_existing_and_open_requires_manifest() -> Result<(), IndexError> {
        let dir = tempdir()?;
        let kb_dir = dir.path().join("kb1");
        KnowledgeBase::create(&kb_dir, "kb1", embedder())?;

        assert!(matches!(
            KnowledgeBase::create(&kb_dir, "kb1", embedder()),
            Err(IndexError::KbExists(_))
        ));
        assert!(matches!(
            KnowledgeBase::open(&dir.path().join("nope"), "nope", embedder()),
            Err(IndexError::KbMissing(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn readers_keep_their_snapshot_across_commits() -> Result<(), IndexError> {
        let dir = tempdir()?;
        let kb = KnowledgeBase::create(dir.path(), "kb1", embedder())?;
        let before = kb.snapshot();

        let writer = kb.lock_writer().await;
        let mut staged = kb.stage();
        let (record, chunks, vectors) = file("a.txt", "h1", &["alpha text", "beta text"]);
        staged.add_file(record, &chunks, &vectors)?;
        kb.commit(&writer, staged)?;
        drop(writer);

        assert_eq!(before.index().chunk_count(), 0);
        assert_eq!(kb.snapshot().index().chunk_count(), 2);
        assert_eq!(kb.summary().file_count, 1);

        let reopened = KnowledgeBase::open(dir.path(), "kb1", embedder())?;
        assert_eq!(reopened.snapshot().index().chunk_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn remove_then_compact() -> Result<(), IndexError> {
        let dir = tempdir()?;
        let kb = KnowledgeBase::create(dir.path(), "kb1", embedder())?;
        {
            let writer = kb.lock_writer().await;
            let mut staged = kb.stage();
            let (record, chunks, vectors) = file("a.txt", "h1", &["alpha"]);
            staged.add_file(record, &chunks, &vectors)?;
            let (record, chunks, vectors) = file("b.txt", "h2", &["beta"]);
            staged.add_file(record, &chunks, &vectors)?;
            kb.commit(&writer, staged)?;
        }

        let removed = kb.remove_file("a.txt").await?;
        assert_eq!(removed.name, "a.txt");
        assert_eq!(kb.snapshot().index().chunk_count(), 1);
        assert!(matches!(kb.remove_file("a.txt").await, Err(IndexError::FileMissing(_))));

        let report = kb.compact().await?;
        assert_eq!(report.orphan_chunks, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_commit_leaves_previous_generation() -> Result<(), IndexError> {
        let dir = tempdir()?;
        let kb = KnowledgeBase::create(dir.path(), "kb1", embedder())?;
        {
            let writer = kb.lock_writer().await;
            let mut staged = kb.stage();
            let (record, chunks, vectors) = file("a.txt", "h1", &["alpha"]);
            staged.add_file(record, &chunks, &vectors)?;
            kb.commit(&writer, staged)?;
        }
        assert!(!dir.path().join(vector_file(0)).exists());
        assert!(dir.path().join(vector_file(1)).exists());
        kb.snapshot().metadata().record_hit("a.txt", 0.9)?;

        std::fs::create_dir(dir.path().join(vector_file(2)))?;
        assert!(kb.remove_file("a.txt").await.is_err());

        assert_eq!(kb.summary().file_count, 1);
        assert!(kb.snapshot().metadata().stats("a.txt").is_some());
        let reopened = KnowledgeBase::open(dir.path(), "kb1", embedder())?;
        assert_eq!(reopened.snapshot().index().generation(), 1);
        assert_eq!(reopened.snapshot().index().chunk_count(), 1);
        assert_eq!(reopened.list_files().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn commit_prunes_stats_of_removed_files() -> Result<(), IndexError> {
        let dir = tempdir()?;
        let kb = KnowledgeBase::create(dir.path(), "kb1", embedder())?;
        {
            let writer = kb.lock_writer().await;
            let mut staged = kb.stage();
            let (record, chunks, vectors) = file("a.txt", "h1", &["alpha"]);
            staged.add_file(record, &chunks, &vectors)?;
            kb.commit(&writer, staged)?;
        }
        kb.snapshot().metadata().record_hit("a.txt", 0.9)?;

        kb.remove_file("a.txt").await?;
        assert!(kb.snapshot().metadata().stats("a.txt").is_none());
        let reopened = KnowledgeBase::open(dir.path(), "kb1", embedder())?;
        assert!(reopened.snapshot().metadata().stats("a.txt").is_none());
        Ok(())
    }
}
