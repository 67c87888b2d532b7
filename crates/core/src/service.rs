//! Facade over every knowledge base under one storage root.
//!
//! Knowledge bases are opened lazily and cached; each keeps its own writer
//! lock, so ingestions into different bases run side by side while two
//! ingestions into the same base serialize at index-write time.

use crate::cancel::CancelFlag;
use crate::config::KbVaultConfig;
use crate::decoder::DecoderRegistry;
use crate::error::{IndexError, SearchError};
use crate::followup::FollowUpGenerator;
use crate::governor::{ResourceSampler, SystemSampler};
use crate::history::{HistoryEntry, HistoryStore};
use crate::ingest::{IngestHandle, IngestPipeline, ProgressSink};
use crate::kb::{CompactReport, KnowledgeBase};
use crate::llm::ChatCompletionClient;
use crate::models::{FileRecord, FileStats, FollowUpOptions, IngestOptions, KbSummary, RetrievalHit, RetrievalOptions};
use crate::ocr::TesseractEngine;
use crate::registry::ModelRegistry;
use crate::retriever::Retriever;
use crate::stores::MANIFEST_FILE;
use crate::traits::{CompletionModel, OcrEngine};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tracing::{info, warn};

const MAX_SLUG_CHARS: usize = 64;

pub struct KnowledgeService {
    config: StdRwLock<Arc<KbVaultConfig>>,
    llm: StdRwLock<Option<Arc<dyn CompletionModel>>>,
    registry: Arc<ModelRegistry>,
    sampler: Arc<dyn ResourceSampler>,
    ocr_engine: Arc<dyn OcrEngine>,
    decoders: Arc<DecoderRegistry>,
    open: RwLock<HashMap<String, Arc<KnowledgeBase>>>,
}

/// Slugs name directories: ASCII letters, digits, `-` and `_`, not starting with `-`.
pub fn validate_slug(slug: &str) -> Result<(), IndexError> {
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_CHARS
        && !slug.starts_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IndexError::InvalidSlug(slug.to_string()))
    }
}

fn read_lock<T: Clone>(lock: &StdRwLock<T>) -> T {
    match lock.read() {
        Ok(value) => value.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_lock<T>(lock: &StdRwLock<T>, value: T) {
    match lock.write() {
        Ok(mut slot) => *slot = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

fn llm_from_config(config: &KbVaultConfig) -> Option<Arc<dyn CompletionModel>> {
    let llm = config.llm.as_ref()?;
    match ChatCompletionClient::from_config(llm) {
        Ok(client) => Some(Arc::new(client)),
        Err(error) => {
            warn!(endpoint = %llm.endpoint, %error, "llm disabled");
            None
        }
    }
}

impl KnowledgeService {
    /// Builds a service with the host sampler, the tesseract engine and the configured LLM.
    pub fn new(config: KbVaultConfig) -> Result<Self, IndexError> {
        let llm = llm_from_config(&config);
        let ocr_engine: Arc<dyn OcrEngine> = Arc::new(TesseractEngine::new(config.ocr.tesseract_path.clone()));
        Self::with_components(
            config,
            ModelRegistry::shared(),
            Arc::new(SystemSampler::new()),
            ocr_engine,
            llm,
        )
    }

    pub fn with_components(
        config: KbVaultConfig,
        registry: Arc<ModelRegistry>,
        sampler: Arc<dyn ResourceSampler>,
        ocr_engine: Arc<dyn OcrEngine>,
        llm: Option<Arc<dyn CompletionModel>>,
    ) -> Result<Self, IndexError> {
        config.validate()?;
        Ok(Self {
            config: StdRwLock::new(Arc::new(config)),
            llm: StdRwLock::new(llm),
            registry,
            sampler,
            ocr_engine,
            decoders: Arc::new(DecoderRegistry::standard()),
            open: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> Arc<KbVaultConfig> {
        read_lock(&self.config)
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn history(&self) -> HistoryStore {
        HistoryStore::new(self.config().storage.history_dir())
    }

    fn kb_dir(&self, slug: &str) -> PathBuf {
        self.config().storage.root.join(slug)
    }

    pub async fn create_kb(&self, slug: &str) -> Result<KbSummary, IndexError> {
        validate_slug(slug)?;
        let config = self.config();
        let mut open = self.open.write().await;
        let dir = config.storage.root.join(slug);
        if open.contains_key(slug) || dir.join(MANIFEST_FILE).exists() {
            return Err(IndexError::KbExists(slug.to_string()));
        }
        let embedder = self.registry.embedder(&config.embedder)?;
        let kb = Arc::new(KnowledgeBase::create(&dir, slug, embedder)?);
        let summary = kb.summary();
        open.insert(slug.to_string(), kb);
        Ok(summary)
    }

    /// Returns the cached handle, opening the knowledge base on first use.
    pub async fn open_kb(&self, slug: &str) -> Result<Arc<KnowledgeBase>, IndexError> {
        validate_slug(slug)?;
        if let Some(kb) = self.open.read().await.get(slug) {
            return Ok(Arc::clone(kb));
        }

        let mut open = self.open.write().await;
        if let Some(kb) = open.get(slug) {
            return Ok(Arc::clone(kb));
        }
        let config = self.config();
        let embedder = self.registry.embedder(&config.embedder)?;
        let kb = Arc::new(KnowledgeBase::open(&config.storage.root.join(slug), slug, embedder)?);
        open.insert(slug.to_string(), Arc::clone(&kb));
        Ok(kb)
    }

    /// Removes the knowledge base directory and its chat history.
    pub async fn delete_kb(&self, slug: &str) -> Result<(), IndexError> {
        validate_slug(slug)?;
        let dir = self.kb_dir(slug);
        let mut open = self.open.write().await;
        if !dir.join(MANIFEST_FILE).exists() {
            open.remove(slug);
            return Err(IndexError::KbMissing(slug.to_string()));
        }
        if let Some(kb) = open.remove(slug) {
            let _writer = kb.lock_writer().await;
            tokio::fs::remove_dir_all(&dir).await?;
        } else {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        self.history().clear(slug)?;
        info!(kb = slug, "knowledge base deleted");
        Ok(())
    }

    pub fn list_kbs(&self) -> Result<Vec<String>, IndexError> {
        list_kb_dirs(&self.config().storage.root)
    }

    pub async fn kb_summary(&self, slug: &str) -> Result<KbSummary, IndexError> {
        Ok(self.open_kb(slug).await?.summary())
    }

    pub async fn ingest(
        &self,
        slug: &str,
        paths: Vec<PathBuf>,
        options: IngestOptions,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<IngestHandle, IndexError> {
        let kb = self.open_kb(slug).await?;
        let pipeline = IngestPipeline::new(
            kb,
            self.config(),
            Arc::clone(&self.decoders),
            Arc::clone(&self.ocr_engine),
            Arc::clone(&self.sampler),
        )
        .with_llm(read_lock(&self.llm));
        Ok(pipeline.spawn(paths, options, progress))
    }

    pub async fn query(
        &self,
        slug: &str,
        text: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalHit>, SearchError> {
        self.query_cancellable(slug, text, options, &CancelFlag::new()).await
    }

    /// Runs a query and appends the question to the knowledge base's history.
    pub async fn query_cancellable(
        &self,
        slug: &str,
        text: &str,
        options: &RetrievalOptions,
        cancel: &CancelFlag,
    ) -> Result<Vec<RetrievalHit>, SearchError> {
        let kb = self.open_kb(slug).await?;
        let hits = Retriever::new(kb, self.registry())
            .search(text, options, cancel)
            .await?;
        if let Err(error) = self.history().append(slug, HistoryEntry::user(text.trim())) {
            warn!(kb = slug, %error, "question not added to history");
        }
        Ok(hits)
    }

    /// Suggests next questions; recent history counts as already asked.
    pub async fn follow_up(&self, slug: &str, context: &str, options: &FollowUpOptions) -> Vec<String> {
        let config = self.config();
        let mut options = options.clone();
        match self.history().recent_questions(slug, config.follow_up.history_window) {
            Ok(mut recent) => {
                recent.append(&mut options.existing_questions);
                options.existing_questions = recent;
            }
            Err(error) => warn!(kb = slug, %error, "history unavailable for follow-ups"),
        }

        let mut generator = FollowUpGenerator::new(config.follow_up.clone()).with_llm(read_lock(&self.llm));
        if options.probe_retriever {
            match self.open_kb(slug).await {
                Ok(kb) => generator = generator.with_retriever(Retriever::new(kb, self.registry())),
                Err(error) => warn!(kb = slug, kind = error.kind(), %error, "follow-ups without retriever"),
            }
        }
        generator.generate(context, &options).await
    }

    pub async fn remove_file(&self, slug: &str, name: &str) -> Result<FileRecord, IndexError> {
        self.open_kb(slug).await?.remove_file(name).await
    }

    pub async fn list_files(&self, slug: &str) -> Result<Vec<FileRecord>, IndexError> {
        Ok(self.open_kb(slug).await?.list_files())
    }

    pub async fn compact(&self, slug: &str) -> Result<CompactReport, IndexError> {
        self.open_kb(slug).await?.compact().await
    }

    pub async fn hot_files(&self, slug: &str, k: usize) -> Result<Vec<(String, FileStats)>, IndexError> {
        Ok(self.open_kb(slug).await?.snapshot().metadata().hot_files(k))
    }

    pub async fn cold_files(&self, slug: &str, days: i64) -> Result<Vec<String>, IndexError> {
        Ok(self.open_kb(slug).await?.snapshot().metadata().cold_files(days))
    }

    pub async fn duplicates(&self, slug: &str) -> Result<Vec<Vec<String>>, IndexError> {
        Ok(self.open_kb(slug).await?.snapshot().metadata().find_duplicates())
    }

    /// Swaps configuration between operations; a changed embedder drops cached models and handles.
    pub async fn reload_config(&self, config: KbVaultConfig) -> Result<(), IndexError> {
        config.validate()?;
        let embedder_changed = self.config().embedder != config.embedder;
        let root_changed = self.config().storage.root != config.storage.root;
        write_lock(&self.llm, llm_from_config(&config));
        write_lock(&self.config, Arc::new(config));
        if embedder_changed || root_changed {
            self.close_all().await;
        }
        if embedder_changed {
            self.registry.release();
        }
        info!(embedder_changed, root_changed, "configuration reloaded");
        Ok(())
    }

    /// Flushes pending statistics, then drops cached models and knowledge-base handles.
    pub async fn shutdown(&self) {
        self.close_all().await;
        self.registry.release();
    }

    async fn close_all(&self) {
        let mut open = self.open.write().await;
        for (slug, kb) in open.drain() {
            if let Err(error) = kb.flush_stats() {
                warn!(kb = %slug, %error, "retrieval stats not saved");
            }
        }
    }
}

fn list_kb_dirs(root: &Path) -> Result<Vec<String>, IndexError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };
    let mut slugs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.path().join(MANIFEST_FILE).is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            slugs.push(name.to_string());
        }
    }
    slugs.sort();
    Ok(slugs)
}
