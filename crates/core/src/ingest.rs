//! Ingestion pipeline: scan, decode, OCR, chunk, embed, then one commit.
//!
//! Nothing becomes visible to queries until the manifest commit at the very
//! end, so a failed or cancelled run leaves the knowledge base exactly as it
//! was. Per-file and per-page problems are collected as issues and never stop
//! sibling files.

use crate::analysis::{
    categorize, detect_language, extract_keywords, extractive_summary, truncate_chars, MAX_KEYWORDS,
    SUMMARY_MAX_CHARS,
};
use crate::cancel::CancelFlag;
use crate::chunking::{build_chunks, PageText};
use crate::config::KbVaultConfig;
use crate::decoder::{normalized_extension, DecodeOptions, DecoderRegistry};
use crate::embeddings::embed_texts;
use crate::error::{IndexError, IngestError};
use crate::governor::{ResourceGovernor, ResourceSampler};
use crate::kb::KnowledgeBase;
use crate::models::{BoundingHint, Chunk, FileRecord, IngestOptions, PageContent};
use crate::ocr::OcrScheduler;
use crate::traits::{CompletionModel, OcrEngine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

const SUMMARY_PROMPT: &str = "用一句话概括下面的文档内容，不超过100个字，只输出概括本身。";
const SUMMARY_INPUT_CHARS: usize = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resource,
    Embedder,
    Index,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestState {
    Received,
    Scanned,
    Decoding,
    OcrScheduled,
    OcrComplete,
    Chunking,
    Embedding,
    IndexWrite,
    ManifestCommit,
    Done,
    Failed(FailureKind),
    Cancelled,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "RECEIVED",
            Self::Scanned => "SCANNED",
            Self::Decoding => "DECODING",
            Self::OcrScheduled => "OCR_SCHEDULED",
            Self::OcrComplete => "OCR_COMPLETE",
            Self::Chunking => "CHUNKING",
            Self::Embedding => "EMBEDDING",
            Self::IndexWrite => "INDEX_WRITE",
            Self::ManifestCommit => "MANIFEST_COMMIT",
            Self::Done => "DONE",
            Self::Failed(kind) => return write!(f, "FAILED({kind:?})"),
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestOutcome {
    Done,
    Failed(FailureKind),
    Cancelled,
}

impl IngestOutcome {
    fn state(self) -> IngestState {
        match self {
            Self::Done => IngestState::Done,
            Self::Failed(kind) => IngestState::Failed(kind),
            Self::Cancelled => IngestState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestIssue {
    pub file: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub job_id: Uuid,
    pub kb: String,
    pub outcome: IngestOutcome,
    /// Files whose chunks were written by this run.
    pub indexed: Vec<String>,
    /// Files already present with identical bytes.
    pub unchanged: Vec<String>,
    /// Names recorded as aliases of an existing file with identical bytes.
    pub aliased: Vec<String>,
    pub chunks_added: usize,
    pub ocr_pages: usize,
    pub issues: Vec<IngestIssue>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestReport {
    fn new(job_id: Uuid, kb: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            kb: kb.to_string(),
            outcome: IngestOutcome::Done,
            indexed: Vec::new(),
            unchanged: Vec::new(),
            aliased: Vec::new(),
            chunks_added: 0,
            ocr_pages: 0,
            issues: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome == IngestOutcome::Done
    }
}

/// Receives every state transition of an ingestion.
pub trait ProgressSink: Send + Sync {
    fn on_state(&self, job_id: Uuid, state: IngestState);

    fn on_file(&self, _job_id: Uuid, _file: &str, _state: IngestState) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_state(&self, _job_id: Uuid, _state: IngestState) {}
}

/// Logs transitions at info level.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_state(&self, job_id: Uuid, state: IngestState) {
        info!(job = %job_id, %state, "ingestion progress");
    }

    fn on_file(&self, job_id: Uuid, file: &str, state: IngestState) {
        debug!(job = %job_id, file, %state, "file progress");
    }
}

pub struct IngestHandle {
    id: Uuid,
    kb: String,
    cancel: CancelFlag,
    task: JoinHandle<IngestReport>,
}

impl IngestHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests cooperative cancellation; takes effect at the next stage boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> IngestReport {
        match self.task.await {
            Ok(report) => report,
            Err(error) => {
                let mut report = IngestReport::new(self.id, &self.kb);
                report.outcome = IngestOutcome::Failed(FailureKind::Io);
                report.issues.push(IngestIssue {
                    file: String::new(),
                    kind: "Io".to_string(),
                    message: format!("ingestion task aborted: {error}"),
                });
                report.finished_at = Utc::now();
                report
            }
        }
    }
}

/// Lists files under `root`, sorted by path, skipping hidden entries below the root.
pub fn discover_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(DirEntry::into_path)
        .collect()
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    Ok(digest_bytes(&std::fs::read(path)?))
}

enum Halt {
    Cancelled,
    Failed(FailureKind, IngestError),
}

fn checkpoint(cancel: &CancelFlag) -> Result<(), Halt> {
    if cancel.is_cancelled() {
        Err(Halt::Cancelled)
    } else {
        Ok(())
    }
}

fn index_failure(error: IndexError) -> Halt {
    let kind = match error {
        IndexError::Io(_) => FailureKind::Io,
        _ => FailureKind::Index,
    };
    Halt::Failed(kind, error.into())
}

struct Job {
    id: Uuid,
    progress: Arc<dyn ProgressSink>,
    report: IngestReport,
    warned: HashSet<&'static str>,
}

impl Job {
    fn enter(&mut self, state: IngestState) {
        debug!(job = %self.id, kb = %self.report.kb, %state, "ingestion state");
        self.progress.on_state(self.id, state);
    }

    fn file(&self, name: &str, state: IngestState) {
        self.progress.on_file(self.id, name, state);
    }

    fn issue(&mut self, file: &str, kind: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(job = %self.id, file, kind, %message, "ingestion issue");
        self.report.issues.push(IngestIssue {
            file: file.to_string(),
            kind: kind.to_string(),
            message,
        });
    }

    /// Optional downgrades are logged once per ingestion.
    fn warn_once(&mut self, key: &'static str, message: &str) {
        if self.warned.insert(key) {
            warn!(job = %self.id, kb = %self.report.kb, key, message, "optional step downgraded");
        }
    }
}

/// A source that needs decoding, chunking and embedding.
struct PendingFile {
    path: PathBuf,
    name: String,
    content_hash: String,
    size: u64,
    file_type: String,
    pages: Vec<PageText>,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
    record: Option<FileRecord>,
}

/// Identical bytes already known under `target`.
struct AliasOf {
    target: String,
    alias: String,
}

pub struct IngestPipeline {
    kb: Arc<KnowledgeBase>,
    config: Arc<KbVaultConfig>,
    decoders: Arc<DecoderRegistry>,
    ocr_engine: Arc<dyn OcrEngine>,
    sampler: Arc<dyn ResourceSampler>,
    llm: Option<Arc<dyn CompletionModel>>,
}

impl IngestPipeline {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        config: Arc<KbVaultConfig>,
        decoders: Arc<DecoderRegistry>,
        ocr_engine: Arc<dyn OcrEngine>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            kb,
            config,
            decoders,
            ocr_engine,
            sampler,
            llm: None,
        }
    }

    pub fn with_llm(mut self, llm: Option<Arc<dyn CompletionModel>>) -> Self {
        self.llm = llm;
        self
    }

    /// Runs the pipeline on a background task.
    pub fn spawn(
        self,
        paths: Vec<PathBuf>,
        options: IngestOptions,
        progress: Arc<dyn ProgressSink>,
    ) -> IngestHandle {
        let id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        let kb = self.kb.slug().to_string();
        let task = tokio::spawn(self.run(id, paths, options, progress, cancel.clone()));
        IngestHandle { id, kb, cancel, task }
    }

    pub async fn run(
        self,
        job_id: Uuid,
        paths: Vec<PathBuf>,
        options: IngestOptions,
        progress: Arc<dyn ProgressSink>,
        cancel: CancelFlag,
    ) -> IngestReport {
        let mut job = Job {
            id: job_id,
            progress,
            report: IngestReport::new(job_id, self.kb.slug()),
            warned: HashSet::new(),
        };

        let outcome = match self.execute(&mut job, paths, options, &cancel).await {
            Ok(()) => IngestOutcome::Done,
            Err(Halt::Cancelled) => IngestOutcome::Cancelled,
            Err(Halt::Failed(kind, error)) => {
                job.issue("", error.kind(), error.to_string());
                IngestOutcome::Failed(kind)
            }
        };
        job.enter(outcome.state());

        let mut report = job.report;
        report.outcome = outcome;
        report.finished_at = Utc::now();
        info!(
            job = %job_id,
            kb = %report.kb,
            outcome = ?report.outcome,
            indexed = report.indexed.len(),
            unchanged = report.unchanged.len(),
            chunks = report.chunks_added,
            issues = report.issues.len(),
            "ingestion finished"
        );
        report
    }

    async fn execute(
        &self,
        job: &mut Job,
        paths: Vec<PathBuf>,
        options: IngestOptions,
        cancel: &CancelFlag,
    ) -> Result<(), Halt> {
        job.enter(IngestState::Received);
        let sources = scan(job, &paths);
        job.enter(IngestState::Scanned);
        checkpoint(cancel)?;

        job.enter(IngestState::Decoding);
        let snapshot = self.kb.snapshot();
        let decode_options = DecodeOptions {
            use_ocr: options.use_ocr,
            generate_summary: options.generate_summary,
            min_text_chars: self.config.ocr.min_text_chars,
        };
        let mut scheduler = OcrScheduler::new(Arc::clone(&self.ocr_engine), self.config.ocr.clone());
        let mut pending: Vec<PendingFile> = Vec::new();
        let mut unchanged: Vec<String> = Vec::new();
        let mut aliases: Vec<AliasOf> = Vec::new();
        let mut claimed: HashMap<String, String> = HashMap::new();

        for path in sources {
            checkpoint(cancel)?;
            let display = path.display().to_string();
            let Some(name) = path.file_name().and_then(|name| name.to_str()).map(str::to_string) else {
                job.issue(&display, "Io", IngestError::MissingFileName(display.clone()).to_string());
                continue;
            };
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    job.issue(&name, "SourceMissing", IngestError::SourceMissing(display).to_string());
                    continue;
                }
                Err(error) => {
                    job.issue(&name, "Io", error.to_string());
                    continue;
                }
            };
            let content_hash = digest_bytes(&bytes);

            if let Some(target) = claimed.get(&content_hash) {
                if *target != name {
                    aliases.push(AliasOf {
                        target: target.clone(),
                        alias: name,
                    });
                }
                continue;
            }
            match snapshot.metadata().find_by_hash(&content_hash) {
                Some(existing) if existing.name == name => {
                    claimed.insert(content_hash, name.clone());
                    unchanged.push(name);
                    continue;
                }
                Some(existing) => {
                    aliases.push(AliasOf {
                        target: existing.name.clone(),
                        alias: name.clone(),
                    });
                    claimed.insert(content_hash, existing.name.clone());
                    continue;
                }
                None => {}
            }

            job.file(&name, IngestState::Decoding);
            let decoded = {
                let decoders = Arc::clone(&self.decoders);
                let path = path.clone();
                tokio::task::spawn_blocking(move || decoders.decode(&path, &decode_options)).await
            };
            let output = match decoded {
                Ok(Ok(output)) => output,
                Ok(Err(error)) => {
                    job.issue(&name, error.kind(), error.to_string());
                    continue;
                }
                Err(error) => {
                    job.issue(&name, "DecoderPartialFailure", error.to_string());
                    continue;
                }
            };
            for failure in &output.page_failures {
                let error = IngestError::DecoderPartialFailure {
                    path: display.clone(),
                    page_index: failure.page_index,
                    details: failure.details.clone(),
                };
                job.issue(&name, error.kind(), error.to_string());
            }

            let task_id = pending.len().to_string();
            let mut pages = Vec::with_capacity(output.pages.len());
            for page in output.pages {
                match page.content {
                    PageContent::Text(text) => pages.push(PageText::plain(page.page_index, text)),
                    PageContent::Image(image) => {
                        pages.push(PageText {
                            page_index: Some(page.page_index),
                            text: String::new(),
                            bounding_hint: Some(BoundingHint {
                                x: 0,
                                y: 0,
                                width: image.width(),
                                height: image.height(),
                            }),
                            from_ocr: true,
                        });
                        scheduler.enqueue(task_id.clone(), image, page.page_index);
                    }
                }
            }

            claimed.insert(content_hash.clone(), name.clone());
            pending.push(PendingFile {
                file_type: normalized_extension(&path),
                path,
                name,
                content_hash,
                size: bytes.len() as u64,
                pages,
                chunks: Vec::new(),
                vectors: Vec::new(),
                record: None,
            });
        }

        if scheduler.pending() > 0 {
            checkpoint(cancel)?;
            job.enter(IngestState::OcrScheduled);
            self.recognize(job, &mut scheduler, &mut pending, cancel).await?;
            job.enter(IngestState::OcrComplete);
        }

        checkpoint(cancel)?;
        job.enter(IngestState::Chunking);
        let mut chunked = Vec::with_capacity(pending.len());
        for mut file in pending {
            checkpoint(cancel)?;
            job.file(&file.name, IngestState::Chunking);
            match build_chunks(&file.name, &file.content_hash, &file.pages, self.config.chunking) {
                Ok(chunks) => file.chunks = chunks,
                Err(error) => {
                    job.issue(&file.name, error.kind(), error.to_string());
                    continue;
                }
            }
            let record = self.describe(job, &file, options.generate_summary).await;
            file.record = Some(record);
            chunked.push(file);
        }

        checkpoint(cancel)?;
        job.enter(IngestState::Embedding);
        let batch_size = self.config.embedder.effective_batch_size();
        for file in &mut chunked {
            checkpoint(cancel)?;
            if file.chunks.is_empty() {
                continue;
            }
            job.file(&file.name, IngestState::Embedding);
            let embedder = self.kb.embedder();
            let texts: Vec<String> = file.chunks.iter().map(|chunk| chunk.text.clone()).collect();
            let embedded = tokio::task::spawn_blocking(move || embed_texts(embedder.as_ref(), &texts, batch_size))
                .await
                .map_err(|error| {
                    Halt::Failed(
                        FailureKind::Embedder,
                        IndexError::EmbedderUnavailable(error.to_string()).into(),
                    )
                })?;
            file.vectors = embedded.map_err(|error| Halt::Failed(FailureKind::Embedder, error.into()))?;
        }

        checkpoint(cancel)?;
        job.enter(IngestState::IndexWrite);
        let writer = self.kb.lock_writer().await;
        let mut staged = self.kb.stage();

        for name in &unchanged {
            staged.touch_file(name);
        }
        for file in chunked {
            let Some(mut record) = file.record else {
                continue;
            };
            if let Some(owner) = staged
                .metadata
                .find_by_hash(&file.content_hash)
                .filter(|owner| owner.name != file.name)
                .map(|owner| owner.name.clone())
            {
                aliases.push(AliasOf {
                    target: owner,
                    alias: file.name,
                });
                continue;
            }
            if let Some(previous) = staged.remove_file(&file.name) {
                record.added_at = previous.added_at;
                record.aliases = previous.aliases;
            }
            staged
                .add_file(record, &file.chunks, &file.vectors)
                .map_err(index_failure)?;
            job.report.chunks_added += file.chunks.len();
            job.report.indexed.push(file.name);
        }
        for AliasOf { target, alias } in aliases {
            // A record of the same name with other bytes is superseded by the alias.
            if alias != target && staged.metadata.get_file(&alias).is_some() {
                staged.remove_file(&alias);
            }
            if staged.add_alias(&target, &alias) {
                job.report.aliased.push(alias);
            } else {
                job.issue(&alias, "FileMissing", format!("alias target {target} is not indexed"));
            }
        }

        checkpoint(cancel)?;
        job.enter(IngestState::ManifestCommit);
        self.kb.commit(&writer, staged).map_err(index_failure)?;
        job.report.unchanged = unchanged;
        Ok(())
    }

    /// Runs every queued page through one governed OCR pass and fills the page texts.
    async fn recognize(
        &self,
        job: &mut Job,
        scheduler: &mut OcrScheduler,
        pending: &mut [PendingFile],
        cancel: &CancelFlag,
    ) -> Result<(), Halt> {
        let governor = Arc::new(ResourceGovernor::new(
            self.config.governor.clone(),
            Arc::clone(&self.sampler),
        ));
        let run = scheduler
            .run(governor, cancel)
            .await
            .map_err(|error| Halt::Failed(FailureKind::Io, error))?;

        if run.emergency_stopped {
            return Err(Halt::Failed(FailureKind::Resource, IngestError::EmergencyStop));
        }
        if run.cancelled {
            return Err(Halt::Cancelled);
        }

        for failure in &run.failures {
            let name = task_file(pending, &failure.task_id);
            job.issue(
                &name,
                "OCRWorkerCrash",
                format!("page {}: {}", failure.page_index, failure.details),
            );
        }
        for (position, file) in pending.iter_mut().enumerate() {
            let task_id = position.to_string();
            for page in file.pages.iter_mut().filter(|page| page.from_ocr) {
                if let Some(text) = page.page_index.and_then(|index| run.text(&task_id, index)) {
                    page.text = text.to_string();
                    job.report.ocr_pages += 1;
                }
            }
        }
        Ok(())
    }

    async fn describe(&self, job: &mut Job, file: &PendingFile, generate_summary: bool) -> FileRecord {
        let text = file
            .pages
            .iter()
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let summary = if generate_summary {
            self.summarize(job, &text).await
        } else {
            String::new()
        };
        let now = Utc::now();
        FileRecord {
            path: file.path.display().to_string(),
            name: file.name.clone(),
            size: file.size,
            content_hash: file.content_hash.clone(),
            file_type: file.file_type.clone(),
            language: detect_language(&text).to_string(),
            category: categorize(&file.name, &text).to_string(),
            keywords: extract_keywords(&text, MAX_KEYWORDS),
            summary,
            chunk_ids: file.chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect(),
            aliases: Vec::new(),
            added_at: now,
            updated_at: now,
        }
    }

    /// One-line LLM summary, falling back to the first sentence.
    async fn summarize(&self, job: &mut Job, text: &str) -> String {
        let fallback = || extractive_summary(text);
        let Some(llm) = &self.llm else {
            return fallback();
        };
        if text.trim().is_empty() {
            return String::new();
        }
        let input = truncate_chars(text, SUMMARY_INPUT_CHARS);
        let timeout = Duration::from_secs(self.config.follow_up.timeout_s);
        match tokio::time::timeout(timeout, llm.complete(SUMMARY_PROMPT, &input)).await {
            Ok(Ok(summary)) if !summary.trim().is_empty() => truncate_chars(summary.trim(), SUMMARY_MAX_CHARS),
            Ok(Ok(_)) => fallback(),
            Ok(Err(error)) => {
                job.warn_once("summary", &error.to_string());
                fallback()
            }
            Err(_) => {
                job.warn_once("summary", "summary request timed out");
                fallback()
            }
        }
    }
}

/// Expands directories and drops duplicates; missing paths become issues.
fn scan(job: &mut Job, paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for path in paths {
        let found = if path.is_dir() {
            discover_files(path)
        } else if path.is_file() {
            vec![path.clone()]
        } else {
            let display = path.display().to_string();
            job.issue(&display, "SourceMissing", IngestError::SourceMissing(display.clone()).to_string());
            continue;
        };
        for file in found {
            if seen.insert(file.clone()) {
                sources.push(file);
            }
        }
    }
    debug!(files = sources.len(), "scan complete");
    sources
}

fn task_file(pending: &[PendingFile], task_id: &str) -> String {
    task_id
        .parse::<usize>()
        .ok()
        .and_then(|position| pending.get(position))
        .map(|file| file.name.clone())
        .unwrap_or_else(|| task_id.to_string())
}
