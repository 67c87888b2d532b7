pub mod analysis;
pub mod cancel;
pub mod chunking;
pub mod config;
pub mod decoder;
pub mod embeddings;
pub mod error;
pub mod followup;
pub mod governor;
pub mod history;
pub mod ingest;
pub mod kb;
pub mod lexical;
pub mod llm;
pub mod models;
pub mod ocr;
pub mod registry;
pub mod rerank;
pub mod retriever;
pub mod service;
pub mod stores;
pub mod traits;

pub use cancel::CancelFlag;
pub use chunking::{build_chunks, PageText};
pub use config::{
    ChunkingConfig, Device, EmbedderConfig, FollowUpConfig, GovernorConfig, KbVaultConfig,
    LlmConfig, OcrConfig, RetrievalConfig, StorageConfig,
};
pub use decoder::{DecodeOptions, DecodeOutput, DecoderRegistry};
pub use embeddings::{Embedder, HashingEmbedder, HASHING_MODEL};
pub use error::{IndexError, IngestError, SampleError, SearchError};
pub use followup::FollowUpGenerator;
pub use governor::{ResourceGovernor, ResourceSample, ResourceSampler, ScriptedSampler, SystemSampler};
pub use history::{HistoryEntry, HistoryStore, Role};
pub use ingest::{
    FailureKind, IngestHandle, IngestIssue, IngestOutcome, IngestPipeline, IngestReport,
    IngestState, LogProgress, NoProgress, ProgressSink,
};
pub use kb::{CompactReport, KnowledgeBase};
pub use llm::ChatCompletionClient;
pub use models::{
    Chunk, FileRecord, FileStats, FollowUpOptions, IngestOptions, KbSummary, Manifest,
    RetrievalHit, RetrievalOptions,
};
pub use ocr::{OcrScheduler, TesseractEngine};
pub use registry::ModelRegistry;
pub use rerank::{OverlapCrossScorer, Reranker};
pub use retriever::Retriever;
pub use service::KnowledgeService;
pub use traits::{CompletionModel, OcrEngine};
