use crate::error::IndexError;
use crate::models::{FollowUpOptions, RetrievalOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KbVaultConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub follow_up: FollowUpConfig,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

impl KbVaultConfig {
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|error| {
            IndexError::InvalidConfig(format!("{}: {error}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.chunking.chunk_size == 0 {
            return Err(IndexError::InvalidConfig(
                "chunking.chunk_size must be > 0".to_string(),
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(IndexError::InvalidConfig(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.embedder.dim == 0 {
            return Err(IndexError::InvalidConfig("embedder.dim must be > 0".to_string()));
        }
        if !(0.0..=100.0).contains(&self.governor.max_cpu_percent) {
            return Err(IndexError::InvalidConfig(format!(
                "governor.max_cpu_percent out of range: {}",
                self.governor.max_cpu_percent
            )));
        }
        if !(0.0..=1.0).contains(&self.follow_up.dedup_threshold) {
            return Err(IndexError::InvalidConfig(format!(
                "follow_up.dedup_threshold out of range: {}",
                self.follow_up.dedup_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub history_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn history_dir(&self) -> PathBuf {
        self.history_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".history"))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            history_dir: None,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("knowledge_bases")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
    #[default]
    Auto,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EmbedderConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub device: Device,
}

impl EmbedderConfig {
    pub fn new(model_name: impl Into<String>, dim: usize) -> Self {
        Self {
            model_name: model_name.into(),
            dim,
            batch_size: None,
            device: Device::Auto,
        }
    }

    /// 2048 on CPU, smaller on GPU to fit modest device memory.
    pub fn effective_batch_size(&self) -> usize {
        match (self.batch_size, self.device) {
            (Some(size), _) if size > 0 => size,
            (_, Device::Gpu) => 256,
            _ => 2048,
        }
    }
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self::new(default_model_name(), default_dim())
    }
}

fn default_model_name() -> String {
    crate::embeddings::HASHING_MODEL.to_string()
}
fn default_dim() -> usize {
    384
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default)]
    pub enable_bm25: bool,
    #[serde(default)]
    pub enable_rerank: bool,
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
}

impl RetrievalConfig {
    pub fn options(&self) -> RetrievalOptions {
        RetrievalOptions {
            top_k: self.top_k,
            candidate_k: self.candidate_k,
            enable_bm25: self.enable_bm25,
            enable_rerank: self.enable_rerank,
            rerank_model: self.rerank_model.clone(),
            dense_weight: self.dense_weight,
            lexical_weight: self.lexical_weight,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            enable_bm25: false,
            enable_rerank: false,
            rerank_model: default_rerank_model(),
            dense_weight: default_dense_weight(),
            lexical_weight: default_lexical_weight(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_candidate_k() -> usize {
    10
}
fn default_rerank_model() -> String {
    crate::rerank::OVERLAP_RERANKER.to_string()
}
fn default_dense_weight() -> f64 {
    0.6
}
fn default_lexical_weight() -> f64 {
    0.4
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GovernorConfig {
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,
    #[serde(default = "default_emergency_cpu_percent")]
    pub emergency_cpu_percent: f32,
    #[serde(default = "default_emergency_samples")]
    pub emergency_samples: u32,
    #[serde(default = "default_memory_cap_percent")]
    pub memory_cap_percent: f32,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_throttle_pause_ms")]
    pub throttle_pause_ms: u64,
}

impl GovernorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn throttle_pause(&self) -> Duration {
        Duration::from_millis(self.throttle_pause_ms)
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu_percent(),
            emergency_cpu_percent: default_emergency_cpu_percent(),
            emergency_samples: default_emergency_samples(),
            memory_cap_percent: default_memory_cap_percent(),
            sample_interval_ms: default_sample_interval_ms(),
            throttle_pause_ms: default_throttle_pause_ms(),
        }
    }
}

fn default_max_cpu_percent() -> f32 {
    95.0
}
fn default_emergency_cpu_percent() -> f32 {
    98.0
}
fn default_emergency_samples() -> u32 {
    3
}
fn default_memory_cap_percent() -> f32 {
    70.0
}
fn default_sample_interval_ms() -> u64 {
    1_000
}
fn default_throttle_pause_ms() -> u64 {
    3_000
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_page_segmentation_mode")]
    pub page_segmentation_mode: u8,
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default = "default_tesseract_path")]
    pub tesseract_path: PathBuf,
}

impl OcrConfig {
    pub fn language_arg(&self) -> String {
        self.languages.join("+")
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            languages: default_ocr_languages(),
            page_segmentation_mode: default_page_segmentation_mode(),
            min_text_chars: default_min_text_chars(),
            tesseract_path: default_tesseract_path(),
        }
    }
}

fn default_ocr_languages() -> Vec<String> {
    vec!["chi_sim".to_string(), "eng".to_string()]
}
/// Fully automatic segmentation handles mixed text/figure layouts.
fn default_page_segmentation_mode() -> u8 {
    3
}
fn default_min_text_chars() -> usize {
    20
}
fn default_tesseract_path() -> PathBuf {
    PathBuf::from("tesseract")
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FollowUpConfig {
    #[serde(default = "default_num_questions")]
    pub num_questions: usize,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
}

impl FollowUpConfig {
    pub fn options(&self) -> FollowUpOptions {
        FollowUpOptions {
            num_questions: self.num_questions,
            timeout_s: self.timeout_s,
            ..FollowUpOptions::default()
        }
    }
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            num_questions: default_num_questions(),
            dedup_threshold: default_dedup_threshold(),
            history_window: default_history_window(),
            timeout_s: default_timeout_s(),
        }
    }
}

fn default_num_questions() -> usize {
    3
}
fn default_dedup_threshold() -> f64 {
    0.7
}
fn default_history_window() -> usize {
    10
}
fn default_timeout_s() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
}

fn default_llm_timeout_s() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_documented_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config: KbVaultConfig = toml::from_str("")?;
        assert_eq!(config.chunking.chunk_size, 1024);
        assert_eq!(config.chunking.chunk_overlap, 128);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.candidate_k, 10);
        assert!((config.governor.max_cpu_percent - 95.0).abs() < f32::EPSILON);
        assert_eq!(config.ocr.language_arg(), "chi_sim+eng");
        assert_eq!(config.embedder.effective_batch_size(), 2048);
        assert!(config.llm.is_none());
        Ok(())
    }

    #[test]
    fn sections_override_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config: KbVaultConfig = toml::from_str(
            r#"
[embedder]
model_name = "E"
dim = 768
device = "gpu"

[retrieval]
enable_bm25 = true
dense_weight = 0.7
lexical_weight = 0.3
"#,
        )?;
        assert_eq!(config.embedder.dim, 768);
        assert_eq!(config.embedder.effective_batch_size(), 256);
        let options = config.retrieval.options();
        assert!(options.enable_bm25);
        assert!((options.dense_weight - 0.7).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut config = KbVaultConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());
    }
}
