use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source file is missing: {0}")]
    SourceMissing(String),

    #[error("unsupported file type `{extension}`: {path}")]
    UnsupportedType { path: String, extension: String },

    #[error("page {page_index} of {path} could not be decoded: {details}")]
    DecoderPartialFailure {
        path: String,
        page_index: u32,
        details: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("office document parse error: {0}")]
    Ooxml(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("OCR worker crashed: {0}")]
    OcrWorkerCrash(String),

    #[error("resource governor requested an emergency stop")]
    EmergencyStop,

    #[error("ingestion was cancelled")]
    Cancelled,

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceMissing(_) => "SourceMissing",
            Self::UnsupportedType { .. } => "UnsupportedType",
            Self::DecoderPartialFailure { .. }
            | Self::PdfParse(_)
            | Self::Ooxml(_)
            | Self::Image(_) => "DecoderPartialFailure",
            Self::Io(_) | Self::MissingFileName(_) => "Io",
            Self::RegexError(_) | Self::InvalidChunkConfig(_) | Self::InvalidArgument(_) => {
                "InvalidArgument"
            }
            Self::OcrWorkerCrash(_) => "OCRWorkerCrash",
            Self::EmergencyStop => "EmergencyStop",
            Self::Cancelled => "Cancelled",
            Self::Serialization(_) => "Serialization",
            Self::Index(inner) => inner.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("knowledge base already exists: {0}")]
    KbExists(String),

    #[error("knowledge base not found: {0}")]
    KbMissing(String),

    #[error("file not found in knowledge base: {0}")]
    FileMissing(String),

    #[error("invalid knowledge base slug: {0:?}")]
    InvalidSlug(String),

    #[error("corrupt index at {path}: {details}")]
    CorruptIndex { path: String, details: String },

    #[error(
        "index was built with {found_model}/{found_dim} but the configured embedder is {expected_model}/{expected_dim}"
    )]
    ModelIncompatible {
        expected_model: String,
        expected_dim: usize,
        found_model: String,
        found_dim: usize,
    },

    #[error("vector dimension {found} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KbExists(_) => "KBExists",
            Self::KbMissing(_) => "KBMissing",
            Self::FileMissing(_) => "FileMissing",
            Self::InvalidSlug(_) | Self::InvalidConfig(_) => "InvalidArgument",
            Self::CorruptIndex { .. } => "CorruptIndex",
            Self::ModelIncompatible { .. } => "ModelIncompatible",
            Self::DimensionMismatch { .. } => "DimensionMismatch",
            Self::EmbedderUnavailable(_) => "EmbedderUnavailable",
            Self::Io(_) => "Io",
            Self::Serialization(_) => "Serialization",
        }
    }

    pub(crate) fn corrupt(path: &std::path::Path, details: impl Into<String>) -> Self {
        Self::CorruptIndex {
            path: path.display().to_string(),
            details: details.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("reranker unavailable: {0}")]
    RerankerUnavailable(String),

    #[error("bm25 scoring unavailable: {0}")]
    Bm25Unavailable(String),

    #[error("llm unavailable: {0}")]
    LlmUnavailable(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("query was cancelled")]
    Cancelled,

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl SearchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RerankerUnavailable(_) => "RerankerUnavailable",
            Self::Bm25Unavailable(_) => "BM25Unavailable",
            Self::LlmUnavailable(_)
            | Self::BackendResponse { .. }
            | Self::Http(_)
            | Self::Url(_) => "LlmUnavailable",
            Self::Serialization(_) => "Serialization",
            Self::Request(_) => "InvalidArgument",
            Self::Cancelled => "Cancelled",
            Self::Index(inner) => inner.kind(),
        }
    }
}

#[derive(Debug, Error)]
#[error("resource sample failed: {0}")]
pub struct SampleError(pub String);

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_index_errors_keep_their_kind() {
        let error = IngestError::from(IndexError::DimensionMismatch {
            expected: 384,
            found: 768,
        });
        assert_eq!(error.kind(), "DimensionMismatch");

        let error = SearchError::from(IndexError::KbMissing("kb1".to_string()));
        assert_eq!(error.kind(), "KBMissing");
    }

    #[test]
    fn fatal_kinds_are_stable_strings() {
        assert_eq!(IngestError::EmergencyStop.kind(), "EmergencyStop");
        assert_eq!(
            IngestError::UnsupportedType {
                path: "a.xyz".to_string(),
                extension: "xyz".to_string()
            }
            .kind(),
            "UnsupportedType"
        );
        assert_eq!(
            SearchError::RerankerUnavailable("missing".to_string()).kind(),
            "RerankerUnavailable"
        );
    }
}
