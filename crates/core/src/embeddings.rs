use crate::analysis::tokenize;
use crate::error::IndexError;

/// Deterministic feature-hashing model shipped with the crate.
pub const HASHING_MODEL: &str = "hashing-ngram-v1";
/// Prefix selecting a fastembed ONNX model, e.g. `fastembed/bge-small-en-v1.5`.
pub const FASTEMBED_PREFIX: &str = "fastembed/";

pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;
    fn dim(&self) -> usize;
    /// One vector per input, in input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError>;
}

/// Embeds `texts` in sequential batches of `batch_size`, checking every vector's length.
pub fn embed_texts(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>, IndexError> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let embedded = embedder.embed_batch(batch)?;
        if embedded.len() != batch.len() {
            return Err(IndexError::EmbedderUnavailable(format!(
                "{} returned {} vectors for {} inputs",
                embedder.name(),
                embedded.len(),
                batch.len()
            )));
        }
        for vector in embedded {
            if vector.len() != embedder.dim() {
                return Err(IndexError::DimensionMismatch {
                    expected: embedder.dim(),
                    found: vector.len(),
                });
            }
            vectors.push(vector);
        }
    }
    Ok(vectors)
}

pub fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, IndexError> {
    embed_texts(embedder, &[text.to_string()], 1)?
        .into_iter()
        .next()
        .ok_or_else(|| IndexError::EmbedderUnavailable(format!("{} returned nothing", embedder.name())))
}

pub fn l2_normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}

/// Hashes word tokens and their character trigrams into a fixed number of buckets.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    name: String,
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];

        for token in tokenize(text) {
            vector[bucket(&format!("w:{token}"), self.dimensions)] += 1.0;

            let padded: Vec<char> = format!("#{token}#").chars().collect();
            for window in padded.windows(3) {
                let gram = window.iter().collect::<String>();
                vector[bucket(&format!("g:{gram}"), self.dimensions)] += 0.5;
            }
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(HASHING_MODEL, 384)
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dim(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

fn bucket(feature: &str, buckets: usize) -> usize {
    let mut hash = 1469598103934665603u64;
    for byte in feature.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % buckets as u64) as usize
}

#[cfg(feature = "fastembed")]
pub use local::FastembedEmbedder;

#[cfg(feature = "fastembed")]
mod local {
    use super::{l2_normalize, Embedder};
    use crate::error::IndexError;
    use std::sync::Mutex;

    pub struct FastembedEmbedder {
        name: String,
        dim: usize,
        batch_size: usize,
        model: Mutex<fastembed::TextEmbedding>,
    }

    impl FastembedEmbedder {
        pub fn load(name: &str, model_id: &str, batch_size: usize) -> Result<Self, IndexError> {
            let model = model_from_id(model_id)?;
            let mut embedding = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model).with_show_download_progress(false),
            )
            .map_err(|error| IndexError::EmbedderUnavailable(format!("{model_id}: {error}")))?;

            let probe = embedding
                .embed(vec!["dimension probe".to_string()], Some(1))
                .map_err(|error| IndexError::EmbedderUnavailable(format!("{model_id}: {error}")))?;
            let dim = probe.first().map(Vec::len).unwrap_or_default();

            Ok(Self {
                name: name.to_string(),
                dim,
                batch_size,
                model: Mutex::new(embedding),
            })
        }
    }

    impl Embedder for FastembedEmbedder {
        fn name(&self) -> &str {
            &self.name
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
            let mut model = self
                .model
                .lock()
                .map_err(|_| IndexError::EmbedderUnavailable(format!("{} lock poisoned", self.name)))?;
            let mut vectors = model
                .embed(texts.to_vec(), Some(self.batch_size))
                .map_err(|error| IndexError::EmbedderUnavailable(error.to_string()))?;
            for vector in &mut vectors {
                l2_normalize(vector);
            }
            Ok(vectors)
        }
    }

    fn model_from_id(model_id: &str) -> Result<fastembed::EmbeddingModel, IndexError> {
        match model_id {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-small-zh-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallZHV15),
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            other => Err(IndexError::EmbedderUnavailable(format!(
                "unknown fastembed model: {other}"
            ))),
        }
    }
}
