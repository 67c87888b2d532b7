//! Process-wide cache of loaded embedders and rerankers.
//!
//! Models are loaded at most once per configuration and shared by every
//! knowledge base; [`ModelRegistry::release`] drops them so weights can be
//! reloaded after a configuration change. Each key has its own slot, so
//! concurrent callers for one model wait on a single load while other models
//! load in parallel.

use crate::config::{Device, EmbedderConfig};
use crate::embeddings::{Embedder, HashingEmbedder, FASTEMBED_PREFIX};
use crate::error::{IndexError, SearchError};
use crate::rerank::{OverlapCrossScorer, Reranker, OVERLAP_RERANKER};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{info, warn};

type Slot<T> = Arc<Mutex<Option<T>>>;
type Slots<K, T> = Mutex<HashMap<K, Slot<T>>>;

#[derive(Default)]
pub struct ModelRegistry {
    embedders: Slots<(String, usize), Arc<dyn Embedder>>,
    rerankers: Slots<String, Arc<dyn Reranker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Returns the value cached under `key`, running `load` only if no caller has.
///
/// The map lock is held just long enough to find the slot; the slot lock is
/// held across `load`. A failed load leaves the slot empty for the next caller.
fn load_once<K, T, E>(slots: &Slots<K, T>, key: K, load: impl FnOnce() -> Result<T, E>) -> Result<T, E>
where
    K: Eq + Hash,
    T: Clone,
{
    let slot = Arc::clone(lock(slots).entry(key).or_default());
    let mut cached = lock(&*slot);
    if let Some(value) = cached.as_ref() {
        return Ok(value.clone());
    }
    let value = load()?;
    *cached = Some(value.clone());
    Ok(value)
}

fn filled<T>(value: T) -> Slot<T> {
    Arc::new(Mutex::new(Some(value)))
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<ModelRegistry> {
        static SHARED: OnceLock<Arc<ModelRegistry>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(ModelRegistry::new())))
    }

    /// Loads, or returns the cached, embedder for `config`.
    pub fn embedder(&self, config: &EmbedderConfig) -> Result<Arc<dyn Embedder>, IndexError> {
        let key = (config.model_name.clone(), config.dim);
        load_once(&self.embedders, key, || -> Result<Arc<dyn Embedder>, IndexError> {
            let loaded = load_embedder(config)?;
            info!(model = loaded.name(), dim = loaded.dim(), "embedder loaded");
            Ok(loaded)
        })
    }

    /// Registers a caller-built embedder under its name and dimension.
    pub fn insert_embedder(&self, embedder: Arc<dyn Embedder>) {
        let key = (embedder.name().to_string(), embedder.dim());
        lock(&self.embedders).insert(key, filled(embedder));
    }

    pub fn reranker(&self, name: &str) -> Result<Arc<dyn Reranker>, SearchError> {
        load_once(&self.rerankers, name.to_string(), || load_reranker(name))
    }

    pub fn insert_reranker(&self, reranker: Arc<dyn Reranker>) {
        lock(&self.rerankers).insert(reranker.name().to_string(), filled(reranker));
    }

    /// Drops every cached model.
    pub fn release(&self) {
        let embedders = std::mem::take(&mut *lock(&self.embedders)).len();
        let rerankers = std::mem::take(&mut *lock(&self.rerankers)).len();
        info!(embedders, rerankers, "model registry released");
    }

    pub fn loaded_embedders(&self) -> usize {
        let slots: Vec<Slot<Arc<dyn Embedder>>> = lock(&self.embedders).values().cloned().collect();
        slots.iter().filter(|slot| lock(&***slot).is_some()).count()
    }
}

fn load_embedder(config: &EmbedderConfig) -> Result<Arc<dyn Embedder>, IndexError> {
    let Some(model_id) = config.model_name.strip_prefix(FASTEMBED_PREFIX) else {
        if config.device == Device::Gpu {
            warn!(model = %config.model_name, "hashing embedder runs on cpu; gpu request ignored");
        }
        return Ok(Arc::new(HashingEmbedder::new(config.model_name.clone(), config.dim)));
    };
    load_fastembed(config, model_id)
}

#[cfg(feature = "fastembed")]
fn load_fastembed(config: &EmbedderConfig, model_id: &str) -> Result<Arc<dyn Embedder>, IndexError> {
    if config.device == Device::Gpu {
        warn!(model = model_id, "fastembed is built for cpu execution; gpu request ignored");
    }
    let embedder = crate::embeddings::FastembedEmbedder::load(
        &config.model_name,
        model_id,
        config.effective_batch_size(),
    )?;
    if embedder.dim() != config.dim {
        warn!(
            model = model_id,
            configured = config.dim,
            actual = embedder.dim(),
            "configured dimension differs from the model; using the model's"
        );
    }
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "fastembed"))]
fn load_fastembed(_config: &EmbedderConfig, model_id: &str) -> Result<Arc<dyn Embedder>, IndexError> {
    Err(IndexError::EmbedderUnavailable(format!(
        "{model_id} needs the `fastembed` feature"
    )))
}

fn load_reranker(name: &str) -> Result<Arc<dyn Reranker>, SearchError> {
    if name == OVERLAP_RERANKER {
        return Ok(Arc::new(OverlapCrossScorer));
    }
    match name.strip_prefix(FASTEMBED_PREFIX) {
        #[cfg(feature = "fastembed")]
        Some(model_id) => Ok(Arc::new(crate::rerank::FastembedReranker::load(name, model_id)?)),
        #[cfg(not(feature = "fastembed"))]
        Some(model_id) => Err(SearchError::RerankerUnavailable(format!(
            "{model_id} needs the `fastembed` feature"
        ))),
        None => Err(SearchError::RerankerUnavailable(format!("unknown reranker: {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn embedders_are_cached_per_name_and_dim() -> Result<(), IndexError> {
        let registry = ModelRegistry::new();
        let first = registry.embedder(&EmbedderConfig::new("E", 32))?;
        let second = registry.embedder(&EmbedderConfig::new("E", 32))?;
        let other = registry.embedder(&EmbedderConfig::new("E", 64))?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(other.dim(), 64);
        assert_eq!(registry.loaded_embedders(), 2);
        Ok(())
    }

    #[test]
    fn concurrent_callers_share_one_load() {
        let slots: Slots<String, Arc<usize>> = Mutex::default();
        let loads = AtomicUsize::new(0);
        let values: Vec<Arc<usize>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        load_once(&slots, "model".to_string(), || {
                            let n = loads.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(20));
                            Ok::<_, IndexError>(Arc::new(n))
                        })
                    })
                })
                .collect();
            workers
                .into_iter()
                .filter_map(|worker| worker.join().ok())
                .filter_map(Result::ok)
                .collect()
        });

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(values.len(), 8);
        assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));
    }

    #[test]
    fn failed_load_is_retried() {
        let slots: Slots<String, usize> = Mutex::default();
        let failed = load_once(&slots, "model".to_string(), || Err::<usize, _>("offline"));
        assert_eq!(failed, Err("offline"));
        assert_eq!(load_once(&slots, "model".to_string(), || Ok::<_, &str>(7)), Ok(7));
        assert_eq!(load_once(&slots, "model".to_string(), || Ok::<_, &str>(8)), Ok(7));
    }

    #[test]
    fn embedders_from_many_threads_are_one_instance() {
        let registry = ModelRegistry::new();
        let config = EmbedderConfig::new("E", 32);
        let embedders: Vec<Arc<dyn Embedder>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4).map(|_| scope.spawn(|| registry.embedder(&config))).collect();
            workers
                .into_iter()
                .filter_map(|worker| worker.join().ok())
                .filter_map(Result::ok)
                .collect()
        });

        assert_eq!(embedders.len(), 4);
        assert!(embedders.iter().all(|embedder| Arc::ptr_eq(embedder, &embedders[0])));
        assert_eq!(registry.loaded_embedders(), 1);
    }

    #[test]
    fn release_drops_cached_models() -> Result<(), IndexError> {
        let registry = ModelRegistry::new();
        let first = registry.embedder(&EmbedderConfig::new("E", 16))?;
        registry.release();
        let reloaded = registry.embedder(&EmbedderConfig::new("E", 16))?;

        assert!(!Arc::ptr_eq(&first, &reloaded));
        Ok(())
    }

    #[test]
    fn unknown_reranker_is_unavailable() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.reranker("mystery"),
            Err(SearchError::RerankerUnavailable(_))
        ));
        assert!(registry.reranker(OVERLAP_RERANKER).is_ok());
    }

    #[cfg(not(feature = "fastembed"))]
    #[test]
    fn fastembed_models_need_the_feature() {
        let registry = ModelRegistry::new();
        let result = registry.embedder(&EmbedderConfig::new("fastembed/bge-small-en-v1.5", 384));
        assert!(matches!(result, Err(IndexError::EmbedderUnavailable(_))));
    }
}
