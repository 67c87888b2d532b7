use super::{
    docstore_file, read_json, remove_stale, vector_file, write_atomic, write_json_atomic, FlatIndex,
    MANIFEST_FILE,
};
use crate::embeddings::cosine_similarity;
use crate::error::IndexError;
use crate::models::{Chunk, DocstoreEntry, FileRecord, Manifest};
use std::collections::{BTreeMap, HashSet};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manifest, docstore and vectors of one knowledge base, held in memory.
///
/// Mutations only touch memory; callers decide when to persist, so a failed
/// batch can be discarded without leaving partial state on disk. Each commit
/// writes its docstore and vectors under a fresh generation number, and the
/// manifest only points at them once both are on disk.
#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
    manifest: Manifest,
    docstore: BTreeMap<String, DocstoreEntry>,
    vectors: FlatIndex,
}

impl IndexStore {
    /// Initializes an empty store and writes it to `dir`.
    pub fn create(dir: &Path, embedding_model: &str, embedding_dim: usize) -> Result<Self, IndexError> {
        std::fs::create_dir_all(dir)?;
        let mut store = Self {
            dir: dir.to_path_buf(),
            manifest: Manifest::new(embedding_model, embedding_dim),
            docstore: BTreeMap::new(),
            vectors: FlatIndex::new(embedding_dim),
        };
        store.persist_data(0)?;
        store.persist_manifest(0)?;
        Ok(store)
    }

    pub fn read_manifest(dir: &Path) -> Result<Manifest, IndexError> {
        read_json(&dir.join(MANIFEST_FILE))
    }

    /// Loads and cross-checks the three index files against the configured embedder.
    pub fn open(dir: &Path, embedding_model: &str, embedding_dim: usize) -> Result<Self, IndexError> {
        let manifest = Self::read_manifest(dir)?;
        if manifest.embedding_model != embedding_model || manifest.embedding_dim != embedding_dim {
            return Err(IndexError::ModelIncompatible {
                expected_model: embedding_model.to_string(),
                expected_dim: embedding_dim,
                found_model: manifest.embedding_model,
                found_dim: manifest.embedding_dim,
            });
        }

        let docstore_path = dir.join(docstore_file(manifest.generation));
        let docstore: BTreeMap<String, DocstoreEntry> = read_json(&docstore_path)?;

        let vector_path = dir.join(vector_file(manifest.generation));
        let file = std::fs::File::open(&vector_path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => IndexError::corrupt(&vector_path, "file is missing"),
            _ => IndexError::Io(error),
        })?;
        let vectors = FlatIndex::read_from(BufReader::new(file), &vector_path)?;

        if vectors.dim() != manifest.embedding_dim {
            return Err(IndexError::corrupt(
                &vector_path,
                format!(
                    "vector dimension {} differs from manifest dimension {}",
                    vectors.dim(),
                    manifest.embedding_dim
                ),
            ));
        }
        if vectors.len() != docstore.len() {
            return Err(IndexError::corrupt(
                dir,
                format!(
                    "vector count {} does not match chunk count {}",
                    vectors.len(),
                    docstore.len()
                ),
            ));
        }
        if let Some(missing) = docstore.keys().find(|id| !vectors.contains(id)) {
            return Err(IndexError::corrupt(dir, format!("chunk {missing} has no vector")));
        }

        debug!(
            dir = %dir.display(),
            generation = manifest.generation,
            chunks = docstore.len(),
            "index store opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            docstore,
            vectors,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn chunk_count(&self) -> usize {
        self.docstore.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docstore.is_empty()
    }

    pub fn contains_chunk(&self, chunk_id: &str) -> bool {
        self.docstore.contains_key(chunk_id)
    }

    pub fn entry(&self, chunk_id: &str) -> Option<&DocstoreEntry> {
        self.docstore.get(chunk_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &DocstoreEntry)> {
        self.docstore.iter()
    }

    /// Adds a batch of chunks; nothing changes unless every vector is valid.
    pub fn add(&mut self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        if chunks.len() != vectors.len() {
            return Err(IndexError::InvalidConfig(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != self.vectors.dim()) {
            return Err(IndexError::DimensionMismatch {
                expected: self.vectors.dim(),
                found: bad.len(),
            });
        }

        for (chunk, vector) in chunks.iter().zip(vectors) {
            self.vectors.insert(&chunk.chunk_id, vector)?;
            self.docstore.insert(chunk.chunk_id.clone(), DocstoreEntry::from(chunk));
        }
        Ok(())
    }

    pub fn remove_chunks(&mut self, chunk_ids: &HashSet<String>) -> usize {
        self.docstore.retain(|id, _| !chunk_ids.contains(id));
        self.vectors.remove(chunk_ids)
    }

    /// Chunk ids present in the index but referenced by no file in `live`.
    pub fn orphans(&self, live: &HashSet<String>) -> HashSet<String> {
        self.docstore
            .keys()
            .map(String::as_str)
            .chain(self.vectors.ids())
            .filter(|id| !live.contains(*id))
            .map(str::to_string)
            .collect()
    }

    pub fn dense_search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>, IndexError> {
        self.vectors.search(query, k)
    }

    /// Cosine similarity of `query` against one stored chunk.
    pub fn similarity(&self, query: &[f32], chunk_id: &str) -> Option<f32> {
        self.vectors
            .vector(chunk_id)
            .map(|vector| cosine_similarity(query, vector))
    }

    pub fn refresh_manifest<'a>(&mut self, records: impl IntoIterator<Item = &'a FileRecord>) {
        self.manifest.refresh_inventory(records);
    }

    pub fn generation(&self) -> u64 {
        self.manifest.generation
    }

    /// Writes the docstore, then the vector file, under `generation`.
    ///
    /// The committed manifest keeps naming the previous generation, so a
    /// failure here leaves the on-disk knowledge base untouched.
    pub fn persist_data(&self, generation: u64) -> Result<(), IndexError> {
        write_json_atomic(&self.dir.join(docstore_file(generation)), &self.docstore)?;
        let mut bytes = Vec::with_capacity(16 + self.vectors.len() * (self.vectors.dim() * 4 + 66));
        self.vectors.write_to(&mut bytes)?;
        write_atomic(&self.dir.join(vector_file(generation)), &bytes)
    }

    /// Points the manifest at `generation`; this rename is the commit point.
    ///
    /// Returns the generation the previous manifest named.
    pub fn persist_manifest(&mut self, generation: u64) -> Result<u64, IndexError> {
        let mut manifest = self.manifest.clone();
        manifest.generation = generation;
        write_json_atomic(&self.dir.join(MANIFEST_FILE), &manifest)?;
        Ok(std::mem::replace(&mut self.manifest, manifest).generation)
    }

    /// Deletes the data files of a generation no manifest names any more.
    pub fn remove_generation(&self, generation: u64) {
        remove_stale(&self.dir.join(docstore_file(generation)));
        remove_stale(&self.dir.join(vector_file(generation)));
    }
}
