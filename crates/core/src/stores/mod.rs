pub mod flat;
pub mod index;
pub mod metadata;

pub use flat::FlatIndex;
pub use index::IndexStore;
pub use metadata::MetadataStore;

use crate::error::IndexError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::warn;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DOCSTORE_FILE: &str = "docstore.json";
pub const VECTOR_FILE: &str = "index.flat";
pub const FILE_METADATA_FILE: &str = "file_metadata.json";
pub const RETRIEVAL_STATS_FILE: &str = "retrieval_stats.json";

/// Generation 0 keeps the plain names; later commits write `docstore.<n>.json` and so on.
fn generation_file(base: &str, generation: u64) -> String {
    if generation == 0 {
        return base.to_string();
    }
    match base.rsplit_once('.') {
        Some((stem, extension)) => format!("{stem}.{generation}.{extension}"),
        None => format!("{base}.{generation}"),
    }
}

pub fn docstore_file(generation: u64) -> String {
    generation_file(DOCSTORE_FILE, generation)
}

pub fn vector_file(generation: u64) -> String {
    generation_file(VECTOR_FILE, generation)
}

pub fn file_metadata_file(generation: u64) -> String {
    generation_file(FILE_METADATA_FILE, generation)
}

/// Best-effort removal of files a newer manifest no longer names.
pub(crate) fn remove_stale(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), %error, "stale generation file left behind"),
    }
}

/// Writes through a sibling temp file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|error| IndexError::Io(error.error))?;
    Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), IndexError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Reads a required JSON file; absence and parse failures are reported as corruption.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, IndexError> {
    let bytes = std::fs::read(path).map_err(|error| match error.kind() {
        std::io::ErrorKind::NotFound => IndexError::corrupt(path, "file is missing"),
        _ => IndexError::Io(error),
    })?;
    serde_json::from_slice(&bytes).map_err(|error| IndexError::corrupt(path, error.to_string()))
}

/// Like [`read_json`], but a missing file yields `T::default()`.
pub(crate) fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, IndexError> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_json(path)
}
