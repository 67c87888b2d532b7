//! Exact cosine search over L2-normalised vectors, persisted as `index.flat`.
//!
//! Layout, little-endian:
//!
//! ```text
//! magic "KBVF" | version u16 | dim u32 | count u32
//! count × ( id_len u16 | id bytes | dim × f32 )
//! ```

use crate::embeddings::l2_normalize;
use crate::error::IndexError;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;

pub const FLAT_MAGIC: [u8; 4] = *b"KBVF";
pub const FLAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    ids: Vec<String>,
    vectors: Vec<f32>,
    positions: HashMap<String, usize>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        let row = *self.positions.get(id)?;
        Some(&self.vectors[row * self.dim..(row + 1) * self.dim])
    }

    /// Stores a normalised copy of `vector`, replacing any row with the same id.
    pub fn insert(&mut self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                found: vector.len(),
            });
        }
        let mut normalized = vector.to_vec();
        l2_normalize(&mut normalized);

        match self.positions.get(id) {
            Some(&row) => {
                self.vectors[row * self.dim..(row + 1) * self.dim].copy_from_slice(&normalized);
            }
            None => {
                self.positions.insert(id.to_string(), self.ids.len());
                self.ids.push(id.to_string());
                self.vectors.extend_from_slice(&normalized);
            }
        }
        Ok(())
    }

    /// Drops the rows for `ids` and compacts storage; returns how many were removed.
    pub fn remove(&mut self, ids: &HashSet<String>) -> usize {
        let before = self.ids.len();
        let mut kept_ids = Vec::with_capacity(before);
        let mut kept_vectors = Vec::with_capacity(self.vectors.len());
        for (row, id) in self.ids.iter().enumerate() {
            if ids.contains(id) {
                continue;
            }
            kept_ids.push(id.clone());
            kept_vectors.extend_from_slice(&self.vectors[row * self.dim..(row + 1) * self.dim]);
        }
        self.ids = kept_ids;
        self.vectors = kept_vectors;
        self.rebuild_positions();
        before - self.ids.len()
    }

    fn rebuild_positions(&mut self) {
        self.positions = self
            .ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.clone(), row))
            .collect();
    }

    /// Up to `k` rows by cosine similarity, descending, ties by id ascending.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>, IndexError> {
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                found: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut normalized = query.to_vec();
        l2_normalize(&mut normalized);

        let mut scored: Vec<(String, f32)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(row, id)| {
                let stored = &self.vectors[row * self.dim..(row + 1) * self.dim];
                let similarity = stored.iter().zip(&normalized).map(|(a, b)| a * b).sum();
                (id.clone(), similarity)
            })
            .collect();
        scored.sort_by(|left, right| right.1.total_cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), IndexError> {
        let dim = u32::try_from(self.dim)
            .map_err(|_| IndexError::InvalidConfig(format!("dimension {} too large", self.dim)))?;
        let count = u32::try_from(self.ids.len())
            .map_err(|_| IndexError::InvalidConfig(format!("{} rows too many", self.ids.len())))?;

        writer.write_all(&FLAT_MAGIC)?;
        writer.write_all(&FLAT_VERSION.to_le_bytes())?;
        writer.write_all(&dim.to_le_bytes())?;
        writer.write_all(&count.to_le_bytes())?;
        for (row, id) in self.ids.iter().enumerate() {
            let id_len = u16::try_from(id.len())
                .map_err(|_| IndexError::InvalidConfig(format!("chunk id too long: {id}")))?;
            writer.write_all(&id_len.to_le_bytes())?;
            writer.write_all(id.as_bytes())?;
            for value in &self.vectors[row * self.dim..(row + 1) * self.dim] {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Parses an index; `path` only labels errors.
    pub fn read_from<R: Read>(mut reader: R, path: &Path) -> Result<Self, IndexError> {
        let corrupt = |details: &str| IndexError::corrupt(path, details);

        let magic: [u8; 4] = read_array(&mut reader).map_err(|_| corrupt("truncated header"))?;
        if magic != FLAT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u16::from_le_bytes(read_array(&mut reader).map_err(|_| corrupt("truncated header"))?);
        if version != FLAT_VERSION {
            return Err(corrupt(&format!("unsupported version {version}")));
        }
        let dim = u32::from_le_bytes(read_array(&mut reader).map_err(|_| corrupt("truncated header"))?) as usize;
        let count = u32::from_le_bytes(read_array(&mut reader).map_err(|_| corrupt("truncated header"))?) as usize;

        // Rows grow as they are read; the header alone never sizes an allocation.
        let mut index = Self::new(dim);
        for row in 0..count {
            let truncated = || corrupt(&format!("truncated at row {row}"));
            let id_len = u16::from_le_bytes(read_array(&mut reader).map_err(|_| truncated())?) as usize;
            let mut id_bytes = vec![0u8; id_len];
            reader.read_exact(&mut id_bytes).map_err(|_| truncated())?;
            let id = String::from_utf8(id_bytes).map_err(|_| corrupt(&format!("row {row} id is not utf-8")))?;
            for _ in 0..dim {
                index
                    .vectors
                    .push(f32::from_le_bytes(read_array(&mut reader).map_err(|_| truncated())?));
            }
            if index.positions.insert(id.clone(), row).is_some() {
                return Err(corrupt(&format!("duplicate id {id}")));
            }
            index.ids.push(id);
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(corrupt("trailing bytes after last row"));
        }
        Ok(index)
    }
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}
