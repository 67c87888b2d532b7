use super::{file_metadata_file, read_json_or_default, remove_stale, write_json_atomic, RETRIEVAL_STATS_FILE};
use crate::error::IndexError;
use crate::models::{FileRecord, FileStats};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Hits recorded in memory before the stats file is rewritten.
pub const STATS_FLUSH_EVERY: usize = 32;

#[derive(Debug, Default)]
struct StatsLedger {
    entries: BTreeMap<String, FileStats>,
    unsaved: usize,
}

/// File records plus per-file retrieval statistics.
///
/// Clones share the statistics, so hits recorded through a query snapshot
/// survive the next ingestion commit. Hits reach disk every
/// [`STATS_FLUSH_EVERY`] updates, on commit and on [`MetadataStore::flush_stats`].
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
    files: BTreeMap<String, FileRecord>,
    stats: Arc<Mutex<StatsLedger>>,
}

impl MetadataStore {
    /// Loads the file records committed under `generation`.
    pub fn load(dir: &Path, generation: u64) -> Result<Self, IndexError> {
        let ledger = StatsLedger {
            entries: read_json_or_default(&dir.join(RETRIEVAL_STATS_FILE))?,
            unsaved: 0,
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            files: read_json_or_default(&dir.join(file_metadata_file(generation)))?,
            stats: Arc::new(Mutex::new(ledger)),
        })
    }

    fn stats_guard(&self) -> MutexGuard<'_, StatsLedger> {
        match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inserts or replaces a record, returning the previous one.
    pub fn put_file(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.files.insert(record.name.clone(), record)
    }

    pub fn get_file(&self, name: &str) -> Option<&FileRecord> {
        self.files.get(name)
    }

    pub fn get_file_mut(&mut self, name: &str) -> Option<&mut FileRecord> {
        self.files.get_mut(name)
    }

    /// Statistics stay until [`MetadataStore::prune_stats`] runs at commit.
    pub fn remove_file(&mut self, name: &str) -> Option<FileRecord> {
        self.files.remove(name)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn find_by_hash(&self, content_hash: &str) -> Option<&FileRecord> {
        self.files.values().find(|record| record.content_hash == content_hash)
    }

    /// Every chunk id referenced by a record.
    pub fn live_chunk_ids(&self) -> HashSet<String> {
        self.files
            .values()
            .flat_map(|record| record.chunk_ids.iter().cloned())
            .collect()
    }

    /// Names sharing a content hash, aliases included; only groups of two or more.
    pub fn find_duplicates(&self) -> Vec<Vec<String>> {
        let mut by_hash: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for record in self.files.values() {
            let group = by_hash.entry(record.content_hash.as_str()).or_default();
            group.push(record.name.clone());
            group.extend(record.aliases.iter().cloned());
        }
        by_hash
            .into_values()
            .filter(|names| names.len() > 1)
            .map(|mut names| {
                names.sort();
                names.dedup();
                names
            })
            .collect()
    }

    pub fn save_files(&self, generation: u64) -> Result<(), IndexError> {
        write_json_atomic(&self.dir.join(file_metadata_file(generation)), &self.files)
    }

    pub fn remove_generation(&self, generation: u64) {
        remove_stale(&self.dir.join(file_metadata_file(generation)));
    }

    pub fn stats(&self, name: &str) -> Option<FileStats> {
        self.stats_guard().entries.get(name).cloned()
    }

    pub fn record_hit(&self, name: &str, score: f64) -> Result<FileStats, IndexError> {
        let mut updated = self.record_hits(&[(name.to_string(), score)])?;
        Ok(updated.pop().unwrap_or_default())
    }

    /// Applies several hits under one lock; writes only once enough are pending.
    pub fn record_hits(&self, hits: &[(String, f64)]) -> Result<Vec<FileStats>, IndexError> {
        let now = Utc::now();
        let mut stats = self.stats_guard();
        let mut updated = Vec::with_capacity(hits.len());
        for (name, score) in hits {
            let entry = stats.entries.entry(name.clone()).or_default();
            entry.hit_count += 1;
            entry.total_score += score;
            entry.avg_score = entry.total_score / entry.hit_count as f64;
            entry.first_accessed.get_or_insert(now);
            entry.last_accessed = Some(now);
            updated.push(entry.clone());
        }
        stats.unsaved += hits.len();
        if stats.unsaved >= STATS_FLUSH_EVERY {
            self.write_stats(&mut stats)?;
        }
        Ok(updated)
    }

    /// Most-hit files, ties by average score then name.
    pub fn hot_files(&self, k: usize) -> Vec<(String, FileStats)> {
        let stats = self.stats_guard();
        let mut hot: Vec<(String, FileStats)> = stats
            .entries
            .iter()
            .filter(|(name, entry)| entry.hit_count > 0 && self.files.contains_key(*name))
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        hot.sort_by(|left, right| {
            right
                .1
                .hit_count
                .cmp(&left.1.hit_count)
                .then_with(|| right.1.avg_score.total_cmp(&left.1.avg_score))
                .then_with(|| left.0.cmp(&right.0))
        });
        hot.truncate(k);
        hot
    }

    /// Files not accessed within `days`, including never-accessed ones.
    pub fn cold_files(&self, days: i64) -> Vec<String> {
        self.cold_files_at(days, Utc::now())
    }

    pub fn cold_files_at(&self, days: i64, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - Duration::days(days);
        let stats = self.stats_guard();
        self.files
            .keys()
            .filter(|name| {
                stats
                    .entries
                    .get(*name)
                    .and_then(|entry| entry.last_accessed)
                    .map_or(true, |last| last < cutoff)
            })
            .cloned()
            .collect()
    }

    /// Statistics kept for files that no longer exist.
    pub fn stale_stats(&self) -> usize {
        let stats = self.stats_guard();
        stats
            .entries
            .keys()
            .filter(|name| !self.files.contains_key(*name))
            .count()
    }

    /// Drops statistics for files that no longer exist, in memory; returns how many.
    pub fn prune_stats(&self) -> usize {
        let mut stats = self.stats_guard();
        let before = stats.entries.len();
        stats.entries.retain(|name, _| self.files.contains_key(name));
        let pruned = before - stats.entries.len();
        stats.unsaved += pruned;
        pruned
    }

    /// Writes pending statistics, if any.
    pub fn flush_stats(&self) -> Result<(), IndexError> {
        let mut stats = self.stats_guard();
        if stats.unsaved == 0 {
            return Ok(());
        }
        self.write_stats(&mut stats)
    }

    pub fn save_stats(&self) -> Result<(), IndexError> {
        let mut stats = self.stats_guard();
        self.write_stats(&mut stats)
    }

    fn write_stats(&self, stats: &mut StatsLedger) -> Result<(), IndexError> {
        write_json_atomic(&self.dir.join(RETRIEVAL_STATS_FILE), &stats.entries)?;
        stats.unsaved = 0;
        Ok(())
    }
}
