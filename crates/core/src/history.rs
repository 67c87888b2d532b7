//! Per-knowledge-base chat history, fed back to follow-up generation.

use crate::error::IndexError;
use crate::stores::{read_json_or_default, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<String>>,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            citations: None,
        }
    }

    pub fn assistant(content: impl Into<String>, citations: Vec<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            citations: (!citations.is_empty()).then_some(citations),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{slug}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, slug: &str) -> Result<Vec<HistoryEntry>, IndexError> {
        read_json_or_default(&self.path(slug))
    }

    /// Appends one message; blank content is ignored.
    pub fn append(&self, slug: &str, entry: HistoryEntry) -> Result<(), IndexError> {
        if entry.content.trim().is_empty() {
            return Ok(());
        }
        let mut entries = self.load(slug)?;
        entries.push(entry);
        std::fs::create_dir_all(&self.dir)?;
        write_json_atomic(&self.path(slug), &entries)
    }

    /// The newest `limit` user questions, oldest first.
    pub fn recent_questions(&self, slug: &str, limit: usize) -> Result<Vec<String>, IndexError> {
        let questions: Vec<String> = self
            .load(slug)?
            .into_iter()
            .filter(|entry| entry.role == Role::User)
            .map(|entry| entry.content)
            .collect();
        let skip = questions.len().saturating_sub(limit);
        Ok(questions.into_iter().skip(skip).collect())
    }

    pub fn clear(&self, slug: &str) -> Result<(), IndexError> {
        match std::fs::remove_file(self.path(slug)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
