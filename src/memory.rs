//! Per-device short-term memory summary store (ambient A5), grounded on
//! `original_source`'s `core/providers/memory/mem_local_short/mem_local_short.py`.
//!
//! The store holds one free-form (or structured-JSON) summary string per
//! `device_id` in a single YAML file. Summarization itself is an LLM call
//! made by the caller (the connection orchestrator, via the LLM driver);
//! this module only owns persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::RwLock;

pub const SHORT_TERM_MEMORY_PROMPT: &str = "\
You are an experienced memory summarizer. Summarize important information \
about the user from the conversation so future turns can be more \
personalized. Do not repeat existing memory verbatim, do not forget prior \
memory unless the combined summary would exceed 1800 characters, do not \
include device-control chatter (volume, music, weather, exit) or the \
current date/time. Return only the summary text, at most 1800 characters.";

/// A device's persisted memory summary.
pub type Summary = String;

/// YAML-backed store of `device_id -> summary`, one file shared across
/// all connections on this process.
pub struct MemoryStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Summary>>,
}

impl MemoryStore {
    /// Load the store from `path`, creating an empty one if the file
    /// doesn't exist yet.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading memory file {}", path.display()))?;
            serde_yaml::from_str(&contents).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    pub async fn get(&self, device_id: &str) -> Option<Summary> {
        self.entries.read().await.get(device_id).cloned()
    }

    /// Replace a device's summary and persist the whole file. Mirrors
    /// the Python original's read-modify-write-whole-file behavior.
    pub async fn put(&self, device_id: impl Into<String>, summary: Summary) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(device_id.into(), summary);
        self.flush_locked(&entries).await
    }

    async fn flush_locked(&self, entries: &HashMap<String, Summary>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let contents = serde_yaml::to_string(entries).context("serializing memory store")?;
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("writing memory file {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Build the prompt input for a memory-summarization LLM call: prior
/// summary (if any) followed by the new turns to fold in.
pub fn build_summary_input(previous: Option<&str>, turns: &[(String, String)]) -> String {
    let mut out = String::new();
    for (role, content) in turns {
        out.push_str(role);
        out.push_str(": ");
        out.push_str(content);
        out.push('\n');
    }
    if let Some(previous) = previous {
        if !previous.is_empty() {
            out.push_str("Historical memory:\n");
            out.push_str(previous);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".memory.yaml");
        let store = MemoryStore::load(&path).await.unwrap();

        assert!(store.get("device-1").await.is_none());
        store.put("device-1", "likes short answers".to_string()).await.unwrap();
        assert_eq!(store.get("device-1").await.as_deref(), Some("likes short answers"));
    }

    #[tokio::test]
    async fn persists_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".memory.yaml");
        {
            let store = MemoryStore::load(&path).await.unwrap();
            store.put("device-1", "summary a".to_string()).await.unwrap();
        }
        let reloaded = MemoryStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get("device-1").await.as_deref(), Some("summary a"));
    }

    #[test]
    fn build_summary_input_includes_prior_memory() {
        let input = build_summary_input(
            Some("user is named Alice"),
            &[("user".to_string(), "hi".to_string())],
        );
        assert!(input.contains("user: hi"));
        assert!(input.contains("Historical memory"));
        assert!(input.contains("Alice"));
    }
}
