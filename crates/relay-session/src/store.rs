//! Session store capability: load/save ordered history per session id.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::history::History;
use crate::validate::validate_session_id;

const HISTORY_FILE_NAME: &str = "history.json";

/// Persistence for session histories.
///
/// The relay loads once at admission and saves once on success, always while
/// holding the session's queue slot, so per-session calls never overlap.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session's history. Unknown sessions yield an empty history.
    async fn load(&self, session_id: &str) -> Result<History>;
    async fn save(&self, session_id: &str, history: &History) -> Result<()>;
}

/// In-process store, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, History>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session with an existing history.
    pub async fn insert(&self, session_id: &str, history: History) {
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), history);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<History> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, session_id: &str, history: &History) -> Result<()> {
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), history.clone());
        Ok(())
    }
}

/// File-backed store: `{root}/sessions/{session_id}/history.json`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join("sessions").join(session_id))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, session_id: &str) -> Result<History> {
        let path = self.session_dir(session_id)?.join(HISTORY_FILE_NAME);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(History::new());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read history: {}", path.display()));
            }
        };
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse history: {}", path.display()))
    }

    async fn save(&self, session_id: &str, history: &History) -> Result<()> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create session directory: {}", dir.display()))?;

        let content =
            serde_json::to_string_pretty(history).context("Failed to serialize history")?;
        // Write-then-rename so a crash never leaves a truncated history.
        let tmp_path = dir.join(format!("{HISTORY_FILE_NAME}.tmp"));
        let path = dir.join(HISTORY_FILE_NAME);
        tokio::fs::write(&tmp_path, content)
            .await
            .with_context(|| format!("Failed to write history: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to replace history: {}", path.display()))?;
        tracing::debug!(session = %session_id, turns = history.len(), "Saved session history");
        Ok(())
    }
}
