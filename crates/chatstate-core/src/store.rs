//! Optional persistence of handler state across restarts.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{context::ChatInfo, domain::ChatId, utils::lock, Result};

/// Persisted form of one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedSession {
    pub chat: ChatInfo,
    /// Name of the handler class that produced `state`.
    pub class: String,
    pub state: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

impl SerializedSession {
    pub fn new(chat: ChatInfo, class: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            chat,
            class: class.into(),
            state,
            saved_at: Utc::now(),
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat.id
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, chat_id: ChatId) -> Result<Option<SerializedSession>>;

    async fn save(&self, chat_id: ChatId, record: &SerializedSession) -> Result<()>;

    /// Forget a session's record. Called on explicit removal, not on eviction.
    async fn delete(&self, chat_id: ChatId) -> Result<()> {
        let _ = chat_id;
        Ok(())
    }
}

/// Process-local store; state survives session eviction but not restarts.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ChatId, SerializedSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, chat_id: ChatId) -> Result<Option<SerializedSession>> {
        Ok(lock(&self.records).get(&chat_id).cloned())
    }

    async fn save(&self, chat_id: ChatId, record: &SerializedSession) -> Result<()> {
        lock(&self.records).insert(chat_id, record.clone());
        Ok(())
    }

    async fn delete(&self, chat_id: ChatId) -> Result<()> {
        lock(&self.records).remove(&chat_id);
        Ok(())
    }
}

/// One pretty-printed JSON file per chat: `<dir>/<chat_id>.json`.
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, chat_id: ChatId) -> PathBuf {
        self.dir.join(format!("{chat_id}.json"))
    }
}

#[async_trait]
impl SessionStore for JsonDirStore {
    async fn load(&self, chat_id: ChatId) -> Result<Option<SerializedSession>> {
        let bytes = match tokio::fs::read(self.path_for(chat_id)).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, chat_id: ChatId, record: &SerializedSession) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(record)?;

        // Write-then-rename so a crash never leaves a truncated record.
        let path = self.path_for(chat_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, chat_id: ChatId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(chat_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
