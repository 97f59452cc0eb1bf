use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::error::RepositoryResult;
use crate::models::session::Session;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

fn default_json_array() -> String {
    "[]".to_string()
}

fn default_json_object() -> String {
    "{}".to_string()
}

fn default_json_null() -> String {
    "null".to_string()
}

/// Lightweight session metadata for sidebar listings.
/// Loaded without deserializing message history.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub id: String,
    pub name: String,
    pub updated_at: i64,
}

/// Serializable session record for persistence.
///
/// Message history, threads, and the fork table are stored as JSON text
/// columns so the storage schema stays stable while the in-memory types
/// evolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub name: String,
    pub messages: String, // JSON-serialized Vec<Message>
    #[serde(default = "default_json_array")]
    pub threads: String, // JSON-serialized Vec<Thread>
    #[serde(default = "default_json_object")]
    pub message_forks: String, // JSON-serialized HashMap<String, ForkBucket>
    #[serde(default)]
    pub thread_name: Option<String>,
    #[serde(default = "default_json_null")]
    pub settings: String, // JSON-serialized Option<SessionSettings>
    pub created_at: i64, // Unix millis
    pub updated_at: i64, // Unix millis
}

impl SessionData {
    pub fn from_session(session: &Session) -> RepositoryResult<Self> {
        Ok(Self {
            id: session.id.clone(),
            name: session.name.clone(),
            messages: serde_json::to_string(&session.messages)?,
            threads: serde_json::to_string(&session.threads)?,
            message_forks: serde_json::to_string(&session.message_forks)?,
            thread_name: session.thread_name.clone(),
            settings: serde_json::to_string(&session.settings)?,
            created_at: session.created_at,
            updated_at: session.updated_at,
        })
    }

    pub fn into_session(self) -> RepositoryResult<Session> {
        Ok(Session {
            id: self.id,
            name: self.name,
            messages: serde_json::from_str(&self.messages)?,
            threads: serde_json::from_str(&self.threads)?,
            message_forks: serde_json::from_str(&self.message_forks)?,
            thread_name: self.thread_name,
            settings: serde_json::from_str(&self.settings)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Repository trait for session persistence.
pub trait SessionRepository: Send + Sync + 'static {
    /// Load lightweight metadata for all sessions (no message deserialization).
    fn load_metadata(&self) -> BoxFuture<'static, RepositoryResult<Vec<SessionMetadata>>>;

    /// Load full data for a single session by id.
    fn load_one(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<SessionData>>>;

    /// Load all sessions from storage.
    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<SessionData>>>;

    /// Save a session to storage.
    fn save(&self, id: &str, data: SessionData) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Delete a session from storage.
    fn delete(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;
}
