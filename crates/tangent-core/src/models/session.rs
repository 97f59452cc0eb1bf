//! Session, thread, and fork records.
//!
//! A [`Session`] holds exactly one linear path through the conversation graph
//! (`messages`), the archived prior branches (`threads`), and the per-message
//! fork side-table (`message_forks`). Threads are immutable snapshots: they
//! are appended when a branch is archived and consumed when restored, never
//! edited in place. Fork buckets hold parked alternate continuations anchored
//! at a message id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::message::{Message, MessageRole, now_millis};
use crate::settings::SessionSettings;

/// System prompt used when a session has no leading system message to carry
/// over.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer as concisely as possible.";

/// The leading system message for a fresh branch.
pub fn default_system_message() -> Message {
    Message::system(DEFAULT_SYSTEM_PROMPT)
}

/// One parked alternate continuation inside a [`ForkBucket`].
///
/// A list's `messages` are only populated while it is *not* the active
/// branch; the active list is cleared because its content lives in the
/// containing message array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkList {
    pub id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ForkList {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }
}

impl Default for ForkList {
    fn default() -> Self {
        Self::new()
    }
}

/// Alternate continuations branching from one message, with a cursor marking
/// which one is currently live.
///
/// Invariant: `position < lists.len()`. The bucket is removed together with
/// its last list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkBucket {
    pub position: usize,
    pub lists: Vec<ForkList>,
    pub created_at: i64,
}

impl ForkBucket {
    /// A fresh bucket with a single empty list selected.
    pub fn new() -> Self {
        Self {
            position: 0,
            lists: vec![ForkList::new()],
            created_at: now_millis(),
        }
    }

    /// Total number of parked messages across all lists.
    pub fn message_count(&self) -> usize {
        self.lists.iter().map(|l| l.messages.len()).sum()
    }
}

impl Default for ForkBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable archived snapshot of a prior conversation branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
}

impl Thread {
    pub fn new(name: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            messages,
            created_at: now_millis(),
        }
    }
}

/// Which message array within a session contains a given message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLocation {
    /// The live `messages` array.
    Live,
    /// `threads[index].messages`.
    Thread(usize),
}

/// A conversation: one live branch, archived threads, and fork metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub threads: Vec<Thread>,
    #[serde(default)]
    pub message_forks: HashMap<String, ForkBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SessionSettings>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    /// Create a session seeded with the default system message.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_system_prompt(name, DEFAULT_SYSTEM_PROMPT)
    }

    /// Create a session seeded with a custom system prompt.
    pub fn with_system_prompt(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            messages: vec![Message::system(prompt)],
            threads: Vec::new(),
            message_forks: HashMap::new(),
            thread_name: None,
            settings: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Locate the array containing `message_id`: the live array first, then
    /// archived threads from most recent to oldest.
    pub fn locate_message(&self, message_id: &str) -> Option<MessageLocation> {
        if self.messages.iter().any(|m| m.id == message_id) {
            return Some(MessageLocation::Live);
        }
        for (index, thread) in self.threads.iter().enumerate().rev() {
            if thread.messages.iter().any(|m| m.id == message_id) {
                return Some(MessageLocation::Thread(index));
            }
        }
        None
    }

    /// The message array at a previously resolved location.
    pub fn array_at(&self, location: MessageLocation) -> &Vec<Message> {
        match location {
            MessageLocation::Live => &self.messages,
            MessageLocation::Thread(index) => &self.threads[index].messages,
        }
    }

    /// Find a message by id across the live array and all threads.
    pub fn find_message(&self, message_id: &str) -> Option<&Message> {
        let location = self.locate_message(message_id)?;
        self.array_at(location).iter().find(|m| m.id == message_id)
    }

    /// Mutable lookup by identity, searching the live array first, then
    /// threads newest to oldest.
    pub fn find_message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        if let Some(index) = self.messages.iter().position(|m| m.id == message_id) {
            return Some(&mut self.messages[index]);
        }
        for thread in self.threads.iter_mut().rev() {
            if let Some(index) = thread.messages.iter().position(|m| m.id == message_id) {
                return Some(&mut thread.messages[index]);
            }
        }
        None
    }

    /// The leading system message of the live array, if any.
    pub fn leading_system_message(&self) -> Option<&Message> {
        self.messages
            .first()
            .filter(|m| m.role == MessageRole::System)
    }
}
