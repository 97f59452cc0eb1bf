//! Shared session store.
//!
//! Owns the in-memory session map, persists every mutation through an
//! injected [`SessionRepository`], and broadcasts a [`SessionChange`] after
//! each committed write so observers (UI, sync) can re-read the session.
//! Locks are never held across awaits: mutations run under the write lock,
//! then the updated session is cloned out and persisted.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::session::Session;
use crate::repositories::session_repository::{SessionData, SessionMetadata, SessionRepository};
use crate::repositories::error::RepositoryResult;
use crate::services::fork_service::{self, SwitchDirection};
use crate::services::thread_service;
use crate::settings::SessionSettings;

/// Broadcast after a session has been mutated and persisted.
#[derive(Debug, Clone)]
pub struct SessionChange {
    pub session_id: String,
}

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct SessionStore {
    repository: Arc<dyn SessionRepository>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    changes: broadcast::Sender<SessionChange>,
}

impl SessionStore {
    pub fn new(repository: Arc<dyn SessionRepository>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            repository,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Load every persisted session into memory. Sessions that fail to
    /// deserialize are skipped with a warning rather than aborting the load.
    pub async fn load_all(&self) -> RepositoryResult<()> {
        let all = self.repository.load_all().await?;
        let mut sessions = self.sessions.write();
        for data in all {
            let id = data.id.clone();
            match data.into_session() {
                Ok(session) => {
                    sessions.insert(session.id.clone(), session);
                }
                Err(e) => warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Metadata for all loaded sessions, most recently updated first.
    pub fn list_metadata(&self) -> Vec<SessionMetadata> {
        let sessions = self.sessions.read();
        let mut metadata: Vec<SessionMetadata> = sessions
            .values()
            .map(|s| SessionMetadata {
                id: s.id.clone(),
                name: s.name.clone(),
                updated_at: s.updated_at,
            })
            .collect();
        metadata.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        metadata
    }

    pub async fn create(&self, name: impl Into<String>) -> RepositoryResult<Session> {
        let session = Session::new(name);
        self.insert(session.clone()).await?;
        Ok(session)
    }

    /// Add an externally built session (e.g. a detached thread) to the store.
    pub async fn insert(&self, session: Session) -> RepositoryResult<()> {
        let id = session.id.clone();
        self.sessions.write().insert(id.clone(), session.clone());
        self.persist(&session).await?;
        self.notify(&id);
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> RepositoryResult<()> {
        self.sessions.write().remove(session_id);
        self.repository.delete(session_id).await?;
        self.notify(session_id);
        Ok(())
    }

    /// Run a mutation against a session. When `mutate` reports a change the
    /// session is touched, persisted, and a change is broadcast. Returns
    /// whether a change was committed.
    pub async fn update_if(
        &self,
        session_id: &str,
        mutate: impl FnOnce(&mut Session) -> bool,
    ) -> RepositoryResult<bool> {
        let updated = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(session_id) else {
                return Ok(false);
            };
            if !mutate(session) {
                return Ok(false);
            }
            session.touch();
            session.clone()
        };

        self.persist(&updated).await?;
        self.notify(session_id);
        Ok(true)
    }

    /// Unconditional variant of [`update_if`](Self::update_if). Returns
    /// whether the session existed.
    pub async fn update(
        &self,
        session_id: &str,
        mutate: impl FnOnce(&mut Session),
    ) -> RepositoryResult<bool> {
        self.update_if(session_id, |session| {
            mutate(session);
            true
        })
        .await
    }

    pub async fn rename(&self, session_id: &str, name: impl Into<String>) -> RepositoryResult<bool> {
        let name = name.into();
        self.update(session_id, |session| session.name = name).await
    }

    pub async fn update_settings(
        &self,
        session_id: &str,
        settings: Option<SessionSettings>,
    ) -> RepositoryResult<bool> {
        self.update(session_id, |session| session.settings = settings)
            .await
    }

    // Fork operations.

    pub async fn create_fork(&self, session_id: &str, message_id: &str) -> RepositoryResult<bool> {
        self.update_if(session_id, |s| fork_service::create_new_fork(s, message_id))
            .await
    }

    pub async fn switch_fork(
        &self,
        session_id: &str,
        message_id: &str,
        direction: SwitchDirection,
    ) -> RepositoryResult<bool> {
        self.update_if(session_id, |s| {
            fork_service::switch_fork(s, message_id, direction)
        })
        .await
    }

    pub async fn delete_fork(&self, session_id: &str, message_id: &str) -> RepositoryResult<bool> {
        self.update_if(session_id, |s| fork_service::delete_fork(s, message_id))
            .await
    }

    pub async fn expand_fork(&self, session_id: &str, message_id: &str) -> RepositoryResult<bool> {
        self.update_if(session_id, |s| fork_service::expand_fork(s, message_id))
            .await
    }

    // Thread operations.

    pub async fn start_new_thread(&self, session_id: &str) -> RepositoryResult<bool> {
        self.update(session_id, thread_service::start_new_thread)
            .await
    }

    pub async fn switch_thread(&self, session_id: &str, thread_id: &str) -> RepositoryResult<bool> {
        self.update_if(session_id, |s| thread_service::switch_thread(s, thread_id))
            .await
    }

    pub async fn remove_thread(&self, session_id: &str, thread_id: &str) -> RepositoryResult<bool> {
        self.update_if(session_id, |s| thread_service::remove_thread(s, thread_id))
            .await
    }

    pub async fn remove_current_thread(&self, session_id: &str) -> RepositoryResult<bool> {
        self.update(session_id, thread_service::remove_current_thread)
            .await
    }

    /// Detach a thread (or the live branch for `None`) into a new session
    /// owned by the store. Returns the new session when the source existed.
    pub async fn move_thread_to_session(
        &self,
        session_id: &str,
        thread_id: Option<&str>,
    ) -> RepositoryResult<Option<Session>> {
        let moved = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(session_id) else {
                return Ok(None);
            };
            let Some(detached) = thread_service::move_thread_to_session(session, thread_id) else {
                return Ok(None);
            };
            session.touch();
            (detached, session.clone())
        };

        let (detached, source) = moved;
        self.persist(&source).await?;
        self.notify(session_id);
        self.insert(detached.clone()).await?;
        Ok(Some(detached))
    }

    async fn persist(&self, session: &Session) -> RepositoryResult<()> {
        let data = SessionData::from_session(session)?;
        self.repository.save(&session.id, data).await
    }

    fn notify(&self, session_id: &str) {
        // Nobody subscribed is fine.
        let _ = self.changes.send(SessionChange {
            session_id: session_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use crate::repositories::in_memory_repository::InMemorySessionRepository;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemorySessionRepository::new()))
    }

    #[tokio::test]
    async fn create_get_and_list() {
        let store = store();
        let session = store.create("alpha").await.unwrap();

        let loaded = store.get(&session.id).unwrap();
        assert_eq!(loaded.name, "alpha");

        let metadata = store.list_metadata();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].id, session.id);
    }

    #[tokio::test]
    async fn update_persists_and_notifies() {
        let repository = Arc::new(InMemorySessionRepository::new());
        let store = SessionStore::new(repository.clone());
        let session = store.create("beta").await.unwrap();
        let mut changes = store.subscribe();
        while changes.try_recv().is_ok() {}

        let changed = store
            .update(&session.id, |s| s.messages.push(Message::user("hi")))
            .await
            .unwrap();
        assert!(changed);

        let change = changes.try_recv().unwrap();
        assert_eq!(change.session_id, session.id);

        // The repository saw the new message too.
        let data = repository.load_one(&session.id).await.unwrap().unwrap();
        let persisted = data.into_session().unwrap();
        assert_eq!(persisted.messages.len(), 2);
    }

    #[tokio::test]
    async fn update_if_without_change_stays_silent() {
        let store = store();
        let session = store.create("gamma").await.unwrap();
        let mut changes = store.subscribe();
        while changes.try_recv().is_ok() {}

        let changed = store.update_if(&session.id, |_| false).await.unwrap();
        assert!(!changed);
        assert!(changes.try_recv().is_err());

        assert!(!store.update_if("missing", |_| true).await.unwrap());
    }

    #[tokio::test]
    async fn store_survives_reload_from_repository() {
        let repository = Arc::new(InMemorySessionRepository::new());
        let store = SessionStore::new(repository.clone());
        let session = store.create("delta").await.unwrap();

        let reopened = SessionStore::new(repository);
        reopened.load_all().await.unwrap();
        assert_eq!(reopened.get(&session.id).unwrap().name, "delta");
    }

    #[tokio::test]
    async fn fork_wrappers_round_trip() {
        let store = store();
        let session = store.create("forky").await.unwrap();
        let user = Message::user("q");
        let anchor = user.id.clone();
        store
            .update(&session.id, |s| {
                s.messages.push(user);
                s.messages.push(Message::assistant("a"));
            })
            .await
            .unwrap();

        assert!(store.create_fork(&session.id, &anchor).await.unwrap());
        assert!(
            store
                .switch_fork(&session.id, &anchor, SwitchDirection::Next)
                .await
                .unwrap()
        );

        let loaded = store.get(&session.id).unwrap();
        assert_eq!(loaded.messages.last().unwrap().text(), "a");
    }

    #[tokio::test]
    async fn detached_thread_becomes_a_stored_session() {
        let store = store();
        let session = store.create("mover").await.unwrap();
        store
            .update(&session.id, |s| s.messages.push(Message::user("payload")))
            .await
            .unwrap();

        let detached = store
            .move_thread_to_session(&session.id, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.get(&detached.id).unwrap().messages.len(), 2);
        assert_eq!(store.get(&session.id).unwrap().messages.len(), 1);
        assert_eq!(store.list_metadata().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_everywhere() {
        let repository = Arc::new(InMemorySessionRepository::new());
        let store = SessionStore::new(repository.clone());
        let session = store.create("doomed").await.unwrap();

        store.delete(&session.id).await.unwrap();

        assert!(store.get(&session.id).is_none());
        assert!(repository.load_one(&session.id).await.unwrap().is_none());
    }
}
