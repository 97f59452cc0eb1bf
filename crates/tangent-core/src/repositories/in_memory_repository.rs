use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::RepositoryResult;
use super::session_repository::{BoxFuture, SessionData, SessionMetadata, SessionRepository};

/// In-memory repository for sessions.
/// Useful for testing and development.
#[derive(Clone, Default)]
pub struct InMemorySessionRepository {
    sessions: Arc<Mutex<HashMap<String, SessionData>>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRepository for InMemorySessionRepository {
    fn load_metadata(&self) -> BoxFuture<'static, RepositoryResult<Vec<SessionMetadata>>> {
        let sessions = self.sessions.clone();

        Box::pin(async move {
            let store = sessions.lock();
            let mut result: Vec<SessionMetadata> = store
                .values()
                .map(|data| SessionMetadata {
                    id: data.id.clone(),
                    name: data.name.clone(),
                    updated_at: data.updated_at,
                })
                .collect();
            result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(result)
        })
    }

    fn load_one(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<SessionData>>> {
        let sessions = self.sessions.clone();
        let id = id.to_string();

        Box::pin(async move { Ok(sessions.lock().get(&id).cloned()) })
    }

    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<SessionData>>> {
        let sessions = self.sessions.clone();

        Box::pin(async move {
            let store = sessions.lock();
            let mut result: Vec<SessionData> = store.values().cloned().collect();

            // Sort by updated_at descending
            result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

            Ok(result)
        })
    }

    fn save(&self, id: &str, data: SessionData) -> BoxFuture<'static, RepositoryResult<()>> {
        let sessions = self.sessions.clone();
        let id = id.to_string();

        Box::pin(async move {
            sessions.lock().insert(id, data);
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let sessions = self.sessions.clone();
        let id = id.to_string();

        Box::pin(async move {
            sessions.lock().remove(&id);
            Ok(())
        })
    }
}
