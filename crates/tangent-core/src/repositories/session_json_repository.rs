use std::path::PathBuf;

use super::error::{RepositoryError, RepositoryResult};
use super::session_repository::{
    BoxFuture, SessionData, SessionMetadata, SessionRepository,
};

/// JSON file-based repository for sessions.
/// Stores each session as a separate file under the platform config
/// directory, e.g. `~/.config/tangent/sessions/<id>.json`.
#[derive(Clone)]
pub struct SessionJsonRepository {
    sessions_dir: PathBuf,
}

impl SessionJsonRepository {
    pub fn new() -> RepositoryResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| RepositoryError::Initialization {
                message: "Could not determine config directory".to_string(),
            })?
            .join("tangent")
            .join("sessions");

        Ok(Self {
            sessions_dir: config_dir,
        })
    }

    /// Use an explicit directory instead of the platform default.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: dir.into(),
        }
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }
}

impl SessionRepository for SessionJsonRepository {
    fn load_metadata(&self) -> BoxFuture<'static, RepositoryResult<Vec<SessionMetadata>>> {
        let load = self.load_all();
        Box::pin(async move {
            let sessions = load.await?;
            Ok(sessions
                .into_iter()
                .map(|data| SessionMetadata {
                    id: data.id,
                    name: data.name,
                    updated_at: data.updated_at,
                })
                .collect())
        })
    }

    fn load_one(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<SessionData>>> {
        let path = self.session_path(id);

        Box::pin(async move {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<SessionData>>> {
        let sessions_dir = self.sessions_dir.clone();

        Box::pin(async move {
            tokio::fs::create_dir_all(&sessions_dir).await?;

            let mut sessions = Vec::new();
            let mut entries = tokio::fs::read_dir(&sessions_dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) == Some("json") {
                    let content = tokio::fs::read_to_string(&path).await?;
                    let data: SessionData = serde_json::from_str(&content)?;
                    sessions.push(data);
                }
            }

            // Sort by updated_at descending
            sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

            Ok(sessions)
        })
    }

    fn save(&self, id: &str, data: SessionData) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.session_path(id);
        let sessions_dir = self.sessions_dir.clone();

        Box::pin(async move {
            tokio::fs::create_dir_all(&sessions_dir).await?;

            let json = serde_json::to_string_pretty(&data)?;

            // Write atomically: temp file, then rename.
            let temp_path = path.with_extension("json.tmp");
            tokio::fs::write(&temp_path, json).await?;
            tokio::fs::rename(&temp_path, &path).await?;

            Ok(())
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.session_path(id);

        Box::pin(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
