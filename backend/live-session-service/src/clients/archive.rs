use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::PathBuf;
use uuid::Uuid;

use super::ClientError;

const DEPENDENCY: &str = "archive";

/// Durable home for recorded segments once a session ends
#[async_trait]
pub trait ArchiveStorage: Send + Sync {
    async fn put_segment(&self, session_id: Uuid, name: &str, data: Bytes) -> Result<(), ClientError>;

    /// Store the playlist and return the archive location
    async fn finalize_manifest(&self, session_id: Uuid, manifest: &str) -> Result<String, ClientError>;
}

/// Archive rooted in a local directory, one subdirectory per session
pub struct LocalArchiveStorage {
    root: PathBuf,
}

impl LocalArchiveStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.root.join(session_id.to_string())
    }
}

/// Segment names are relative paths at most one directory deep
fn safe_name(name: &str) -> Result<&str, ClientError> {
    if name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.contains("..")
        || name.matches('/').count() > 1
    {
        return Err(ClientError::rejected(DEPENDENCY, format!("invalid segment name {name:?}")));
    }
    Ok(name)
}

#[async_trait]
impl ArchiveStorage for LocalArchiveStorage {
    async fn put_segment(&self, session_id: Uuid, name: &str, data: Bytes) -> Result<(), ClientError> {
        let path = self.session_dir(session_id).join(safe_name(name)?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))
    }

    async fn finalize_manifest(&self, session_id: Uuid, manifest: &str) -> Result<String, ClientError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))?;
        let path = dir.join("index.m3u8");
        tokio::fs::write(&path, manifest)
            .await
            .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))?;
        Ok(format!("file://{}", path.display()))
    }
}

#[derive(Default)]
pub struct InMemoryArchiveStorage {
    segments: DashMap<(Uuid, String), Bytes>,
    manifests: DashMap<Uuid, String>,
}

impl InMemoryArchiveStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_count(&self, session_id: Uuid) -> usize {
        self.segments.iter().filter(|e| e.key().0 == session_id).count()
    }

    pub fn manifest(&self, session_id: Uuid) -> Option<String> {
        self.manifests.get(&session_id).map(|m| m.value().clone())
    }
}

#[async_trait]
impl ArchiveStorage for InMemoryArchiveStorage {
    async fn put_segment(&self, session_id: Uuid, name: &str, data: Bytes) -> Result<(), ClientError> {
        self.segments
            .insert((session_id, safe_name(name)?.to_string()), data);
        Ok(())
    }

    async fn finalize_manifest(&self, session_id: Uuid, manifest: &str) -> Result<String, ClientError> {
        self.manifests.insert(session_id, manifest.to_string());
        Ok(format!("memory://archive/{session_id}/index.m3u8"))
    }
}
