use crate::catalog::ArtifactResultRepository;
use crate::database::{Database, DbError};
use crate::models::{ArtifactNode, ArtifactResult, ArtifactResultMetadata};
use crate::storage::{Storage, StorageError};
use crate::types::ExecutionState;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// An artifact within one run
pub(crate) struct RunArtifact {
    pub node: ArtifactNode,
    /// Where the payload is written. Fresh per run, so runs never share keys.
    pub content_path: String,
    pub metadata_path: String,
}

impl RunArtifact {
    pub fn new(node: ArtifactNode) -> Self {
        let key = Uuid::new_v4();
        Self {
            node,
            content_path: key.to_string(),
            metadata_path: format!("{}-metadata", key),
        }
    }

    /// Metadata the producing job reported, if any.
    pub async fn metadata(&self, storage: &dyn Storage) -> Result<Option<ArtifactResultMetadata>, StorageError> {
        match storage.get(&self.metadata_path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(metadata) => Ok(Some(metadata)),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable metadata of artifact {}: {}", self.node.artifact.name, e);
                    Ok(None)
                }
            },
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// State of the artifact once its producer is terminal: succeeded when the
    /// payload exists, canceled when it was never produced.
    pub async fn produced_state(
        &self,
        storage: &dyn Storage,
        registered_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<ExecutionState, StorageError> {
        let mut state = ExecutionState::registered(registered_at);
        if storage.exists(&self.content_path).await? {
            state.succeed(finished_at);
        } else {
            state.cancel(finished_at);
        }
        Ok(state)
    }

    pub fn persist(
        &self,
        db: &dyn Database,
        dag_result_id: Uuid,
        state: &ExecutionState,
        metadata: Option<&ArtifactResultMetadata>,
    ) -> Result<ArtifactResult, DbError> {
        let mut result = ArtifactResultRepository::create(
            db,
            dag_result_id,
            self.node.artifact.id,
            &self.content_path,
            Some(state),
        )?;
        if let Some(metadata) = metadata {
            ArtifactResultRepository::update(db, result.id, state, Some(metadata))?;
            result.metadata = Some(metadata.clone());
        }
        Ok(result)
    }

    /// The result as [`persist`](Self::persist) would write it, kept in memory.
    pub fn preview(
        &self,
        dag_result_id: Uuid,
        state: &ExecutionState,
        metadata: Option<&ArtifactResultMetadata>,
    ) -> ArtifactResult {
        ArtifactResult {
            id: Uuid::new_v4(),
            dag_result_id,
            artifact_id: self.node.artifact.id,
            content_path: self.content_path.clone(),
            exec_state: Some(state.clone()),
            metadata: metadata.cloned(),
        }
    }
}
