//! Attachment metadata (the blobs themselves stay with the host)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: Uuid,
    pub note_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AttachmentRepository: Send + Sync {
    async fn list_for_note(&self, note_id: Uuid) -> Result<Vec<AttachmentMeta>>;
    async fn get(&self, id: Uuid) -> Result<Option<AttachmentMeta>>;
}

#[derive(Debug, Default)]
pub struct InMemoryAttachmentRepository {
    attachments: RwLock<HashMap<Uuid, AttachmentMeta>>,
}

impl InMemoryAttachmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: AttachmentMeta) -> Result<()> {
        let mut attachments = self
            .attachments
            .write()
            .map_err(|_| Error::StorageError("attachment store lock poisoned".to_string()))?;
        attachments.insert(meta.id, meta);
        Ok(())
    }
}

#[async_trait]
impl AttachmentRepository for InMemoryAttachmentRepository {
    async fn list_for_note(&self, note_id: Uuid) -> Result<Vec<AttachmentMeta>> {
        let attachments = self
            .attachments
            .read()
            .map_err(|_| Error::StorageError("attachment store lock poisoned".to_string()))?;
        Ok(attachments
            .values()
            .filter(|a| a.note_id == note_id)
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AttachmentMeta>> {
        let attachments = self
            .attachments
            .read()
            .map_err(|_| Error::StorageError("attachment store lock poisoned".to_string()))?;
        Ok(attachments.get(&id).cloned())
    }
}
