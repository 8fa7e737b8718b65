//! Notes aggregate

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a note
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNote {
    pub owner_id: Uuid,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[async_trait]
pub trait NoteRepository: Send + Sync {
    async fn list(&self, owner_id: Option<Uuid>) -> Result<Vec<Note>>;
    async fn get(&self, id: Uuid) -> Result<Option<Note>>;
    async fn create(&self, note: NewNote) -> Result<Note>;
    async fn update(&self, id: Uuid, update: NoteUpdate) -> Result<Note>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryNoteRepository {
    notes: RwLock<HashMap<Uuid, Note>>,
}

impl InMemoryNoteRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> Error {
        Error::StorageError("note store lock poisoned".to_string())
    }
}

#[async_trait]
impl NoteRepository for InMemoryNoteRepository {
    async fn list(&self, owner_id: Option<Uuid>) -> Result<Vec<Note>> {
        let notes = self.notes.read().map_err(|_| Self::lock_err())?;
        let mut listed: Vec<Note> = notes
            .values()
            .filter(|n| owner_id.is_none_or(|owner| n.owner_id == owner))
            .cloned()
            .collect();
        listed.sort_by_key(|n| n.created_at);
        Ok(listed)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Note>> {
        let notes = self.notes.read().map_err(|_| Self::lock_err())?;
        Ok(notes.get(&id).cloned())
    }

    async fn create(&self, note: NewNote) -> Result<Note> {
        if note.title.trim().is_empty() {
            return Err(Error::InvalidInput("note title cannot be empty".to_string()));
        }
        let now = Utc::now();
        let created = Note {
            id: Uuid::new_v4(),
            owner_id: note.owner_id,
            title: note.title,
            content: note.content,
            tags: note.tags,
            created_at: now,
            updated_at: now,
        };
        let mut notes = self.notes.write().map_err(|_| Self::lock_err())?;
        notes.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update(&self, id: Uuid, update: NoteUpdate) -> Result<Note> {
        let mut notes = self.notes.write().map_err(|_| Self::lock_err())?;
        let note = notes
            .get_mut(&id)
            .ok_or_else(|| Error::NoteNotFound(id.to_string()))?;
        if let Some(title) = update.title {
            note.title = title;
        }
        if let Some(content) = update.content {
            note.content = content;
        }
        if let Some(tags) = update.tags {
            note.tags = tags;
        }
        note.updated_at = Utc::now();
        Ok(note.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut notes = self.notes.write().map_err(|_| Self::lock_err())?;
        notes
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NoteNotFound(id.to_string()))
    }
}
