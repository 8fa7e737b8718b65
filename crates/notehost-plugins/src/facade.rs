//! Host API exposed to plugin code
//!
//! `PluginApi` is bound to one plugin id. Each call passes the capability
//! gate and only then reaches the host repository.

use notehost_core::domain::{
    AttachmentMeta, AttachmentRepository, InMemoryAttachmentRepository, InMemoryNoteRepository,
    InMemoryPreferenceRepository, InMemoryUserRepository, NewNote, Note, NoteRepository,
    NoteUpdate, PreferenceRepository, ProfileUpdate, User, UserRepository,
};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::gate::{CapabilityGate, PluginException};
use crate::permissions::Operation;

/// The host repositories plugin calls are delegated to
#[derive(Clone)]
pub struct HostServices {
    pub notes: Arc<dyn NoteRepository>,
    pub users: Arc<dyn UserRepository>,
    pub attachments: Arc<dyn AttachmentRepository>,
    pub preferences: Arc<dyn PreferenceRepository>,
}

impl HostServices {
    pub fn in_memory() -> Self {
        Self {
            notes: Arc::new(InMemoryNoteRepository::new()),
            users: Arc::new(InMemoryUserRepository::new()),
            attachments: Arc::new(InMemoryAttachmentRepository::new()),
            preferences: Arc::new(InMemoryPreferenceRepository::new()),
        }
    }
}

#[derive(Clone)]
pub struct PluginApi {
    plugin_id: String,
    gate: CapabilityGate,
    host: HostServices,
}

impl PluginApi {
    pub fn new(plugin_id: &str, gate: CapabilityGate, host: HostServices) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            gate,
            host,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn check(&self, operation: Operation) -> Result<(), PluginException> {
        self.gate.check(&self.plugin_id, operation)
    }

    pub fn notes(&self) -> NotesApi<'_> {
        NotesApi { api: self }
    }

    pub fn users(&self) -> UsersApi<'_> {
        UsersApi { api: self }
    }

    pub fn attachments(&self) -> AttachmentsApi<'_> {
        AttachmentsApi { api: self }
    }

    pub fn preferences(&self) -> PreferencesApi<'_> {
        PreferencesApi { api: self }
    }
}

pub struct NotesApi<'a> {
    api: &'a PluginApi,
}

impl NotesApi<'_> {
    pub async fn list(&self, owner_id: Option<Uuid>) -> Result<Vec<Note>, PluginException> {
        self.api.check(Operation::NoteList)?;
        Ok(self.api.host.notes.list(owner_id).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Note>, PluginException> {
        self.api.check(Operation::NoteGet)?;
        Ok(self.api.host.notes.get(id).await?)
    }

    pub async fn create(&self, note: NewNote) -> Result<Note, PluginException> {
        self.api.check(Operation::NoteCreate)?;
        Ok(self.api.host.notes.create(note).await?)
    }

    pub async fn update(&self, id: Uuid, update: NoteUpdate) -> Result<Note, PluginException> {
        self.api.check(Operation::NoteUpdate)?;
        Ok(self.api.host.notes.update(id, update).await?)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), PluginException> {
        self.api.check(Operation::NoteDelete)?;
        Ok(self.api.host.notes.delete(id).await?)
    }
}

pub struct UsersApi<'a> {
    api: &'a PluginApi,
}

impl UsersApi<'_> {
    pub async fn get(&self, id: Uuid) -> Result<Option<User>, PluginException> {
        self.api.check(Operation::UserGet)?;
        Ok(self.api.host.users.get(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<User>, PluginException> {
        self.api.check(Operation::UserList)?;
        Ok(self.api.host.users.list().await?)
    }

    pub async fn update_profile(&self, id: Uuid, update: ProfileUpdate) -> Result<User, PluginException> {
        self.api.check(Operation::UserUpdateProfile)?;
        Ok(self.api.host.users.update_profile(id, update).await?)
    }
}

pub struct AttachmentsApi<'a> {
    api: &'a PluginApi,
}

impl AttachmentsApi<'_> {
    pub async fn list(&self, note_id: Uuid) -> Result<Vec<AttachmentMeta>, PluginException> {
        self.api.check(Operation::AttachmentList)?;
        Ok(self.api.host.attachments.list_for_note(note_id).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<AttachmentMeta>, PluginException> {
        self.api.check(Operation::AttachmentGet)?;
        Ok(self.api.host.attachments.get(id).await?)
    }
}

pub struct PreferencesApi<'a> {
    api: &'a PluginApi,
}

impl PreferencesApi<'_> {
    pub async fn get(&self, user_id: Uuid, key: &str) -> Result<Option<Value>, PluginException> {
        self.api.check(Operation::PreferenceGet)?;
        Ok(self.api.host.preferences.get(user_id, key).await?)
    }

    pub async fn set(&self, user_id: Uuid, key: &str, value: Value) -> Result<(), PluginException> {
        self.api.check(Operation::PreferenceSet)?;
        Ok(self.api.host.preferences.set(user_id, key, value).await?)
    }
}
