//! Permission vocabulary, operation map, and the operator grant log
//!
//! A `GrantedPermission` is the only thing the capability gate trusts. The
//! grant log is append-only: revoking writes a new record rather than
//! deleting the old one, so the full history can be replayed on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use crate::store::StorageError;

/// Named right gating one class of host operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "notes:read")]
    NotesRead,
    #[serde(rename = "notes:write")]
    NotesWrite,
    #[serde(rename = "users:read")]
    UsersRead,
    #[serde(rename = "users:write")]
    UsersWrite,
    #[serde(rename = "attachments:read")]
    AttachmentsRead,
    #[serde(rename = "preferences:read")]
    PreferencesRead,
    #[serde(rename = "preferences:write")]
    PreferencesWrite,
}

impl Permission {
    pub const ALL: [Permission; 7] = [
        Permission::NotesRead,
        Permission::NotesWrite,
        Permission::UsersRead,
        Permission::UsersWrite,
        Permission::AttachmentsRead,
        Permission::PreferencesRead,
        Permission::PreferencesWrite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotesRead => "notes:read",
            Self::NotesWrite => "notes:write",
            Self::UsersRead => "users:read",
            Self::UsersWrite => "users:write",
            Self::AttachmentsRead => "attachments:read",
            Self::PreferencesRead => "preferences:read",
            Self::PreferencesWrite => "preferences:write",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission '{}'", s))
    }
}

/// Host operation reachable from a plugin facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    NoteList,
    NoteGet,
    NoteCreate,
    NoteUpdate,
    NoteDelete,
    UserGet,
    UserList,
    UserUpdateProfile,
    AttachmentList,
    AttachmentGet,
    PreferenceGet,
    PreferenceSet,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoteList => "note.list",
            Self::NoteGet => "note.get",
            Self::NoteCreate => "note.create",
            Self::NoteUpdate => "note.update",
            Self::NoteDelete => "note.delete",
            Self::UserGet => "user.get",
            Self::UserList => "user.list",
            Self::UserUpdateProfile => "user.update_profile",
            Self::AttachmentList => "attachment.list",
            Self::AttachmentGet => "attachment.get",
            Self::PreferenceGet => "preference.get",
            Self::PreferenceSet => "preference.set",
        }
    }

    /// Fixed mapping from operation to the permission it requires
    pub fn required_permission(&self) -> Permission {
        match self {
            Self::NoteList | Self::NoteGet => Permission::NotesRead,
            Self::NoteCreate | Self::NoteUpdate | Self::NoteDelete => Permission::NotesWrite,
            Self::UserGet | Self::UserList => Permission::UsersRead,
            Self::UserUpdateProfile => Permission::UsersWrite,
            Self::AttachmentList | Self::AttachmentGet => Permission::AttachmentsRead,
            Self::PreferenceGet => Permission::PreferencesRead,
            Self::PreferenceSet => Permission::PreferencesWrite,
        }
    }
}

/// Operator-approved capability for one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedPermission {
    pub plugin_id: String,
    pub permission: Permission,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum GrantAction {
    Grant,
    Revoke,
}

/// One line of the grant log
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GrantRecord {
    action: GrantAction,
    plugin_id: String,
    permission: Permission,
    actor: String,
    at: DateTime<Utc>,
}

/// Append-only grant table
#[derive(Debug)]
pub struct GrantLog {
    path: Option<PathBuf>,
    writer: Mutex<()>,
    grants: RwLock<HashMap<String, HashMap<Permission, GrantedPermission>>>,
}

impl GrantLog {
    /// A log that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            writer: Mutex::new(()),
            grants: RwLock::new(HashMap::new()),
        }
    }

    /// Open a JSON-lines grant log, replaying existing records
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let log = Self {
            path: Some(path.to_path_buf()),
            ..Self::in_memory()
        };

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let mut replayed = 0usize;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: GrantRecord = serde_json::from_str(&line)?;
                log.apply(&record);
                replayed += 1;
            }
            debug!(path = %path.display(), records = replayed, "Replayed grant log");
        }

        Ok(log)
    }

    /// Record an operator grant. Granting an already-held permission is a no-op.
    pub fn grant(
        &self,
        plugin_id: &str,
        permission: Permission,
        granted_by: &str,
    ) -> Result<GrantedPermission, StorageError> {
        if let Some(existing) = self.get(plugin_id, permission) {
            return Ok(existing);
        }

        let record = GrantRecord {
            action: GrantAction::Grant,
            plugin_id: plugin_id.to_string(),
            permission,
            actor: granted_by.to_string(),
            at: Utc::now(),
        };
        self.append(&record)?;
        self.apply(&record);
        info!(plugin_id, permission = %permission, granted_by, "Permission granted");

        self.get(plugin_id, permission)
            .ok_or(StorageError::Inconsistent("grant missing after append"))
    }

    /// Append a revocation. Returns false when the permission was not held.
    pub fn revoke(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: &str,
    ) -> Result<bool, StorageError> {
        if self.get(plugin_id, permission).is_none() {
            return Ok(false);
        }

        let record = GrantRecord {
            action: GrantAction::Revoke,
            plugin_id: plugin_id.to_string(),
            permission,
            actor: actor.to_string(),
            at: Utc::now(),
        };
        self.append(&record)?;
        self.apply(&record);
        info!(plugin_id, permission = %permission, actor, "Permission revoked");
        Ok(true)
    }

    /// Revoke everything held by `plugin_id`, returning what was revoked
    pub fn revoke_all(&self, plugin_id: &str, actor: &str) -> Result<Vec<Permission>, StorageError> {
        let held: Vec<Permission> = self
            .granted(plugin_id)
            .into_iter()
            .map(|g| g.permission)
            .collect();
        for permission in &held {
            self.revoke(plugin_id, *permission, actor)?;
        }
        Ok(held)
    }

    pub fn get(&self, plugin_id: &str, permission: Permission) -> Option<GrantedPermission> {
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        grants
            .get(plugin_id)
            .and_then(|held| held.get(&permission))
            .cloned()
    }

    pub fn has(&self, plugin_id: &str, permission: Permission) -> bool {
        self.get(plugin_id, permission).is_some()
    }

    /// Current grants for a plugin, ordered by permission
    pub fn granted(&self, plugin_id: &str) -> Vec<GrantedPermission> {
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        let mut held: Vec<GrantedPermission> = grants
            .get(plugin_id)
            .map(|held| held.values().cloned().collect())
            .unwrap_or_default();
        held.sort_by_key(|g| g.permission);
        held
    }

    fn apply(&self, record: &GrantRecord) {
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        match record.action {
            GrantAction::Grant => {
                grants.entry(record.plugin_id.clone()).or_default().insert(
                    record.permission,
                    GrantedPermission {
                        plugin_id: record.plugin_id.clone(),
                        permission: record.permission,
                        granted_by: record.actor.clone(),
                        granted_at: record.at,
                    },
                );
            }
            GrantAction::Revoke => {
                if let Some(held) = grants.get_mut(&record.plugin_id) {
                    held.remove(&record.permission);
                    if held.is_empty() {
                        grants.remove(&record.plugin_id);
                    }
                }
            }
        }
    }

    fn append(&self, record: &GrantRecord) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_permission_strings_roundtrip() {
        for permission in Permission::ALL {
            assert_eq!(permission.as_str().parse::<Permission>().unwrap(), permission);
            let json = serde_json::to_string(&permission).unwrap();
            assert_eq!(json, format!("\"{}\"", permission.as_str()));
        }
        assert!("notes:admin".parse::<Permission>().is_err());
    }

    #[test]
    fn test_operation_map() {
        assert_eq!(Operation::NoteDelete.required_permission(), Permission::NotesWrite);
        assert_eq!(Operation::NoteGet.required_permission(), Permission::NotesRead);
        assert_eq!(Operation::UserUpdateProfile.required_permission(), Permission::UsersWrite);
        assert_eq!(Operation::PreferenceSet.required_permission(), Permission::PreferencesWrite);
        assert_eq!(Operation::NoteDelete.name(), "note.delete");
    }

    #[test]
    fn test_grant_and_revoke() {
        let log = GrantLog::in_memory();
        assert!(!log.has("word-count", Permission::NotesRead));

        let granted = log.grant("word-count", Permission::NotesRead, "admin").unwrap();
        assert_eq!(granted.granted_by, "admin");
        assert!(log.has("word-count", Permission::NotesRead));
        assert!(!log.has("word-count", Permission::NotesWrite));
        assert!(!log.has("other", Permission::NotesRead));

        assert!(log.revoke("word-count", Permission::NotesRead, "admin").unwrap());
        assert!(!log.revoke("word-count", Permission::NotesRead, "admin").unwrap());
        assert!(!log.has("word-count", Permission::NotesRead));
    }

    #[test]
    fn test_regrant_keeps_original_record() {
        let log = GrantLog::in_memory();
        let first = log.grant("p", Permission::UsersRead, "alice").unwrap();
        let second = log.grant("p", Permission::UsersRead, "bob").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_log_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grants.jsonl");

        {
            let log = GrantLog::open(&path).unwrap();
            log.grant("p", Permission::NotesRead, "ops").unwrap();
            log.grant("p", Permission::NotesWrite, "ops").unwrap();
            log.revoke("p", Permission::NotesWrite, "ops").unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let reopened = GrantLog::open(&path).unwrap();
        let held: Vec<Permission> = reopened.granted("p").into_iter().map(|g| g.permission).collect();
        assert_eq!(held, vec![Permission::NotesRead]);
    }

    #[test]
    fn test_revoke_all() {
        let log = GrantLog::in_memory();
        log.grant("p", Permission::NotesRead, "ops").unwrap();
        log.grant("p", Permission::PreferencesRead, "ops").unwrap();

        let revoked = log.revoke_all("p", "uninstall").unwrap();
        assert_eq!(revoked.len(), 2);
        assert!(log.granted("p").is_empty());
    }
}
