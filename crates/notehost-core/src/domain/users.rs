//! Users aggregate

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub email: Option<String>,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn list(&self) -> Result<Vec<User>>;
    async fn update_profile(&self, id: Uuid, update: ProfileUpdate) -> Result<User>;
}

#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<Uuid, User>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user; the host's registration flow owns creation
    pub fn insert(&self, username: &str, email: &str) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: username.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        };
        let mut users = self.users.write().map_err(|_| Self::lock_err())?;
        if users.values().any(|u| u.username == username) {
            return Err(Error::InvalidInput(format!("username '{}' is taken", username)));
        }
        users.insert(user.id, user.clone());
        Ok(user)
    }

    fn lock_err() -> Error {
        Error::StorageError("user store lock poisoned".to_string())
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        let users = self.users.read().map_err(|_| Self::lock_err())?;
        Ok(users.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let users = self.users.read().map_err(|_| Self::lock_err())?;
        Ok(users.values().find(|u| u.username == username).cloned())
    }

    async fn list(&self) -> Result<Vec<User>> {
        let users = self.users.read().map_err(|_| Self::lock_err())?;
        let mut listed: Vec<User> = users.values().cloned().collect();
        listed.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(listed)
    }

    async fn update_profile(&self, id: Uuid, update: ProfileUpdate) -> Result<User> {
        let mut users = self.users.write().map_err(|_| Self::lock_err())?;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| Error::UserNotFound(id.to_string()))?;
        if let Some(display_name) = update.display_name {
            user.display_name = display_name;
        }
        if let Some(email) = update.email {
            user.email = email;
        }
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let repo = InMemoryUserRepository::new();
        let user = repo.insert("ada", "ada@example.com").unwrap();

        let found = repo.find_by_username("ada").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(repo.insert("ada", "other@example.com").is_err());
    }

    #[tokio::test]
    async fn test_update_profile() {
        let repo = InMemoryUserRepository::new();
        let user = repo.insert("grace", "grace@example.com").unwrap();

        let updated = repo
            .update_profile(
                user.id,
                ProfileUpdate {
                    display_name: Some("Grace H.".to_string()),
                    email: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.display_name, "Grace H.");
        assert_eq!(updated.email, "grace@example.com");
    }
}
