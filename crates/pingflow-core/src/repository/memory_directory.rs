//! In-process `Directory` backed by `DashMap`, for tests and demos.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use pingflow_types::directory::{ConnectionDetails, ConnectionStatus, UnseenCount, User, UserUpdate};
use pingflow_types::error::RepositoryError;

use super::directory::Directory;

#[derive(Debug, Clone)]
struct ConnectionRecord {
    from_user_id: String,
    to_user_id: String,
    status: ConnectionStatus,
}

#[derive(Debug, Clone)]
struct MessageRecord {
    to_user_id: String,
    seen: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: DashMap<String, User>,
    connections: DashMap<String, ConnectionRecord>,
    /// story id -> owner user id
    stories: DashMap<String, String>,
    messages: DashMap<String, MessageRecord>,
    failures_left: AtomicU32,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` directory calls fail with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RepositoryError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(RepositoryError::Connection)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Seeding and inspection
    // -----------------------------------------------------------------------

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn user(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).map(|u| u.value().clone())
    }

    pub fn insert_connection(&self, id: &str, from_user_id: &str, to_user_id: &str, status: ConnectionStatus) {
        self.connections.insert(
            id.to_string(),
            ConnectionRecord {
                from_user_id: from_user_id.to_string(),
                to_user_id: to_user_id.to_string(),
                status,
            },
        );
    }

    pub fn set_connection_status(&self, id: &str, status: ConnectionStatus) {
        if let Some(mut record) = self.connections.get_mut(id) {
            record.status = status;
        }
    }

    pub fn insert_story(&self, id: &str, owner_user_id: &str) {
        self.stories.insert(id.to_string(), owner_user_id.to_string());
    }

    pub fn story_exists(&self, id: &str) -> bool {
        self.stories.contains_key(id)
    }

    pub fn insert_message(&self, id: &str, to_user_id: &str, seen: bool) {
        self.messages.insert(
            id.to_string(),
            MessageRecord {
                to_user_id: to_user_id.to_string(),
                seen,
            },
        );
    }
}

impl Directory for InMemoryDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, RepositoryError> {
        self.check()?;
        Ok(self.user(user_id))
    }

    async fn username_taken(&self, username: &str) -> Result<bool, RepositoryError> {
        self.check()?;
        Ok(self.users.iter().any(|u| u.username == username))
    }

    async fn create_user(&self, user: &User) -> Result<(), RepositoryError> {
        self.check()?;
        self.users
            .entry(user.id.clone())
            .or_insert_with(|| user.clone());
        Ok(())
    }

    async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<bool, RepositoryError> {
        self.check()?;
        let Some(mut user) = self.users.get_mut(user_id) else {
            return Ok(false);
        };
        user.email = update.email.clone();
        user.full_name = update.full_name.clone();
        user.profile_picture = update.profile_picture.clone();
        Ok(true)
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool, RepositoryError> {
        self.check()?;
        Ok(self.users.remove(user_id).is_some())
    }

    async fn find_connection(&self, connection_id: &str) -> Result<Option<ConnectionDetails>, RepositoryError> {
        self.check()?;
        let Some(record) = self.connections.get(connection_id).map(|r| r.value().clone()) else {
            return Ok(None);
        };
        let (Some(from_user), Some(to_user)) = (self.user(&record.from_user_id), self.user(&record.to_user_id)) else {
            return Ok(None);
        };
        Ok(Some(ConnectionDetails {
            id: connection_id.to_string(),
            status: record.status,
            from_user,
            to_user,
        }))
    }

    async fn delete_story(&self, story_id: &str) -> Result<bool, RepositoryError> {
        self.check()?;
        Ok(self.stories.remove(story_id).is_some())
    }

    async fn unseen_message_counts(&self) -> Result<Vec<UnseenCount>, RepositoryError> {
        self.check()?;
        let mut counts: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
        for message in self.messages.iter().filter(|m| !m.seen) {
            *counts.entry(message.to_user_id.clone()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(user_id, count)| UnseenCount { user_id, count })
            .collect())
    }
}
