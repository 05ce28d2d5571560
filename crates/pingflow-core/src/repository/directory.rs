//! Directory trait definition.
//!
//! The directory is the application's document store as seen from workflow
//! steps: users, connection requests, stories and unread messages.

use pingflow_types::directory::{ConnectionDetails, UnseenCount, User, UserUpdate};
use pingflow_types::error::RepositoryError;

/// Application data the social workflows read and write.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait Directory: Send + Sync {
    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    fn find_user(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<User>, RepositoryError>> + Send;

    /// Whether any user already holds `username`.
    fn username_taken(
        &self,
        username: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Insert a user. Inserting an id that already exists is a no-op.
    fn create_user(
        &self,
        user: &User,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace profile fields. Returns `false` if the user does not exist.
    fn update_user(
        &self,
        user_id: &str,
        update: &UserUpdate,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Returns `false` if the user did not exist.
    fn delete_user(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Connections, stories, messages
    // -----------------------------------------------------------------------

    /// A connection request with both users resolved.
    fn find_connection(
        &self,
        connection_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ConnectionDetails>, RepositoryError>> + Send;

    /// Returns `false` if the story was already gone.
    fn delete_story(
        &self,
        story_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Per-recipient count of messages not yet seen, recipients with zero
    /// omitted, ordered by user id.
    fn unseen_message_counts(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<UnseenCount>, RepositoryError>> + Send;
}
