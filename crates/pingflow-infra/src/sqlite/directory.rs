//! SQLite directory implementation.
//!
//! Implements `Directory` from `pingflow-core` over the `users`,
//! `connections`, `stories` and `messages` tables.

use chrono::Utc;
use pingflow_core::repository::directory::Directory;
use pingflow_types::directory::{ConnectionDetails, ConnectionStatus, UnseenCount, User, UserUpdate};
use pingflow_types::error::RepositoryError;
use sqlx::Row;

use super::pool::DatabasePool;
use super::{format_datetime, query_error};

/// SQLite-backed implementation of `Directory`.
pub struct SqliteDirectory {
    pool: DatabasePool,
}

impl SqliteDirectory {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow, prefix: &str) -> Result<User, RepositoryError> {
    let col = |name: &str| format!("{prefix}{name}");
    Ok(User {
        id: row.try_get(col("id").as_str()).map_err(query_error)?,
        email: row.try_get(col("email").as_str()).map_err(query_error)?,
        full_name: row.try_get(col("full_name").as_str()).map_err(query_error)?,
        username: row.try_get(col("username").as_str()).map_err(query_error)?,
        profile_picture: row.try_get(col("profile_picture").as_str()).map_err(query_error)?,
    })
}

impl Directory for SqliteDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query("SELECT id, email, full_name, username, profile_picture FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| user_from_row(&r, "")).transpose()
    }

    async fn username_taken(&self, username: &str) -> Result<bool, RepositoryError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM users WHERE username = ? LIMIT 1")
            .bind(username)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        Ok(row.is_some())
    }

    async fn create_user(&self, user: &User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO users (id, email, full_name, username, profile_picture, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.username)
        .bind(&user.profile_picture)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::Conflict(format!("username '{}' already taken", user.username));
                }
            }
            query_error(e)
        })?;

        Ok(())
    }

    async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE users SET email = ?, full_name = ?, profile_picture = ? WHERE id = ?")
            .bind(&update.email)
            .bind(&update.full_name)
            .bind(&update.profile_picture)
            .bind(user_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_connection(&self, connection_id: &str) -> Result<Option<ConnectionDetails>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT c.id, c.status,
                      f.id AS from_id, f.email AS from_email, f.full_name AS from_full_name,
                      f.username AS from_username, f.profile_picture AS from_profile_picture,
                      t.id AS to_id, t.email AS to_email, t.full_name AS to_full_name,
                      t.username AS to_username, t.profile_picture AS to_profile_picture
               FROM connections c
               JOIN users f ON f.id = c.from_user_id
               JOIN users t ON t.id = c.to_user_id
               WHERE c.id = ?"#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status").map_err(query_error)?;
        let status: ConnectionStatus = status.parse().map_err(RepositoryError::Query)?;
        Ok(Some(ConnectionDetails {
            id: row.try_get("id").map_err(query_error)?,
            status,
            from_user: user_from_row(&row, "from_")?,
            to_user: user_from_row(&row, "to_")?,
        }))
    }

    async fn delete_story(&self, story_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM stories WHERE id = ?")
            .bind(story_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn unseen_message_counts(&self) -> Result<Vec<UnseenCount>, RepositoryError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT to_user_id, COUNT(*) FROM messages WHERE seen = 0 GROUP BY to_user_id ORDER BY to_user_id",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(rows
            .into_iter()
            .map(|(user_id, count)| UnseenCount { user_id, count: count as u64 })
            .collect())
    }
}
