//! The social application's workflow definitions.
//!
//! Six handlers: identity-provider user sync (created, updated, deleted),
//! the connection request mail with its 24h reminder, story expiry after
//! 24h, and the daily unseen-messages digest at 09:00 New York time.

use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use pingflow_types::directory::{ConnectionStatus, UnseenCount, User, UserUpdate};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::templates;
use crate::mail::Mailer;
use crate::repository::directory::Directory;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::step::{StepContext, StepError, after_creation};

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

pub const USER_CREATED: &str = "user.created";
pub const USER_UPDATED: &str = "user.updated";
pub const USER_DELETED: &str = "user.deleted";
pub const CONNECTION_REQUESTED: &str = "connection.requested";
pub const STORY_CREATED: &str = "story.created";

pub const SYNC_USER_CREATED: &str = "sync-user-created";
pub const SYNC_USER_UPDATED: &str = "sync-user-updated";
pub const SYNC_USER_DELETED: &str = "sync-user-deleted";
pub const CONNECTION_REQUEST_REMINDER: &str = "connection-request-reminder";
pub const STORY_EXPIRY: &str = "story-expiry";
pub const UNSEEN_MESSAGES_DIGEST: &str = "unseen-messages-digest";

pub const DIGEST_SCHEDULE: &str = "0 9 * * *";
pub const DIGEST_TIMEZONE: &str = "America/New_York";

/// Candidate suffixes tried when an email's local part is already a username.
const USERNAME_SUFFIX_TRIES: u32 = 8;

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Collaborators shared by every social step.
pub struct SocialDeps<D, M> {
    pub directory: Arc<D>,
    pub mailer: Arc<M>,
    /// Base URL linked from emails.
    pub frontend_url: String,
}

/// Bind a shared dependency into a step body.
fn with<T, F, Fut>(deps: &Arc<T>, body: F) -> impl Fn(StepContext) -> Fut + Send + Sync + 'static
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    let deps = Arc::clone(deps);
    move |ctx| body(Arc::clone(&deps), ctx)
}

/// Build all six definitions.
pub fn definitions<D, M>(deps: SocialDeps<D, M>) -> Vec<WorkflowDefinition>
where
    D: Directory + 'static,
    M: Mailer + 'static,
{
    let deps = Arc::new(deps);

    vec![
        WorkflowDefinition::on_event(SYNC_USER_CREATED, USER_CREATED).run(
            "create-user",
            with(&deps, |d, ctx| async move { create_user(&*d, &ctx).await }),
        ),
        WorkflowDefinition::on_event(SYNC_USER_UPDATED, USER_UPDATED).run(
            "update-user",
            with(&deps, |d, ctx| async move { update_user(&*d, &ctx).await }),
        ),
        WorkflowDefinition::on_event(SYNC_USER_DELETED, USER_DELETED).run(
            "delete-user",
            with(&deps, |d, ctx| async move { delete_user(&*d, &ctx).await }),
        ),
        WorkflowDefinition::on_event(CONNECTION_REQUEST_REMINDER, CONNECTION_REQUESTED)
            .run(
                "send-connection-request-mail",
                with(&deps, |d, ctx| async move { send_connection_request(&*d, &ctx).await }),
            )
            .sleep_until("wait-24-hours", after_creation(Duration::hours(24)))
            .run(
                "send-connection-request-reminder",
                with(&deps, |d, ctx| async move { send_connection_reminder(&*d, &ctx).await }),
            ),
        WorkflowDefinition::on_event(STORY_EXPIRY, STORY_CREATED)
            .sleep_until("wait-24-hours", after_creation(Duration::hours(24)))
            .run(
                "delete-story",
                with(&deps, |d, ctx| async move { delete_story(&*d, &ctx).await }),
            ),
        WorkflowDefinition::on_cron(UNSEEN_MESSAGES_DIGEST, DIGEST_SCHEDULE, Some(DIGEST_TIMEZONE))
            .run(
                "count-unseen-messages",
                with(&deps, |d, _ctx| async move { count_unseen_messages(&*d).await }),
            )
            .run(
                "send-digest-emails",
                with(&deps, |d, ctx| async move { send_digest_emails(&*d, &ctx).await }),
            ),
    ]
}

// ---------------------------------------------------------------------------
// User sync
// ---------------------------------------------------------------------------

/// First address in the identity provider's `email_addresses` list.
fn primary_email(ctx: &StepContext) -> Result<String, StepError> {
    ctx.data("email_addresses")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(|entry| entry.get("email_address"))
        .and_then(Value::as_str)
        .filter(|email| email.contains('@'))
        .map(str::to_string)
        .ok_or_else(|| StepError::fatal("event payload has no email address"))
}

fn full_name(ctx: &StepContext) -> String {
    let part = |key: &str| ctx.data(key).and_then(Value::as_str).unwrap_or("").trim().to_string();
    [part("first_name"), part("last_name")]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn profile_picture(ctx: &StepContext) -> String {
    ctx.data("image_url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Numeric suffix in `0..10000` derived from the user id, so a replayed
/// step picks the same username.
pub fn username_suffix(user_id: &str, salt: u32) -> u32 {
    let digest = Sha256::digest(format!("{user_id}:{salt}").as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 10_000
}

async fn pick_username<D: Directory>(directory: &D, base: &str, user_id: &str) -> Result<String, StepError> {
    if !directory.username_taken(base).await? {
        return Ok(base.to_string());
    }
    for salt in 0..USERNAME_SUFFIX_TRIES {
        let candidate = format!("{base}{}", username_suffix(user_id, salt));
        if !directory.username_taken(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(StepError::transient(format!("no free username derived from '{base}'")))
}

async fn create_user<D: Directory, M: Mailer>(deps: &SocialDeps<D, M>, ctx: &StepContext) -> Result<Value, StepError> {
    let user_id = ctx.require_str("id")?;
    if let Some(existing) = deps.directory.find_user(user_id).await? {
        return Ok(json!({ "userId": user_id, "username": existing.username, "created": false }));
    }

    let email = primary_email(ctx)?;
    let base = email.split('@').next().unwrap_or_default();
    if base.is_empty() {
        return Err(StepError::fatal(format!("cannot derive a username from '{email}'")));
    }
    let username = pick_username(deps.directory.as_ref(), base, user_id).await?;

    let user = User {
        id: user_id.to_string(),
        email,
        full_name: full_name(ctx),
        username,
        profile_picture: profile_picture(ctx),
    };
    deps.directory.create_user(&user).await?;
    tracing::info!(user_id, username = user.username.as_str(), "user synced");

    Ok(json!({ "userId": user_id, "username": user.username, "created": true }))
}

async fn update_user<D: Directory, M: Mailer>(deps: &SocialDeps<D, M>, ctx: &StepContext) -> Result<Value, StepError> {
    let user_id = ctx.require_str("id")?;
    let update = UserUpdate {
        email: primary_email(ctx)?,
        full_name: full_name(ctx),
        profile_picture: profile_picture(ctx),
    };
    let updated = deps.directory.update_user(user_id, &update).await?;
    if !updated {
        tracing::warn!(user_id, "update for unknown user ignored");
    }
    Ok(json!({ "userId": user_id, "updated": updated }))
}

async fn delete_user<D: Directory, M: Mailer>(deps: &SocialDeps<D, M>, ctx: &StepContext) -> Result<Value, StepError> {
    let user_id = ctx.require_str("id")?;
    let deleted = deps.directory.delete_user(user_id).await?;
    Ok(json!({ "userId": user_id, "deleted": deleted }))
}

// ---------------------------------------------------------------------------
// Connection requests
// ---------------------------------------------------------------------------

async fn send_connection_request<D: Directory, M: Mailer>(
    deps: &SocialDeps<D, M>,
    ctx: &StepContext,
) -> Result<Value, StepError> {
    let connection_id = ctx.require_str("connectionId")?;
    let conn = deps
        .directory
        .find_connection(connection_id)
        .await?
        .ok_or_else(|| StepError::fatal(format!("connection '{connection_id}' not found")))?;

    deps.mailer
        .send_email(&templates::connection_request(&conn, &deps.frontend_url))
        .await?;
    Ok(json!({ "connectionId": connection_id, "notified": conn.to_user.email }))
}

async fn send_connection_reminder<D: Directory, M: Mailer>(
    deps: &SocialDeps<D, M>,
    ctx: &StepContext,
) -> Result<Value, StepError> {
    let connection_id = ctx.require_str("connectionId")?;
    let Some(conn) = deps.directory.find_connection(connection_id).await? else {
        return Ok(json!({ "message": "Connection no longer exists" }));
    };
    if conn.status == ConnectionStatus::Accepted {
        return Ok(json!({ "message": "Already accepted" }));
    }

    deps.mailer
        .send_email(&templates::connection_reminder(&conn, &deps.frontend_url))
        .await?;
    Ok(json!({ "message": "Reminder sent." }))
}

// ---------------------------------------------------------------------------
// Stories
// ---------------------------------------------------------------------------

async fn delete_story<D: Directory, M: Mailer>(deps: &SocialDeps<D, M>, ctx: &StepContext) -> Result<Value, StepError> {
    let story_id = ctx.require_str("storyId")?;
    let deleted = deps.directory.delete_story(story_id).await?;
    Ok(json!({ "storyId": story_id, "deleted": deleted }))
}

// ---------------------------------------------------------------------------
// Unseen messages digest
// ---------------------------------------------------------------------------

async fn count_unseen_messages<D: Directory, M: Mailer>(deps: &SocialDeps<D, M>) -> Result<Value, StepError> {
    let counts = deps.directory.unseen_message_counts().await?;
    serde_json::to_value(counts).map_err(|e| StepError::fatal(e.to_string()))
}

async fn send_digest_emails<D: Directory, M: Mailer>(
    deps: &SocialDeps<D, M>,
    ctx: &StepContext,
) -> Result<Value, StepError> {
    let counts: Vec<UnseenCount> = ctx
        .memo("count-unseen-messages")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StepError::fatal(format!("unreadable unseen counts: {e}")))?
        .ok_or_else(|| StepError::fatal("unseen counts were not recorded"))?;

    let mut sent = 0u64;
    let mut skipped = 0u64;
    for entry in counts.iter().filter(|c| c.count > 0) {
        let Some(user) = deps.directory.find_user(&entry.user_id).await? else {
            skipped += 1;
            continue;
        };
        deps.mailer
            .send_email(&templates::unseen_messages(&user, entry.count, &deps.frontend_url))
            .await?;
        sent += 1;
    }

    tracing::info!(sent, skipped, "unseen message digest sent");
    Ok(json!({ "sent": sent, "skipped": skipped }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
