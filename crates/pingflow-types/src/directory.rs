//! Records the application's document store exposes to workflow steps.
//!
//! These are narrow views: only the fields the workflows read or write.

use serde::{Deserialize, Serialize};

/// A user profile synced from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Identity provider user id.
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub username: String,
    #[serde(default)]
    pub profile_picture: String,
}

/// Fields replaced when the identity provider reports a profile change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub profile_picture: String,
}

/// Status of a connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Accepted => "accepted",
        }
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "accepted" => Ok(ConnectionStatus::Accepted),
            other => Err(format!("invalid connection status: '{other}'")),
        }
    }
}

/// A connection request with both endpoints resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub id: String,
    pub status: ConnectionStatus,
    pub from_user: User,
    pub to_user: User,
}

/// Number of unseen messages addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnseenCount {
    pub user_id: String,
    pub count: u64,
}
