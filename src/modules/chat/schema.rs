use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::prelude::{FromRow, Type};

use crate::api::error;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Type, Serialize, Deserialize)]
#[sqlx(type_name = "chat_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Dialog,
    Group,
    Channel,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Dialog => "dialog",
            ChatType::Group => "group",
            ChatType::Channel => "channel",
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatType {
    type Err = error::SystemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dialog" => Ok(ChatType::Dialog),
            "group" => Ok(ChatType::Group),
            "channel" => Ok(ChatType::Channel),
            other => Err(error::SystemError::invalid_argument(format!("unknown chat type '{other}'"))),
        }
    }
}

/// Variant order mirrors the `chat_role` enum in Postgres: owners sort above members.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Type, Serialize, Deserialize)]
#[sqlx(type_name = "chat_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Member,
    Owner,
}

impl FromStr for ChatRole {
    type Err = error::SystemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(ChatRole::Member),
            "owner" => Ok(ChatRole::Owner),
            other => Err(error::SystemError::invalid_argument(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct ChatEntity {
    pub id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    pub name: String,
    pub description: String,
    pub avatar_url: String,
    pub num_members: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct ChatMemberEntity {
    pub chat_id: String,
    pub user_id: String,
    pub role: ChatRole,
    pub joined_at: chrono::DateTime<chrono::Utc>,
}
