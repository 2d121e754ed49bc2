use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::modules::chat::schema::ChatType;

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_chat_name"))]
pub struct NewChat {
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar_url: String,
}

impl NewChat {
    pub fn new(chat_type: ChatType, name: impl Into<String>) -> Self {
        NewChat { chat_type, name: name.into(), description: String::new(), avatar_url: String::new() }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_avatar_url(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = avatar_url.into();
        self
    }

    /// Dialogs carry no metadata of their own; whatever the caller sent is dropped.
    pub fn normalized(mut self) -> Self {
        if self.chat_type == ChatType::Dialog {
            self.name.clear();
            self.description.clear();
            self.avatar_url.clear();
        }
        self
    }
}

fn validate_chat_name(chat: &NewChat) -> Result<(), ValidationError> {
    require_name(chat.chat_type, &chat.name)
}

pub(crate) fn require_name(chat_type: ChatType, name: &str) -> Result<(), ValidationError> {
    match chat_type {
        ChatType::Group | ChatType::Channel if name.trim().is_empty() => {
            Err(ValidationError::new("name_required")
                .with_message("name is required for group and channel chats".into()))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateChat {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Zero means no limit.
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Pagination { limit, offset }
    }

    pub fn limit(&self) -> Option<i64> {
        (self.limit != 0).then_some(self.limit as i64)
    }

    pub fn offset(&self) -> i64 {
        self.offset as i64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteMode {
    /// Marks the chat deleted; the row stays for audit.
    #[default]
    Soft,
    /// Removes the chat row, and with it every membership row.
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberSelector {
    All,
    Users(Vec<String>),
}

impl MemberSelector {
    pub fn user(user_id: impl Into<String>) -> Self {
        MemberSelector::Users(vec![user_id.into()])
    }
}

/// Outcome of a membership upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberWrite {
    /// False when an existing membership only had its role rewritten.
    pub inserted: bool,
    pub num_members: i32,
}
