//! Membership admission rules per chat type, kept free of storage so they can be
//! checked in isolation.

use crate::{
    api::error,
    constants::DIALOG_MEMBERS,
    modules::chat::schema::{ChatRole, ChatType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Role that will actually be stored.
    pub role: ChatRole,
    /// Member count the storage layer must not exceed when inserting a new row.
    pub capacity: Option<i32>,
}

pub fn admit(
    chat_type: ChatType,
    num_members: i32,
    existing_role: Option<ChatRole>,
    requested_role: ChatRole,
    max_group_members: i32,
) -> Result<Admission, error::SystemError> {
    let is_member = existing_role.is_some();

    match chat_type {
        ChatType::Dialog => {
            if !is_member && num_members >= DIALOG_MEMBERS {
                return Err(error::SystemError::MaxMembersExceeded);
            }
            Ok(Admission { role: ChatRole::Owner, capacity: Some(DIALOG_MEMBERS) })
        }
        ChatType::Group => {
            if !is_member && num_members >= max_group_members {
                return Err(error::SystemError::MaxMembersExceeded);
            }
            Ok(Admission { role: requested_role, capacity: Some(max_group_members) })
        }
        ChatType::Channel => Ok(Admission { role: requested_role, capacity: None }),
    }
}
