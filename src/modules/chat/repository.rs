use futures_util::future::BoxFuture;

use crate::{
    api::error,
    modules::chat::{
        model::{DeleteMode, MemberSelector, MemberWrite, NewChat, Pagination, UpdateChat},
        schema::{ChatEntity, ChatMemberEntity, ChatRole},
    },
};

#[async_trait::async_trait]
pub trait ChatRepository: Send + Sync {
    async fn create_chat(
        &self,
        id: &str,
        chat: &NewChat,
    ) -> Result<ChatEntity, error::SystemError>;

    /// Deleted chats are never returned.
    async fn find_chat_by_id(&self, chat_id: &str)
    -> Result<Option<ChatEntity>, error::SystemError>;

    async fn update_chat(&self, chat: &UpdateChat) -> Result<ChatEntity, error::SystemError>;

    async fn delete_chat(&self, chat_id: &str, mode: DeleteMode) -> Result<(), error::SystemError>;
}

#[async_trait::async_trait]
pub trait MemberRepository: Send + Sync {
    /// Inserts the membership or rewrites its role. The chat's member counter moves only
    /// when a row was inserted, and never past `capacity`.
    async fn set_member(
        &self,
        chat_id: &str,
        user_id: &str,
        role: ChatRole,
        capacity: Option<i32>,
    ) -> Result<MemberWrite, error::SystemError>;

    /// Returns how many rows were removed; the counter drops by the same amount.
    async fn delete_members(
        &self,
        chat_id: &str,
        members: &MemberSelector,
    ) -> Result<u64, error::SystemError>;

    async fn find_role(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Option<ChatRole>, error::SystemError>;

    /// Owners first, then by user id.
    async fn find_chat_members(
        &self,
        chat_id: &str,
        page: &Pagination,
    ) -> Result<Vec<ChatMemberEntity>, error::SystemError>;
}

#[async_trait::async_trait]
pub trait ChatStore: ChatRepository + MemberRepository + Sized + 'static {
    /// Runs `work` against a transaction-scoped handle. Commits when it returns `Ok`,
    /// rolls back on `Err` or panic (the panic is re-raised). Calling this on a handle
    /// that is already inside a transaction fails with `NestedTransactionNotSupported`.
    async fn run_in_transaction<T, F>(&self, work: F) -> Result<T, error::SystemError>
    where
        T: Send + 'static,
        F: for<'tx> FnOnce(&'tx Self) -> BoxFuture<'tx, Result<T, error::SystemError>>
            + Send
            + 'static;
}
