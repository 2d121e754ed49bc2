use std::sync::Arc;

use log::{info, warn};
use validator::Validate;

use crate::{
    api::error,
    middlewares::{RequestContext, current_user_id},
    modules::chat::{
        model::{DeleteMode, MemberSelector, NewChat, Pagination, UpdateChat, require_name},
        policy,
        repository::ChatStore,
        schema::{ChatEntity, ChatMemberEntity, ChatRole, ChatType},
    },
    utils::IdGenerator,
};

fn require_id(value: &str, what: &'static str) -> Result<(), error::SystemError> {
    if value.is_empty() {
        return Err(error::SystemError::invalid_argument(format!("{what} identifier required")));
    }
    Ok(())
}

pub struct ChatService<S, G>
where
    S: ChatStore,
    G: IdGenerator + 'static,
{
    store: Arc<S>,
    id_generator: Arc<G>,
    max_group_members: i32,
}

impl<S, G> Clone for ChatService<S, G>
where
    S: ChatStore,
    G: IdGenerator + 'static,
{
    fn clone(&self) -> Self {
        ChatService {
            store: self.store.clone(),
            id_generator: self.id_generator.clone(),
            max_group_members: self.max_group_members,
        }
    }
}

impl<S, G> ChatService<S, G>
where
    S: ChatStore,
    G: IdGenerator + 'static,
{
    pub fn with_dependencies(store: Arc<S>, id_generator: Arc<G>, max_group_members: i32) -> Self {
        info!("ChatService initialized (max {max_group_members} members per group)");
        ChatService { store, id_generator, max_group_members }
    }

    pub fn max_group_members(&self) -> i32 {
        self.max_group_members
    }

    /// Creates the chat and makes the acting user its owner in one transaction.
    pub async fn create_chat(
        &self,
        ctx: &RequestContext,
        chat: NewChat,
    ) -> Result<ChatEntity, error::SystemError> {
        ctx.run(async {
            let chat = chat.normalized();
            chat.validate().map_err(|e| error::SystemError::invalid_argument(e.to_string()))?;

            let id = self.id_generator.new_id()?;

            let owner_id = current_user_id(ctx).to_owned();
            if owner_id.is_empty() {
                warn!("Chat {id} is being created without an authenticated owner");
            }

            let created = self
                .store
                .run_in_transaction(move |tx| {
                    Box::pin(async move {
                        let mut created = tx.create_chat(&id, &chat).await?;
                        let write =
                            tx.set_member(&created.id, &owner_id, ChatRole::Owner, None).await?;
                        created.num_members = write.num_members;
                        Ok::<_, error::SystemError>(created)
                    })
                })
                .await?;

            info!("Chat {} ({}) created", created.id, created.chat_type);
            Ok::<_, error::SystemError>(created)
        })
        .await
    }

    pub async fn get_chat(
        &self,
        ctx: &RequestContext,
        chat_id: &str,
    ) -> Result<ChatEntity, error::SystemError> {
        ctx.run(async {
            require_id(chat_id, "chat")?;

            let chat = self
                .store
                .find_chat_by_id(chat_id)
                .await?
                .ok_or_else(|| error::SystemError::not_found("Chat not found"))?;

            Ok::<_, error::SystemError>(chat)
        })
        .await
    }

    /// Rewrites name, description and avatar. The chat type never changes, dialogs
    /// stay without metadata, and groups and channels keep a non-blank name.
    pub async fn update_chat(
        &self,
        ctx: &RequestContext,
        chat: UpdateChat,
    ) -> Result<ChatEntity, error::SystemError> {
        ctx.run(async {
            require_id(&chat.id, "chat")?;

            let updated = self
                .store
                .run_in_transaction(move |tx| {
                    Box::pin(async move {
                        let mut chat = chat;
                        let current = tx
                            .find_chat_by_id(&chat.id)
                            .await?
                            .ok_or_else(|| error::SystemError::not_found("Chat not found"))?;

                        match current.chat_type {
                            ChatType::Dialog => {
                                chat.name.clear();
                                chat.description.clear();
                                chat.avatar_url.clear();
                            }
                            chat_type => require_name(chat_type, &chat.name).map_err(|e| {
                                error::SystemError::invalid_argument(e.to_string())
                            })?,
                        }

                        let updated = tx.update_chat(&chat).await?;
                        Ok::<_, error::SystemError>(updated)
                    })
                })
                .await?;

            info!("Chat {} updated", updated.id);
            Ok::<_, error::SystemError>(updated)
        })
        .await
    }

    /// Purges the memberships and deletes the chat in one transaction, so a chat that
    /// cannot be deleted keeps its members.
    pub async fn delete_chat(
        &self,
        ctx: &RequestContext,
        chat_id: &str,
        mode: DeleteMode,
    ) -> Result<(), error::SystemError> {
        ctx.run(async {
            require_id(chat_id, "chat")?;

            let id = chat_id.to_owned();
            let removed = self
                .store
                .run_in_transaction(move |tx| {
                    Box::pin(async move {
                        let removed = tx.delete_members(&id, &MemberSelector::All).await?;
                        tx.delete_chat(&id, mode).await?;
                        Ok::<_, error::SystemError>(removed)
                    })
                })
                .await?;

            info!("Chat {chat_id} deleted ({mode:?}), {removed} memberships removed");
            Ok::<_, error::SystemError>(())
        })
        .await
    }

    /// Adds the user to the chat or changes their role. Dialog participants are always
    /// owners. Re-adding an existing member never changes the member count.
    pub async fn set_member(
        &self,
        ctx: &RequestContext,
        chat_id: &str,
        user_id: &str,
        role: ChatRole,
    ) -> Result<(), error::SystemError> {
        ctx.run(async {
            require_id(chat_id, "chat")?;
            require_id(user_id, "user")?;

            let (chat, user) = (chat_id.to_owned(), user_id.to_owned());
            let max_group_members = self.max_group_members;

            let result = self
                .store
                .run_in_transaction(move |tx| {
                    Box::pin(async move {
                        let current = tx
                            .find_chat_by_id(&chat)
                            .await?
                            .ok_or_else(|| error::SystemError::not_found("Chat not found"))?;
                        let existing = tx.find_role(&chat, &user).await?;

                        let admission = policy::admit(
                            current.chat_type,
                            current.num_members,
                            existing,
                            role,
                            max_group_members,
                        )?;

                        let write =
                            tx.set_member(&chat, &user, admission.role, admission.capacity).await?;
                        Ok::<_, error::SystemError>((admission.role, write))
                    })
                })
                .await;

            match result {
                Ok((role, write)) => {
                    info!(
                        "User {user_id} set as {role:?} in chat {chat_id} (new: {}, members: {})",
                        write.inserted, write.num_members
                    );
                    Ok(())
                }
                Err(error::SystemError::MaxMembersExceeded) => {
                    warn!("Chat {chat_id} is full, user {user_id} was not added");
                    Err(error::SystemError::MaxMembersExceeded)
                }
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Owners are never removed, even when the chat has more than one.
    pub async fn delete_member(
        &self,
        ctx: &RequestContext,
        chat_id: &str,
        user_id: &str,
    ) -> Result<(), error::SystemError> {
        ctx.run(async {
            require_id(chat_id, "chat")?;
            require_id(user_id, "user")?;

            let (chat, user) = (chat_id.to_owned(), user_id.to_owned());
            self.store
                .run_in_transaction(move |tx| {
                    Box::pin(async move {
                        let role = tx
                            .find_role(&chat, &user)
                            .await?
                            .ok_or_else(|| error::SystemError::not_found("Member not found"))?;

                        if role == ChatRole::Owner {
                            return Err(error::SystemError::CannotRemoveOwner);
                        }

                        tx.delete_members(&chat, &MemberSelector::user(user)).await?;
                        Ok::<_, error::SystemError>(())
                    })
                })
                .await
                .inspect_err(|err| {
                    if matches!(err, error::SystemError::CannotRemoveOwner) {
                        warn!("Refused to remove owner {user_id} from chat {chat_id}");
                    }
                })?;

            info!("User {user_id} removed from chat {chat_id}");
            Ok::<_, error::SystemError>(())
        })
        .await
    }

    pub async fn get_role(
        &self,
        ctx: &RequestContext,
        chat_id: &str,
        user_id: &str,
    ) -> Result<ChatRole, error::SystemError> {
        ctx.run(async {
            require_id(chat_id, "chat")?;
            require_id(user_id, "user")?;

            let role = self
                .store
                .find_role(chat_id, user_id)
                .await?
                .ok_or_else(|| error::SystemError::not_found("Member not found"))?;

            Ok::<_, error::SystemError>(role)
        })
        .await
    }

    /// Owners first, then by user id. Unknown and deleted chats have no members.
    pub async fn find_chat_members(
        &self,
        ctx: &RequestContext,
        chat_id: &str,
        page: &Pagination,
    ) -> Result<Vec<ChatMemberEntity>, error::SystemError> {
        ctx.run(async {
            require_id(chat_id, "chat")?;
            self.store.find_chat_members(chat_id, page).await
        })
        .await
    }
}
