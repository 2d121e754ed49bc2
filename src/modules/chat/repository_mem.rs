use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    api::error,
    modules::chat::{
        model::{DeleteMode, MemberSelector, MemberWrite, NewChat, Pagination, UpdateChat},
        repository::{ChatRepository, ChatStore, MemberRepository},
        schema::{ChatEntity, ChatMemberEntity, ChatRole},
    },
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    chats: HashMap<String, ChatEntity>,
    /// Keyed by (chat id, user id).
    members: BTreeMap<(String, String), ChatMemberEntity>,
}

impl MemoryState {
    fn live_chat_mut(&mut self, chat_id: &str) -> Option<&mut ChatEntity> {
        self.chats.get_mut(chat_id).filter(|chat| chat.deleted_at.is_none())
    }
}

/// In-process chat store with the same membership and counter rules as the Postgres
/// one. Meant for tests and embedders without a database.
///
/// Unlike Postgres, transactions are serialized store-wide: a transaction holds the
/// store lock until it finishes, so it also blocks work on unrelated chats. It works on
/// a private copy of the state, which replaces the shared state on commit.
#[derive(Clone, Default)]
pub struct ChatMemRepository {
    shared: Arc<Mutex<MemoryState>>,
    scope: Option<Arc<Mutex<MemoryState>>>,
}

impl ChatMemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.scope.is_some()
    }

    async fn state(&self) -> MutexGuard<'_, MemoryState> {
        match &self.scope {
            Some(working) => working.lock().await,
            None => self.shared.lock().await,
        }
    }
}

fn selected(members: &MemberSelector, user_id: &str) -> bool {
    match members {
        MemberSelector::All => true,
        MemberSelector::Users(ids) => ids.iter().any(|id| id == user_id),
    }
}

#[async_trait::async_trait]
impl ChatRepository for ChatMemRepository {
    async fn create_chat(
        &self,
        id: &str,
        chat: &NewChat,
    ) -> Result<ChatEntity, error::SystemError> {
        let mut state = self.state().await;

        if state.chats.contains_key(id) {
            log::error!("ChatMemRepository::create_chat: duplicate chat id {id}");
            return Err(error::SystemError::Conflict(None));
        }

        let now = chrono::Utc::now();
        let entity = ChatEntity {
            id: id.to_owned(),
            chat_type: chat.chat_type,
            name: chat.name.clone(),
            description: chat.description.clone(),
            avatar_url: chat.avatar_url.clone(),
            num_members: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        state.chats.insert(entity.id.clone(), entity.clone());

        Ok(entity)
    }

    async fn find_chat_by_id(
        &self,
        chat_id: &str,
    ) -> Result<Option<ChatEntity>, error::SystemError> {
        let state = self.state().await;
        Ok(state.chats.get(chat_id).filter(|chat| chat.deleted_at.is_none()).cloned())
    }

    async fn update_chat(&self, chat: &UpdateChat) -> Result<ChatEntity, error::SystemError> {
        let mut state = self.state().await;

        let entity = state
            .live_chat_mut(&chat.id)
            .ok_or_else(|| error::SystemError::not_found("Chat not found"))?;

        entity.name = chat.name.clone();
        entity.description = chat.description.clone();
        entity.avatar_url = chat.avatar_url.clone();
        entity.updated_at = chrono::Utc::now();

        Ok(entity.clone())
    }

    async fn delete_chat(&self, chat_id: &str, mode: DeleteMode) -> Result<(), error::SystemError> {
        let mut state = self.state().await;

        match mode {
            DeleteMode::Soft => {
                let entity = state
                    .live_chat_mut(chat_id)
                    .ok_or_else(|| error::SystemError::not_found("Chat not found"))?;
                entity.deleted_at = Some(chrono::Utc::now());
            }
            DeleteMode::Force => {
                if state.chats.remove(chat_id).is_none() {
                    return Err(error::SystemError::not_found("Chat not found"));
                }
                state.members.retain(|(member_chat, _), _| member_chat != chat_id);
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl MemberRepository for ChatMemRepository {
    async fn set_member(
        &self,
        chat_id: &str,
        user_id: &str,
        role: ChatRole,
        capacity: Option<i32>,
    ) -> Result<MemberWrite, error::SystemError> {
        let mut state = self.state().await;
        let MemoryState { chats, members } = &mut *state;

        let chat = chats
            .get_mut(chat_id)
            .filter(|chat| chat.deleted_at.is_none())
            .ok_or_else(|| error::SystemError::not_found("Chat not found"))?;

        let key = (chat_id.to_owned(), user_id.to_owned());
        if let Some(member) = members.get_mut(&key) {
            member.role = role;
            return Ok(MemberWrite { inserted: false, num_members: chat.num_members });
        }

        if capacity.is_some_and(|cap| chat.num_members >= cap) {
            return Err(error::SystemError::MaxMembersExceeded);
        }

        let now = chrono::Utc::now();
        members.insert(
            key,
            ChatMemberEntity {
                chat_id: chat_id.to_owned(),
                user_id: user_id.to_owned(),
                role,
                joined_at: now,
            },
        );
        chat.num_members += 1;
        chat.updated_at = now;

        Ok(MemberWrite { inserted: true, num_members: chat.num_members })
    }

    async fn delete_members(
        &self,
        chat_id: &str,
        members: &MemberSelector,
    ) -> Result<u64, error::SystemError> {
        let mut state = self.state().await;

        let doomed: Vec<(String, String)> = state
            .members
            .keys()
            .filter(|(member_chat, user_id)| member_chat == chat_id && selected(members, user_id))
            .cloned()
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }

        let delta = i32::try_from(doomed.len()).map_err(|err| error::SystemError::internal(err))?;
        let chat = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| error::SystemError::not_found("Chat not found"))?;
        chat.num_members -= delta;
        chat.updated_at = chrono::Utc::now();

        for key in &doomed {
            state.members.remove(key);
        }

        Ok(doomed.len() as u64)
    }

    async fn find_role(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Option<ChatRole>, error::SystemError> {
        let state = self.state().await;
        let key = (chat_id.to_owned(), user_id.to_owned());
        Ok(state.members.get(&key).map(|member| member.role))
    }

    async fn find_chat_members(
        &self,
        chat_id: &str,
        page: &Pagination,
    ) -> Result<Vec<ChatMemberEntity>, error::SystemError> {
        let state = self.state().await;

        let mut members: Vec<ChatMemberEntity> =
            state.members.values().filter(|member| member.chat_id == chat_id).cloned().collect();
        members.sort_by(|a, b| {
            (Reverse(a.role), &a.user_id).cmp(&(Reverse(b.role), &b.user_id))
        });

        let limit = page.limit().map_or(usize::MAX, |limit| limit as usize);
        Ok(members.into_iter().skip(page.offset as usize).take(limit).collect())
    }
}

#[async_trait::async_trait]
impl ChatStore for ChatMemRepository {
    async fn run_in_transaction<T, F>(&self, work: F) -> Result<T, error::SystemError>
    where
        T: Send + 'static,
        F: for<'tx> FnOnce(&'tx Self) -> BoxFuture<'tx, Result<T, error::SystemError>>
            + Send
            + 'static,
    {
        if self.in_transaction() {
            return Err(error::SystemError::NestedTransactionNotSupported);
        }

        let mut committed = self.shared.clone().lock_owned().await;
        let working = Arc::new(Mutex::new(committed.clone()));
        let scoped = ChatMemRepository { shared: self.shared.clone(), scope: Some(working.clone()) };
        log::debug!("Transaction started");

        let outcome = AssertUnwindSafe(work(&scoped)).catch_unwind().await;
        drop(scoped);

        match outcome {
            Ok(Ok(value)) => {
                *committed = std::mem::take(&mut *working.lock().await);
                log::debug!("Transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => {
                log::debug!("Transaction rolled back: {err}");
                Err(err)
            }
            Err(panic) => {
                drop(committed);
                log::error!("Transaction rolled back after panic");
                std::panic::resume_unwind(panic);
            }
        }
    }
}
