use std::{
    ops::{Deref, DerefMut},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures_util::{FutureExt, future::BoxFuture};
use sqlx::{PgConnection, PgPool, Postgres, Transaction, pool::PoolConnection};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::{
    api::error::{self, StorageResultExt},
    modules::chat::{
        model::{DeleteMode, MemberSelector, MemberWrite, NewChat, Pagination, UpdateChat},
        repository::{ChatRepository, ChatStore, MemberRepository},
        schema::{ChatEntity, ChatMemberEntity, ChatRole},
    },
};

type PgTransaction = Transaction<'static, Postgres>;

/// Chat and membership storage on Postgres.
///
/// A handle is either pool-scoped (every call checks out its own connection) or
/// transaction-scoped (every call runs on the transaction opened by
/// [`ChatStore::run_in_transaction`]).
#[derive(Clone)]
pub struct ChatPgRepository {
    pool: PgPool,
    scope: Scope,
}

#[derive(Clone)]
enum Scope {
    Pool,
    Transaction(Arc<Mutex<Option<PgTransaction>>>),
}

impl ChatPgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, scope: Scope::Pool }
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.scope, Scope::Transaction(_))
    }

    async fn acquire(&self, op: &'static str) -> Result<Conn<'_>, error::SystemError> {
        match &self.scope {
            Scope::Pool => Ok(Conn::Pooled(self.pool.acquire().await.op(op)?)),
            Scope::Transaction(cell) => Ok(Conn::Scoped(lock_transaction(cell).await?)),
        }
    }

    /// Statements issued through the returned unit commit or roll back together:
    /// on a pool-scoped handle it is a fresh transaction, otherwise the enclosing one.
    async fn begin_unit(&self, op: &'static str) -> Result<Unit<'_>, error::SystemError> {
        match &self.scope {
            Scope::Pool => Ok(Unit::Fresh(self.pool.begin().await.op(op)?)),
            Scope::Transaction(cell) => Ok(Unit::Joined(lock_transaction(cell).await?)),
        }
    }
}

async fn lock_transaction(
    cell: &Mutex<Option<PgTransaction>>,
) -> Result<MappedMutexGuard<'_, PgTransaction>, error::SystemError> {
    MutexGuard::try_map(cell.lock().await, |tx| tx.as_mut())
        .map_err(|_| error::SystemError::internal("transaction already finished"))
}

enum Conn<'a> {
    Pooled(PoolConnection<Postgres>),
    Scoped(MappedMutexGuard<'a, PgTransaction>),
}

impl Deref for Conn<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            Conn::Pooled(conn) => &**conn,
            Conn::Scoped(tx) => &***tx,
        }
    }
}

impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            Conn::Pooled(conn) => &mut **conn,
            Conn::Scoped(tx) => &mut ***tx,
        }
    }
}

enum Unit<'a> {
    Fresh(PgTransaction),
    Joined(MappedMutexGuard<'a, PgTransaction>),
}

impl Unit<'_> {
    async fn finish(self, op: &'static str) -> Result<(), error::SystemError> {
        match self {
            Unit::Fresh(tx) => tx.commit().await.op(op),
            Unit::Joined(_) => Ok(()),
        }
    }
}

impl Deref for Unit<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            Unit::Fresh(tx) => &**tx,
            Unit::Joined(tx) => &***tx,
        }
    }
}

impl DerefMut for Unit<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            Unit::Fresh(tx) => &mut **tx,
            Unit::Joined(tx) => &mut ***tx,
        }
    }
}

/// Tells apart the two reasons a guarded counter update can match no row.
async fn counter_miss(
    conn: &mut PgConnection,
    chat_id: &str,
    op: &'static str,
) -> Result<error::SystemError, error::SystemError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM chats WHERE id = $1 AND deleted_at IS NULL)",
    )
    .bind(chat_id)
    .fetch_one(conn)
    .await
    .op(op)?;

    if exists {
        Ok(error::SystemError::MaxMembersExceeded)
    } else {
        Ok(error::SystemError::not_found("Chat not found"))
    }
}

async fn rollback(tx: PgTransaction) {
    if let Err(err) = tx.rollback().await {
        log::error!("Failed to roll back transaction: {:?}", err);
    }
}

#[async_trait::async_trait]
impl ChatRepository for ChatPgRepository {
    async fn create_chat(
        &self,
        id: &str,
        chat: &NewChat,
    ) -> Result<ChatEntity, error::SystemError> {
        const OP: &str = "ChatPgRepository::create_chat";
        let mut conn = self.acquire(OP).await?;

        let chat = sqlx::query_as::<_, ChatEntity>(
            r#"
            INSERT INTO chats (id, type, name, description, avatar_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(chat.chat_type)
        .bind(&chat.name)
        .bind(&chat.description)
        .bind(&chat.avatar_url)
        .fetch_one(&mut *conn)
        .await
        .op(OP)?;

        Ok(chat)
    }

    async fn find_chat_by_id(
        &self,
        chat_id: &str,
    ) -> Result<Option<ChatEntity>, error::SystemError> {
        const OP: &str = "ChatPgRepository::find_chat_by_id";
        let mut conn = self.acquire(OP).await?;

        let chat = sqlx::query_as::<_, ChatEntity>(
            "SELECT * FROM chats WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(chat_id)
        .fetch_optional(&mut *conn)
        .await
        .op(OP)?;

        Ok(chat)
    }

    async fn update_chat(&self, chat: &UpdateChat) -> Result<ChatEntity, error::SystemError> {
        const OP: &str = "ChatPgRepository::update_chat";
        let mut conn = self.acquire(OP).await?;

        sqlx::query_as::<_, ChatEntity>(
            r#"
            UPDATE chats
            SET
                name        = $2,
                description = $3,
                avatar_url  = $4,
                updated_at  = NOW()
            WHERE id = $1
            AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(&chat.id)
        .bind(&chat.name)
        .bind(&chat.description)
        .bind(&chat.avatar_url)
        .fetch_optional(&mut *conn)
        .await
        .op(OP)?
        .ok_or_else(|| error::SystemError::not_found("Chat not found"))
    }

    async fn delete_chat(&self, chat_id: &str, mode: DeleteMode) -> Result<(), error::SystemError> {
        const OP: &str = "ChatPgRepository::delete_chat";
        let mut conn = self.acquire(OP).await?;

        let query = match mode {
            DeleteMode::Soft => {
                "UPDATE chats SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL"
            }
            DeleteMode::Force => "DELETE FROM chats WHERE id = $1",
        };

        let rows = sqlx::query(query)
            .bind(chat_id)
            .execute(&mut *conn)
            .await
            .op(OP)?
            .rows_affected();

        if rows == 0 {
            return Err(error::SystemError::not_found("Chat not found"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MemberRepository for ChatPgRepository {
    async fn set_member(
        &self,
        chat_id: &str,
        user_id: &str,
        role: ChatRole,
        capacity: Option<i32>,
    ) -> Result<MemberWrite, error::SystemError> {
        const OP: &str = "ChatPgRepository::set_member";
        let mut unit = self.begin_unit(OP).await?;

        // xmax is only set on the conflict branch
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO members (chat_id, user_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (chat_id, user_id) DO UPDATE
            SET role = EXCLUDED.role
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(role)
        .fetch_one(&mut *unit)
        .await
        .op(OP)?;

        let num_members: Option<i32> = if inserted {
            sqlx::query_scalar(
                r#"
                UPDATE chats
                SET num_members = num_members + 1,
                    updated_at  = NOW()
                WHERE id = $1
                AND deleted_at IS NULL
                AND ($2::INTEGER IS NULL OR num_members < $2)
                RETURNING num_members
                "#,
            )
            .bind(chat_id)
            .bind(capacity)
            .fetch_optional(&mut *unit)
            .await
            .op(OP)?
        } else {
            sqlx::query_scalar(
                "SELECT num_members FROM chats WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(chat_id)
            .fetch_optional(&mut *unit)
            .await
            .op(OP)?
        };

        let Some(num_members) = num_members else {
            // dropping a fresh unit rolls the membership write back
            return Err(counter_miss(&mut unit, chat_id, OP).await?);
        };

        unit.finish(OP).await?;
        Ok(MemberWrite { inserted, num_members })
    }

    async fn delete_members(
        &self,
        chat_id: &str,
        members: &MemberSelector,
    ) -> Result<u64, error::SystemError> {
        const OP: &str = "ChatPgRepository::delete_members";

        let user_ids: Option<&[String]> = match members {
            MemberSelector::All => None,
            MemberSelector::Users(ids) => Some(ids.as_slice()),
        };

        let mut unit = self.begin_unit(OP).await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM members
            WHERE chat_id = $1
            AND ($2::TEXT[] IS NULL OR user_id = ANY($2))
            "#,
        )
        .bind(chat_id)
        .bind(user_ids)
        .execute(&mut *unit)
        .await
        .op(OP)?
        .rows_affected();

        if deleted > 0 {
            let delta = i32::try_from(deleted).map_err(|err| error::SystemError::internal(err))?;

            sqlx::query_scalar::<_, i32>(
                r#"
                UPDATE chats
                SET num_members = num_members - $2,
                    updated_at  = NOW()
                WHERE id = $1
                RETURNING num_members
                "#,
            )
            .bind(chat_id)
            .bind(delta)
            .fetch_optional(&mut *unit)
            .await
            .op(OP)?
            .ok_or_else(|| error::SystemError::not_found("Chat not found"))?;
        }

        unit.finish(OP).await?;
        Ok(deleted)
    }

    async fn find_role(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Option<ChatRole>, error::SystemError> {
        const OP: &str = "ChatPgRepository::find_role";
        let mut conn = self.acquire(OP).await?;

        let role = sqlx::query_scalar::<_, ChatRole>(
            "SELECT role FROM members WHERE chat_id = $1 AND user_id = $2",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .op(OP)?;

        Ok(role)
    }

    async fn find_chat_members(
        &self,
        chat_id: &str,
        page: &Pagination,
    ) -> Result<Vec<ChatMemberEntity>, error::SystemError> {
        const OP: &str = "ChatPgRepository::find_chat_members";
        let mut conn = self.acquire(OP).await?;

        let members = sqlx::query_as::<_, ChatMemberEntity>(
            r#"
            SELECT chat_id, user_id, role, joined_at
            FROM members
            WHERE chat_id = $1
            ORDER BY role DESC, user_id COLLATE "C" ASC
            LIMIT $2
            OFFSET $3
            "#,
        )
        .bind(chat_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&mut *conn)
        .await
        .op(OP)?;

        Ok(members)
    }
}

#[async_trait::async_trait]
impl ChatStore for ChatPgRepository {
    async fn run_in_transaction<T, F>(&self, work: F) -> Result<T, error::SystemError>
    where
        T: Send + 'static,
        F: for<'tx> FnOnce(&'tx Self) -> BoxFuture<'tx, Result<T, error::SystemError>>
            + Send
            + 'static,
    {
        const OP: &str = "ChatPgRepository::run_in_transaction";

        if self.in_transaction() {
            return Err(error::SystemError::NestedTransactionNotSupported);
        }

        let tx = self.pool.begin().await.op(OP)?;
        let cell = Arc::new(Mutex::new(Some(tx)));
        let scoped = ChatPgRepository { pool: self.pool.clone(), scope: Scope::Transaction(cell.clone()) };
        log::debug!("Transaction started");

        let outcome = AssertUnwindSafe(work(&scoped)).catch_unwind().await;
        drop(scoped);

        let tx = cell.lock().await.take();

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                if let Some(tx) = tx {
                    rollback(tx).await;
                }
                log::error!("Transaction rolled back after panic");
                std::panic::resume_unwind(panic);
            }
        };

        let tx = tx.ok_or_else(|| error::SystemError::internal("transaction already finished"))?;

        match result {
            Ok(value) => {
                tx.commit().await.op(OP)?;
                log::debug!("Transaction committed");
                Ok(value)
            }
            Err(err) => {
                rollback(tx).await;
                log::debug!("Transaction rolled back: {err}");
                Err(err)
            }
        }
    }
}
