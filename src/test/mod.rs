use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    api::error,
    middlewares::RequestContext,
    modules::chat::{
        model::{DeleteMode, MemberSelector, MemberWrite, NewChat, Pagination},
        repository::{ChatRepository, ChatStore, MemberRepository},
        repository_pg::ChatPgRepository,
        schema::{ChatRole, ChatType},
        service::ChatService,
    },
    utils::UuidV7Generator,
};

fn repo(pool: PgPool) -> ChatPgRepository {
    let _ = env_logger::builder().is_test(true).try_init();
    ChatPgRepository::new(pool)
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn create_and_find_chat(pool: PgPool) {
    let repo = repo(pool);

    let created = repo
        .create_chat("c1", &NewChat::new(ChatType::Group, "Team").with_description("first"))
        .await
        .unwrap();
    let found = repo.find_chat_by_id("c1").await.unwrap().unwrap();

    assert_eq!(found.id, created.id);
    assert_eq!(found.chat_type, ChatType::Group);
    assert_eq!(found.description, "first");
    assert_eq!(found.num_members, 0);
    assert!(repo.find_chat_by_id("c2").await.unwrap().is_none());

    let err = repo.create_chat("c1", &NewChat::new(ChatType::Group, "Other")).await.unwrap_err();
    assert!(matches!(err, error::SystemError::Conflict(_)));
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn set_member_counts_inserts_only(pool: PgPool) {
    let repo = repo(pool);
    repo.create_chat("c1", &NewChat::new(ChatType::Group, "Team")).await.unwrap();

    let first = repo.set_member("c1", "u1", ChatRole::Owner, None).await.unwrap();
    let again = repo.set_member("c1", "u1", ChatRole::Member, None).await.unwrap();

    assert_eq!(first, MemberWrite { inserted: true, num_members: 1 });
    assert_eq!(again, MemberWrite { inserted: false, num_members: 1 });
    assert_eq!(repo.find_role("c1", "u1").await.unwrap(), Some(ChatRole::Member));
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn capacity_is_checked_with_the_increment(pool: PgPool) {
    let repo = repo(pool);
    repo.create_chat("c1", &NewChat::new(ChatType::Group, "Team")).await.unwrap();
    repo.set_member("c1", "u1", ChatRole::Owner, Some(2)).await.unwrap();
    repo.set_member("c1", "u2", ChatRole::Member, Some(2)).await.unwrap();

    let err = repo.set_member("c1", "u3", ChatRole::Member, Some(2)).await.unwrap_err();

    assert!(matches!(err, error::SystemError::MaxMembersExceeded));
    assert_eq!(repo.find_role("c1", "u3").await.unwrap(), None);
    assert_eq!(repo.find_chat_by_id("c1").await.unwrap().unwrap().num_members, 2);

    let err = repo.set_member("missing", "u1", ChatRole::Owner, None).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("ChatPgRepository::set_member"), "{err}");
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn delete_members_and_listing(pool: PgPool) {
    let repo = repo(pool);
    repo.create_chat("c1", &NewChat::new(ChatType::Channel, "news")).await.unwrap();
    repo.set_member("c1", "b", ChatRole::Member, None).await.unwrap();
    repo.set_member("c1", "z", ChatRole::Owner, None).await.unwrap();
    repo.set_member("c1", "a", ChatRole::Member, None).await.unwrap();

    let members = repo.find_chat_members("c1", &Pagination::default()).await.unwrap();
    let order: Vec<&str> = members.iter().map(|m| m.user_id.as_str()).collect();
    assert_eq!(order, ["z", "a", "b"]);

    let selector = MemberSelector::Users(vec!["b".into(), "stranger".into()]);
    assert_eq!(repo.delete_members("c1", &selector).await.unwrap(), 1);
    assert_eq!(repo.find_chat_by_id("c1").await.unwrap().unwrap().num_members, 2);

    assert_eq!(repo.delete_members("c1", &MemberSelector::All).await.unwrap(), 2);
    assert_eq!(repo.find_chat_by_id("c1").await.unwrap().unwrap().num_members, 0);
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn soft_and_force_delete(pool: PgPool) {
    let repo = repo(pool);
    repo.create_chat("c1", &NewChat::new(ChatType::Group, "one")).await.unwrap();
    repo.create_chat("c2", &NewChat::new(ChatType::Group, "two")).await.unwrap();
    repo.set_member("c2", "u1", ChatRole::Owner, None).await.unwrap();

    repo.delete_chat("c1", DeleteMode::Soft).await.unwrap();
    assert!(repo.find_chat_by_id("c1").await.unwrap().is_none());
    assert!(repo.delete_chat("c1", DeleteMode::Soft).await.unwrap_err().is_not_found());

    repo.delete_chat("c2", DeleteMode::Force).await.unwrap();
    assert_eq!(repo.find_role("c2", "u1").await.unwrap(), None);
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn transaction_rolls_back_on_error(pool: PgPool) {
    let repo = repo(pool);

    let err = repo
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.create_chat("c1", &NewChat::new(ChatType::Group, "Team")).await?;
                tx.set_member("c1", "u1", ChatRole::Owner, Some(0)).await?;
                Ok::<_, error::SystemError>(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, error::SystemError::MaxMembersExceeded));
    assert!(repo.find_chat_by_id("c1").await.unwrap().is_none());
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn nested_transaction_is_rejected(pool: PgPool) {
    let repo = repo(pool);

    let err = repo
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.create_chat("c1", &NewChat::new(ChatType::Group, "Team")).await?;
                tx.run_in_transaction(|inner| {
                    Box::pin(async move {
                        inner.set_member("c1", "u1", ChatRole::Owner, None).await?;
                        Ok::<_, error::SystemError>(())
                    })
                })
                .await
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, error::SystemError::NestedTransactionNotSupported));
    assert!(repo.find_chat_by_id("c1").await.unwrap().is_none());
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn service_runs_on_postgres(pool: PgPool) {
    let store = Arc::new(repo(pool));
    let svc = ChatService::with_dependencies(store, Arc::new(UuidV7Generator), 200);
    let ctx = RequestContext::with_user("u1");

    let chat = svc.create_chat(&ctx, NewChat::new(ChatType::Dialog, "dropped")).await.unwrap();
    svc.set_member(&ctx, &chat.id, "u2", ChatRole::Member).await.unwrap();

    let err = svc.set_member(&ctx, &chat.id, "u3", ChatRole::Member).await.unwrap_err();
    assert!(matches!(err, error::SystemError::MaxMembersExceeded), "{err}");

    let stored = svc.get_chat(&ctx, &chat.id).await.unwrap();
    assert_eq!(stored.name, "");
    assert_eq!(stored.num_members, 2);
    assert_eq!(svc.get_role(&ctx, &chat.id, "u2").await.unwrap(), ChatRole::Owner);

    svc.delete_chat(&ctx, &chat.id, DeleteMode::Soft).await.unwrap();
    assert!(svc.get_chat(&ctx, &chat.id).await.unwrap_err().is_not_found());
    assert!(
        svc.find_chat_members(&ctx, &chat.id, &Pagination::default()).await.unwrap().is_empty()
    );
}

#[sqlx::test(migrations = false)]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn bundled_migrations_apply_cleanly(pool: PgPool) {
    crate::configs::run_migrations(&pool).await.unwrap();
    crate::configs::run_migrations(&pool).await.unwrap();

    let repo = repo(pool);
    repo.create_chat("c1", &NewChat::new(ChatType::Dialog, "")).await.unwrap();
    assert_eq!(repo.find_chat_by_id("c1").await.unwrap().unwrap().num_members, 0);
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn deadline_mid_transaction_rolls_back(pool: PgPool) {
    let repo = repo(pool);
    let ctx = RequestContext::with_user("u1").with_timeout(std::time::Duration::from_millis(100));

    let err = ctx
        .run(repo.run_in_transaction(|tx| {
            Box::pin(async move {
                tx.create_chat("c1", &NewChat::new(ChatType::Group, "Team")).await?;
                tx.set_member("c1", "u1", ChatRole::Owner, None).await?;
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok::<_, error::SystemError>(())
            })
        }))
        .await
        .unwrap_err();

    assert!(matches!(err, error::SystemError::DeadlineExceeded));
    assert!(repo.find_chat_by_id("c1").await.unwrap().is_none());
    assert_eq!(repo.find_role("c1", "u1").await.unwrap(), None);
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn panic_in_transaction_rolls_back(pool: PgPool) {
    let repo = repo(pool);
    let handle = repo.clone();

    let joined = tokio::spawn(async move {
        handle
            .run_in_transaction(|tx| {
                Box::pin(async move {
                    tx.create_chat("c1", &NewChat::new(ChatType::Group, "Team")).await?;
                    if tx.in_transaction() {
                        panic!("unit of work failed");
                    }
                    Ok::<_, error::SystemError>(())
                })
            })
            .await
    })
    .await;

    assert!(joined.unwrap_err().is_panic());
    assert!(repo.find_chat_by_id("c1").await.unwrap().is_none());
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn concurrent_adds_never_pass_the_group_limit(pool: PgPool) {
    let store = Arc::new(repo(pool));
    let svc = ChatService::with_dependencies(store.clone(), Arc::new(UuidV7Generator), 5);
    let ctx = RequestContext::with_user("owner");
    let chat = svc.create_chat(&ctx, NewChat::new(ChatType::Group, "Team")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let (svc, ctx, chat_id) = (svc.clone(), ctx.clone(), chat.id.clone());
        tasks.push(tokio::spawn(async move {
            svc.set_member(&ctx, &chat_id, &format!("u{i}"), ChatRole::Member).await
        }));
    }

    let mut added = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => added += 1,
            Err(err) => assert!(matches!(err, error::SystemError::MaxMembersExceeded), "{err}"),
        }
    }

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM members WHERE chat_id = $1")
        .bind(&chat.id)
        .fetch_one(store.get_pool())
        .await
        .unwrap();
    let stored = svc.get_chat(&ctx, &chat.id).await.unwrap();

    assert_eq!(added, 4);
    assert_eq!(stored.num_members, 5);
    assert_eq!(i64::from(stored.num_members), rows);
}

#[sqlx::test]
#[ignore = "requires a running Postgres at DATABASE_URL"]
async fn concurrent_readds_count_once(pool: PgPool) {
    let store = Arc::new(repo(pool));
    let svc = ChatService::with_dependencies(store.clone(), Arc::new(UuidV7Generator), 200);
    let ctx = RequestContext::with_user("owner");
    let chat = svc.create_chat(&ctx, NewChat::new(ChatType::Group, "Team")).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let (svc, ctx, chat_id) = (svc.clone(), ctx.clone(), chat.id.clone());
        tasks.push(tokio::spawn(async move {
            svc.set_member(&ctx, &chat_id, "u1", ChatRole::Member).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM members WHERE chat_id = $1")
        .bind(&chat.id)
        .fetch_one(store.get_pool())
        .await
        .unwrap();

    assert_eq!(svc.get_chat(&ctx, &chat.id).await.unwrap().num_members, 2);
    assert_eq!(rows, 2);
}
