//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p ledger-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use ledger_store::{
    EventRecord, EventUserSummary, Fulfillment, FulfillmentKey, FulfillmentStatus, LedgerStore,
    PostgresLedgerStore, Recipient, RetryPolicy, StoreError, SummaryDelta, SummaryWrite, Ticket,
    TicketRef, TokenIndexEntry, Transaction, Transfer, TransferId, TransferStatus, UserId,
    run_transaction,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            // Run migrations using raw_sql to execute multiple statements
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_ledger_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresLedgerStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE event_user_summaries, fulfillments, transfers, token_index, tickets, events",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresLedgerStore::new(pool)
}

async fn seed_ticket(store: &PostgresLedgerStore, quantity: u32) -> (EventRecord, Ticket) {
    let event = EventRecord::new("Concert", Utc::now(), 100);
    store.create_event(&event).await.unwrap();

    let ticket = Ticket::new(
        event.id,
        UserId::from("alice"),
        quantity,
        format!("tok-{}", uuid::Uuid::new_v4()),
        Utc::now(),
    );
    let mut tx = store.begin().await.unwrap();
    tx.insert_ticket(&ticket).await.unwrap();
    tx.insert_token(&TokenIndexEntry {
        token: ticket.token.clone().unwrap(),
        event_id: event.id,
        ticket_id: ticket.id,
        created_at: Utc::now(),
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();

    (event, ticket)
}

#[tokio::test]
async fn committed_ticket_is_readable() {
    let store = get_test_store().await;
    let (event, ticket) = seed_ticket(&store, 2).await;

    let loaded = store.get_ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(loaded, ticket);

    let entry = store
        .lookup_token(ticket.token.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.ticket_id, ticket.id);
    assert_eq!(entry.event_id, event.id);

    let owned = store
        .tickets_for_owner(event.id, &UserId::from("alice"))
        .await
        .unwrap();
    assert_eq!(owned.len(), 1);
}

#[tokio::test]
async fn rolled_back_writes_are_discarded() {
    let store = get_test_store().await;
    let event = EventRecord::new("Concert", Utc::now(), 10);
    store.create_event(&event).await.unwrap();

    let ticket = Ticket::new(event.id, UserId::from("bob"), 1, "tok-rb".into(), Utc::now());
    let mut tx = store.begin().await.unwrap();
    tx.insert_ticket(&ticket).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(store.get_ticket(ticket.id).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_event_is_conflict() {
    let store = get_test_store().await;
    let event = EventRecord::new("Concert", Utc::now(), 10);
    store.create_event(&event).await.unwrap();

    let result = store.create_event(&event).await;
    assert!(matches!(result, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn duplicate_fulfillment_insert_is_conflict() {
    let store = get_test_store().await;
    let key = FulfillmentKey::from("order-1");

    let mut tx = store.begin().await.unwrap();
    tx.insert_fulfillment(&Fulfillment::processing(key.clone(), Utc::now()))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let result = tx
        .insert_fulfillment(&Fulfillment::processing(key.clone(), Utc::now()))
        .await;
    assert!(matches!(result, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn fulfillment_refs_roundtrip_through_jsonb() {
    let store = get_test_store().await;
    let (event, ticket) = seed_ticket(&store, 3).await;
    let key = FulfillmentKey::from("order-2");

    let mut record = Fulfillment::processing(key.clone(), Utc::now());
    let mut tx = store.begin().await.unwrap();
    tx.insert_fulfillment(&record).await.unwrap();
    record.status = FulfillmentStatus::Completed;
    record.created_ticket_refs.push(TicketRef {
        event_id: event.id,
        ticket_id: ticket.id,
        owner_id: ticket.owner_id.clone(),
        quantity: 3,
    });
    tx.update_fulfillment(&record).await.unwrap();
    tx.commit().await.unwrap();

    let loaded = store.get_fulfillment(&key).await.unwrap().unwrap();
    assert_eq!(loaded.status, FulfillmentStatus::Completed);
    assert_eq!(loaded.created_ticket_refs.len(), 1);
    assert_eq!(loaded.created_ticket_refs[0].quantity, 3);
}

#[tokio::test]
async fn update_of_missing_ticket_is_conflict() {
    let store = get_test_store().await;
    let event = EventRecord::new("Concert", Utc::now(), 10);
    store.create_event(&event).await.unwrap();

    let ticket = Ticket::new(event.id, UserId::from("bob"), 1, "tok-x".into(), Utc::now());
    let mut tx = store.begin().await.unwrap();
    let result = tx.update_ticket(&ticket).await;
    assert!(matches!(result, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn summary_increments_accumulate() {
    let store = get_test_store().await;
    let event = EventRecord::new("Concert", Utc::now(), 10);
    store.create_event(&event).await.unwrap();
    let user = UserId::from("carol");

    for delta in [SummaryDelta::tickets(2), SummaryDelta::one_use()] {
        let mut tx = store.begin().await.unwrap();
        tx.increment_summary(event.id, &user, delta).await.unwrap();
        tx.commit().await.unwrap();
    }

    let summary = store.get_summary(event.id, &user).await.unwrap().unwrap();
    assert_eq!(summary.total_tickets, 2);
    assert_eq!(summary.used_count, 1);
}

#[tokio::test]
async fn write_summaries_only_overwrites_unchanged_rows() {
    let store = get_test_store().await;
    let event = EventRecord::new("Concert", Utc::now(), 10);
    store.create_event(&event).await.unwrap();
    let user = UserId::from("dave");

    let mut tx = store.begin().await.unwrap();
    tx.increment_summary(event.id, &user, SummaryDelta::tickets(9))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let seen = store.get_summary(event.id, &user).await.unwrap();
    let mut fixed = EventUserSummary::empty(event.id, user.clone(), Utc::now());
    fixed.total_tickets = 4;
    let write = SummaryWrite {
        summary: fixed,
        expected: seen,
    };
    assert_eq!(store.write_summaries(&[write.clone()]).await.unwrap(), 1);

    // The row now holds 4, so a second write computed against 9 is skipped.
    let mut stale = write.summary.clone();
    stale.total_tickets = 1;
    let skipped = SummaryWrite {
        summary: stale,
        expected: write.expected.clone(),
    };
    assert_eq!(store.write_summaries(&[skipped]).await.unwrap(), 0);

    // Inserting a row that appeared after it was read is skipped too.
    let absent = SummaryWrite {
        summary: EventUserSummary::empty(event.id, user.clone(), Utc::now()),
        expected: None,
    };
    assert_eq!(store.write_summaries(&[absent]).await.unwrap(), 0);

    let summaries = store.summaries_for_event(event.id).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_tickets, 4);
}

#[tokio::test]
async fn transfer_is_found_by_claim_hash() {
    let store = get_test_store().await;
    let (event, ticket) = seed_ticket(&store, 1).await;

    let transfer = Transfer {
        id: TransferId::new(),
        event_id: event.id,
        ticket_id: ticket.id,
        from_owner_id: ticket.owner_id.clone(),
        recipient: Recipient {
            user_id: None,
            email: "bob@example.com".into(),
            username: Some("bob".into()),
        },
        claim_token_hash: "abc123".into(),
        status: TransferStatus::Pending,
        created_at: Utc::now(),
        expires_at: Utc::now() + chrono::Duration::hours(72),
        claimed_by_user_id: None,
        claimed_ticket_id: None,
        cancelled_by: None,
    };
    let mut tx = store.begin().await.unwrap();
    tx.insert_transfer(&transfer).await.unwrap();
    tx.commit().await.unwrap();

    let found = store
        .find_transfer_by_claim_hash("abc123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, transfer.id);
    assert_eq!(found.recipient.username.as_deref(), Some("bob"));
}

async fn use_once(
    ticket_id: ledger_store::TicketId,
    tx: &mut dyn Transaction,
) -> Result<bool, StoreError> {
    let Some(mut ticket) = tx.get_ticket(ticket_id).await? else {
        return Ok(false);
    };
    if ticket.used_count >= ticket.quantity {
        return Ok(false);
    }
    ticket.used_count += 1;
    ticket.active = ticket.derived_active();
    tx.update_ticket(&ticket).await?;
    Ok(true)
}

#[tokio::test]
async fn concurrent_uses_never_exceed_quantity() {
    let store = Arc::new(get_test_store().await);
    let (_, ticket) = seed_ticket(&store, 3).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let ticket_id = ticket.id;
        handles.push(tokio::spawn(async move {
            run_transaction(store.as_ref(), &RetryPolicy::new(), |tx| {
                use_once(ticket_id, tx).boxed()
            })
            .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            successes += 1;
        }
    }

    assert_eq!(successes, 3);
    let loaded = store.get_ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(loaded.used_count, 3);
    assert!(!loaded.active);
}
