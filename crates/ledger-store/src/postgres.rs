use async_trait::async_trait;
use chrono::Utc;
use common::{EventId, FulfillmentKey, TicketId, TransferId, UserId};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use crate::documents::{
    EventRecord, EventUserSummary, Fulfillment, FulfillmentStatus, Recipient, SummaryDelta,
    SummaryWrite, Ticket, TokenIndexEntry, Transfer, TransferStatus,
};
use crate::store::{LedgerStore, Transaction, validate_batch};
use crate::{Result, StoreError};

const TICKET_COLUMNS: &str = "id, event_id, owner_id, quantity, used_count, active, token, \
     pending_transfer_id, previous_owner_id, order_ref, issued_at, transferred_to";

const TRANSFER_COLUMNS: &str = "id, event_id, ticket_id, from_owner_id, to_user_id, to_email, \
     to_username, claim_token_hash, status, created_at, expires_at, claimed_by_user_id, \
     claimed_ticket_id, cancelled_by";

/// SQLSTATE codes that mean "another transaction got there first".
const CONFLICT_CODES: [&str; 3] = ["40001", "40P01", "23505"];

/// PostgreSQL-backed ledger store.
///
/// Transactions run at READ COMMITTED and lock every row they read with
/// `SELECT ... FOR UPDATE`, so two transactions touching the same ticket
/// serialize on the row lock. Creating a document that already exists trips
/// a unique constraint, which surfaces as [`StoreError::Conflict`].
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Creates a new PostgreSQL ledger store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

fn map_db_error(e: sqlx::Error, what: &str) -> StoreError {
    let is_conflict = match &e {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| CONFLICT_CODES.contains(&code.as_ref())),
        _ => false,
    };
    if is_conflict {
        return StoreError::Conflict(what.to_string());
    }
    StoreError::Database(e)
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidData(format!("{column} = {value}")))
}

fn row_to_event(row: &PgRow) -> Result<EventRecord> {
    Ok(EventRecord {
        id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
        name: row.try_get("name")?,
        starts_at: row.try_get("starts_at")?,
        remaining_quantity: to_u32(row.try_get("remaining_quantity")?, "remaining_quantity")?,
    })
}

fn row_to_ticket(row: &PgRow) -> Result<Ticket> {
    Ok(Ticket {
        id: TicketId::from_uuid(row.try_get::<Uuid, _>("id")?),
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
        owner_id: UserId::new(row.try_get::<String, _>("owner_id")?),
        quantity: to_u32(row.try_get("quantity")?, "quantity")?,
        used_count: to_u32(row.try_get("used_count")?, "used_count")?,
        active: row.try_get("active")?,
        token: row.try_get("token")?,
        pending_transfer_id: row
            .try_get::<Option<Uuid>, _>("pending_transfer_id")?
            .map(TransferId::from_uuid),
        previous_owner_id: row
            .try_get::<Option<String>, _>("previous_owner_id")?
            .map(UserId::new),
        order_ref: row.try_get("order_ref")?,
        issued_at: row.try_get("issued_at")?,
        transferred_to: row
            .try_get::<Option<Uuid>, _>("transferred_to")?
            .map(TicketId::from_uuid),
    })
}

fn row_to_token(row: &PgRow) -> Result<TokenIndexEntry> {
    Ok(TokenIndexEntry {
        token: row.try_get("token")?,
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
        ticket_id: TicketId::from_uuid(row.try_get::<Uuid, _>("ticket_id")?),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer> {
    let status: String = row.try_get("status")?;
    Ok(Transfer {
        id: TransferId::from_uuid(row.try_get::<Uuid, _>("id")?),
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
        ticket_id: TicketId::from_uuid(row.try_get::<Uuid, _>("ticket_id")?),
        from_owner_id: UserId::new(row.try_get::<String, _>("from_owner_id")?),
        recipient: Recipient {
            user_id: row
                .try_get::<Option<String>, _>("to_user_id")?
                .map(UserId::new),
            email: row.try_get("to_email")?,
            username: row.try_get("to_username")?,
        },
        claim_token_hash: row.try_get("claim_token_hash")?,
        status: TransferStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidData(format!("transfer status {status}")))?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        claimed_by_user_id: row
            .try_get::<Option<String>, _>("claimed_by_user_id")?
            .map(UserId::new),
        claimed_ticket_id: row
            .try_get::<Option<Uuid>, _>("claimed_ticket_id")?
            .map(TicketId::from_uuid),
        cancelled_by: row.try_get("cancelled_by")?,
    })
}

fn row_to_fulfillment(row: &PgRow) -> Result<Fulfillment> {
    let status: String = row.try_get("status")?;
    Ok(Fulfillment {
        key: FulfillmentKey::new(row.try_get::<String, _>("key")?),
        status: FulfillmentStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidData(format!("fulfillment status {status}")))?,
        created_ticket_refs: serde_json::from_value(row.try_get("created_ticket_refs")?)?,
        errors: serde_json::from_value(row.try_get("errors")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_summary(row: &PgRow) -> Result<EventUserSummary> {
    Ok(EventUserSummary {
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        total_tickets: row.try_get("total_tickets")?,
        used_count: row.try_get("used_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn create_event(&self, event: &EventRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, name, starts_at, remaining_quantity)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.name)
        .bind(event.starts_at)
        .bind(i64::from(event.remaining_quantity))
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error(e, "event"))?;
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<EventRecord>> {
        let row = sqlx::query(
            "SELECT id, name, starts_at, remaining_quantity FROM events WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn list_event_ids(&self) -> Result<Vec<EventId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM events")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(EventId::from_uuid).collect())
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>> {
        let row = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_ticket).transpose()
    }

    async fn lookup_token(&self, token: &str) -> Result<Option<TokenIndexEntry>> {
        let row = sqlx::query(
            "SELECT token, event_id, ticket_id, created_at FROM token_index WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_token).transpose()
    }

    async fn tickets_for_event(&self, event_id: EventId) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE event_id = $1 ORDER BY issued_at ASC, id ASC"
        ))
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_ticket).collect()
    }

    async fn tickets_for_owner(&self, event_id: EventId, owner_id: &UserId) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE event_id = $1 AND owner_id = $2 \
             ORDER BY issued_at ASC, id ASC"
        ))
        .bind(event_id.as_uuid())
        .bind(owner_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_ticket).collect()
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn find_transfer_by_claim_hash(&self, hash: &str) -> Result<Option<Transfer>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE claim_token_hash = $1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn get_fulfillment(&self, key: &FulfillmentKey) -> Result<Option<Fulfillment>> {
        let row = sqlx::query(
            r#"
            SELECT key, status, created_ticket_refs, errors, created_at, updated_at
            FROM fulfillments
            WHERE key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_fulfillment).transpose()
    }

    async fn get_summary(
        &self,
        event_id: EventId,
        user_id: &UserId,
    ) -> Result<Option<EventUserSummary>> {
        let row = sqlx::query(
            r#"
            SELECT event_id, user_id, total_tickets, used_count, updated_at
            FROM event_user_summaries
            WHERE event_id = $1 AND user_id = $2
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_summary).transpose()
    }

    async fn summaries_for_event(&self, event_id: EventId) -> Result<Vec<EventUserSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, user_id, total_tickets, used_count, updated_at
            FROM event_user_summaries
            WHERE event_id = $1
            ORDER BY user_id ASC
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_summary).collect()
    }

    async fn write_summaries(&self, writes: &[SummaryWrite]) -> Result<usize> {
        validate_batch(writes.len())?;

        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for write in writes {
            let summary = &write.summary;
            // Both statements match nothing once a live increment has moved
            // the row, so the row is skipped rather than overwritten.
            let result = match &write.expected {
                Some(expected) => {
                    sqlx::query(
                        r#"
                        UPDATE event_user_summaries
                        SET total_tickets = $3, used_count = $4, updated_at = $5
                        WHERE event_id = $1 AND user_id = $2
                          AND total_tickets = $6 AND used_count = $7
                        "#,
                    )
                    .bind(summary.event_id.as_uuid())
                    .bind(summary.user_id.as_str())
                    .bind(summary.total_tickets)
                    .bind(summary.used_count)
                    .bind(summary.updated_at)
                    .bind(expected.total_tickets)
                    .bind(expected.used_count)
                    .execute(&mut *tx)
                    .await
                }
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO event_user_summaries (event_id, user_id, total_tickets, used_count, updated_at)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (event_id, user_id) DO NOTHING
                        "#,
                    )
                    .bind(summary.event_id.as_uuid())
                    .bind(summary.user_id.as_str())
                    .bind(summary.total_tickets)
                    .bind(summary.used_count)
                    .bind(summary.updated_at)
                    .execute(&mut *tx)
                    .await
                }
            }
            .map_err(|e| map_db_error(e, "event user summary"))?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }
}

/// Transaction over [`PostgresLedgerStore`].
struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn write_ticket(&mut self, ticket: &Ticket, insert: bool) -> Result<()> {
        let sql = if insert {
            r#"
            INSERT INTO tickets (id, event_id, owner_id, quantity, used_count, active, token,
                pending_transfer_id, previous_owner_id, order_ref, issued_at, transferred_to)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#
        } else {
            r#"
            UPDATE tickets SET
                event_id = $2, owner_id = $3, quantity = $4, used_count = $5, active = $6,
                token = $7, pending_transfer_id = $8, previous_owner_id = $9, order_ref = $10,
                issued_at = $11, transferred_to = $12
            WHERE id = $1
            "#
        };

        let result = sqlx::query(sql)
            .bind(ticket.id.as_uuid())
            .bind(ticket.event_id.as_uuid())
            .bind(ticket.owner_id.as_str())
            .bind(i64::from(ticket.quantity))
            .bind(i64::from(ticket.used_count))
            .bind(ticket.active)
            .bind(&ticket.token)
            .bind(ticket.pending_transfer_id.map(|id| id.as_uuid()))
            .bind(ticket.previous_owner_id.as_ref().map(|id| id.as_str()))
            .bind(&ticket.order_ref)
            .bind(ticket.issued_at)
            .bind(ticket.transferred_to.map(|id| id.as_uuid()))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_db_error(e, "ticket"))?;

        if !insert && result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("ticket {}", ticket.id)));
        }
        Ok(())
    }

    async fn write_transfer(&mut self, transfer: &Transfer, insert: bool) -> Result<()> {
        let sql = if insert {
            r#"
            INSERT INTO transfers (id, event_id, ticket_id, from_owner_id, to_user_id, to_email,
                to_username, claim_token_hash, status, created_at, expires_at,
                claimed_by_user_id, claimed_ticket_id, cancelled_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#
        } else {
            r#"
            UPDATE transfers SET
                event_id = $2, ticket_id = $3, from_owner_id = $4, to_user_id = $5,
                to_email = $6, to_username = $7, claim_token_hash = $8, status = $9,
                created_at = $10, expires_at = $11, claimed_by_user_id = $12,
                claimed_ticket_id = $13, cancelled_by = $14
            WHERE id = $1
            "#
        };

        let result = sqlx::query(sql)
            .bind(transfer.id.as_uuid())
            .bind(transfer.event_id.as_uuid())
            .bind(transfer.ticket_id.as_uuid())
            .bind(transfer.from_owner_id.as_str())
            .bind(transfer.recipient.user_id.as_ref().map(|id| id.as_str()))
            .bind(&transfer.recipient.email)
            .bind(&transfer.recipient.username)
            .bind(&transfer.claim_token_hash)
            .bind(transfer.status.as_str())
            .bind(transfer.created_at)
            .bind(transfer.expires_at)
            .bind(transfer.claimed_by_user_id.as_ref().map(|id| id.as_str()))
            .bind(transfer.claimed_ticket_id.map(|id| id.as_uuid()))
            .bind(&transfer.cancelled_by)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_db_error(e, "transfer"))?;

        if !insert && result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("transfer {}", transfer.id)));
        }
        Ok(())
    }

    async fn write_fulfillment(&mut self, fulfillment: &Fulfillment, insert: bool) -> Result<()> {
        let sql = if insert {
            r#"
            INSERT INTO fulfillments (key, status, created_ticket_refs, errors, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#
        } else {
            r#"
            UPDATE fulfillments SET
                status = $2, created_ticket_refs = $3, errors = $4, created_at = $5, updated_at = $6
            WHERE key = $1
            "#
        };

        let result = sqlx::query(sql)
            .bind(fulfillment.key.as_str())
            .bind(fulfillment.status.as_str())
            .bind(serde_json::to_value(&fulfillment.created_ticket_refs)?)
            .bind(serde_json::to_value(&fulfillment.errors)?)
            .bind(fulfillment.created_at)
            .bind(fulfillment.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_db_error(e, "fulfillment"))?;

        if !insert && result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("fulfillment {}", fulfillment.key)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn get_event(&mut self, id: EventId) -> Result<Option<EventRecord>> {
        let row = sqlx::query(
            "SELECT id, name, starts_at, remaining_quantity FROM events WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "event"))?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn update_event(&mut self, event: &EventRecord) -> Result<()> {
        sqlx::query(
            "UPDATE events SET name = $2, starts_at = $3, remaining_quantity = $4 WHERE id = $1",
        )
        .bind(event.id.as_uuid())
        .bind(&event.name)
        .bind(event.starts_at)
        .bind(i64::from(event.remaining_quantity))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "event"))?;
        Ok(())
    }

    async fn get_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "ticket"))?;
        row.as_ref().map(row_to_ticket).transpose()
    }

    async fn insert_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        self.write_ticket(ticket, true).await
    }

    async fn update_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        self.write_ticket(ticket, false).await
    }

    async fn get_token(&mut self, token: &str) -> Result<Option<TokenIndexEntry>> {
        let row = sqlx::query(
            "SELECT token, event_id, ticket_id, created_at FROM token_index WHERE token = $1 FOR UPDATE",
        )
        .bind(token)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "token index entry"))?;
        row.as_ref().map(row_to_token).transpose()
    }

    async fn insert_token(&mut self, entry: &TokenIndexEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_index (token, event_id, ticket_id, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&entry.token)
        .bind(entry.event_id.as_uuid())
        .bind(entry.ticket_id.as_uuid())
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "token index entry"))?;
        Ok(())
    }

    async fn delete_token(&mut self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM token_index WHERE token = $1")
            .bind(token)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_db_error(e, "token index entry"))?;
        Ok(())
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "transfer"))?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<()> {
        self.write_transfer(transfer, true).await
    }

    async fn update_transfer(&mut self, transfer: &Transfer) -> Result<()> {
        self.write_transfer(transfer, false).await
    }

    async fn get_fulfillment(&mut self, key: &FulfillmentKey) -> Result<Option<Fulfillment>> {
        let row = sqlx::query(
            r#"
            SELECT key, status, created_ticket_refs, errors, created_at, updated_at
            FROM fulfillments
            WHERE key = $1
            FOR UPDATE
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "fulfillment"))?;
        row.as_ref().map(row_to_fulfillment).transpose()
    }

    async fn insert_fulfillment(&mut self, fulfillment: &Fulfillment) -> Result<()> {
        self.write_fulfillment(fulfillment, true).await
    }

    async fn update_fulfillment(&mut self, fulfillment: &Fulfillment) -> Result<()> {
        self.write_fulfillment(fulfillment, false).await
    }

    async fn increment_summary(
        &mut self,
        event_id: EventId,
        user_id: &UserId,
        delta: SummaryDelta,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_user_summaries (event_id, user_id, total_tickets, used_count, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id, user_id) DO UPDATE SET
                total_tickets = event_user_summaries.total_tickets + EXCLUDED.total_tickets,
                used_count = event_user_summaries.used_count + EXCLUDED.used_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(user_id.as_str())
        .bind(delta.total_tickets)
        .bind(delta.used_count)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_db_error(e, "event user summary"))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_db_error(e, "commit"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
