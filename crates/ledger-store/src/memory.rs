use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{EventId, FulfillmentKey, TicketId, TransferId, UserId};
use tokio::sync::RwLock;

use crate::documents::{
    EventRecord, EventUserSummary, Fulfillment, SummaryDelta, SummaryWrite, Ticket,
    TokenIndexEntry, Transfer,
};
use crate::store::{LedgerStore, Transaction, validate_batch};
use crate::{Result, StoreError};

/// Primary key of a versioned document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DocKey {
    Event(EventId),
    Ticket(TicketId),
    Token(String),
    Transfer(TransferId),
    Fulfillment(FulfillmentKey),
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocKey::Event(id) => write!(f, "event {id}"),
            DocKey::Ticket(id) => write!(f, "ticket {id}"),
            DocKey::Token(_) => write!(f, "token index entry"),
            DocKey::Transfer(id) => write!(f, "transfer {id}"),
            DocKey::Fulfillment(key) => write!(f, "fulfillment {key}"),
        }
    }
}

#[derive(Debug, Clone)]
enum Doc {
    Event(EventRecord),
    Ticket(Ticket),
    Token(TokenIndexEntry),
    Transfer(Transfer),
    Fulfillment(Fulfillment),
}

#[derive(Debug, Clone)]
struct Versioned {
    /// Commit sequence number that last wrote this document.
    version: u64,
    doc: Doc,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Insert(Doc),
    Update(Doc),
    Delete,
}

#[derive(Debug, Default)]
struct MemoryState {
    docs: HashMap<DocKey, Versioned>,
    summaries: HashMap<(EventId, UserId), EventUserSummary>,
    commit_seq: u64,
}

impl MemoryState {
    fn version_of(&self, key: &DocKey) -> u64 {
        self.docs.get(key).map(|v| v.version).unwrap_or(0)
    }

    fn apply_increment(&mut self, event_id: EventId, user_id: UserId, delta: SummaryDelta) {
        let now = Utc::now();
        let entry = self
            .summaries
            .entry((event_id, user_id.clone()))
            .or_insert_with(|| EventUserSummary::empty(event_id, user_id, now));
        entry.total_tickets += delta.total_tickets;
        entry.used_count += delta.used_count;
        entry.updated_at = now;
    }
}

/// In-memory ledger store with optimistic concurrency control.
///
/// Each transaction records the version of every document it reads and
/// buffers its writes. Commit validates the read set under the write lock
/// and fails with [`StoreError::Conflict`] if anything changed, which gives
/// the same serializable behavior as the PostgreSQL store.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryLedgerStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live token index entries.
    pub async fn token_count(&self) -> usize {
        self.state
            .read()
            .await
            .docs
            .keys()
            .filter(|k| matches!(k, DocKey::Token(_)))
            .count()
    }

    async fn read_doc(&self, key: &DocKey) -> Option<Doc> {
        self.state.read().await.docs.get(key).map(|v| v.doc.clone())
    }

    async fn collect_tickets<F>(&self, filter: F) -> Vec<Ticket>
    where
        F: Fn(&Ticket) -> bool,
    {
        let state = self.state.read().await;
        let mut tickets: Vec<Ticket> = state
            .docs
            .values()
            .filter_map(|v| match &v.doc {
                Doc::Ticket(t) if filter(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        tickets.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then(a.id.cmp(&b.id)));
        tickets
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(InMemoryTransaction {
            state: self.state.clone(),
            reads: HashMap::new(),
            writes: HashMap::new(),
            increments: Vec::new(),
        }))
    }

    async fn create_event(&self, event: &EventRecord) -> Result<()> {
        let key = DocKey::Event(event.id);
        let mut state = self.state.write().await;
        if state.docs.contains_key(&key) {
            return Err(StoreError::Conflict(key.to_string()));
        }
        state.commit_seq += 1;
        let version = state.commit_seq;
        state.docs.insert(
            key,
            Versioned {
                version,
                doc: Doc::Event(event.clone()),
            },
        );
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<EventRecord>> {
        Ok(match self.read_doc(&DocKey::Event(id)).await {
            Some(Doc::Event(e)) => Some(e),
            _ => None,
        })
    }

    async fn list_event_ids(&self) -> Result<Vec<EventId>> {
        let state = self.state.read().await;
        Ok(state
            .docs
            .keys()
            .filter_map(|k| match k {
                DocKey::Event(id) => Some(*id),
                _ => None,
            })
            .collect())
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>> {
        Ok(match self.read_doc(&DocKey::Ticket(id)).await {
            Some(Doc::Ticket(t)) => Some(t),
            _ => None,
        })
    }

    async fn lookup_token(&self, token: &str) -> Result<Option<TokenIndexEntry>> {
        Ok(match self.read_doc(&DocKey::Token(token.to_string())).await {
            Some(Doc::Token(entry)) => Some(entry),
            _ => None,
        })
    }

    async fn tickets_for_event(&self, event_id: EventId) -> Result<Vec<Ticket>> {
        Ok(self.collect_tickets(|t| t.event_id == event_id).await)
    }

    async fn tickets_for_owner(&self, event_id: EventId, owner_id: &UserId) -> Result<Vec<Ticket>> {
        Ok(self
            .collect_tickets(|t| t.event_id == event_id && &t.owner_id == owner_id)
            .await)
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>> {
        Ok(match self.read_doc(&DocKey::Transfer(id)).await {
            Some(Doc::Transfer(t)) => Some(t),
            _ => None,
        })
    }

    async fn find_transfer_by_claim_hash(&self, hash: &str) -> Result<Option<Transfer>> {
        let state = self.state.read().await;
        Ok(state.docs.values().find_map(|v| match &v.doc {
            Doc::Transfer(t) if t.claim_token_hash == hash => Some(t.clone()),
            _ => None,
        }))
    }

    async fn get_fulfillment(&self, key: &FulfillmentKey) -> Result<Option<Fulfillment>> {
        Ok(match self.read_doc(&DocKey::Fulfillment(key.clone())).await {
            Some(Doc::Fulfillment(f)) => Some(f),
            _ => None,
        })
    }

    async fn get_summary(
        &self,
        event_id: EventId,
        user_id: &UserId,
    ) -> Result<Option<EventUserSummary>> {
        let state = self.state.read().await;
        Ok(state.summaries.get(&(event_id, user_id.clone())).cloned())
    }

    async fn summaries_for_event(&self, event_id: EventId) -> Result<Vec<EventUserSummary>> {
        let state = self.state.read().await;
        let mut summaries: Vec<_> = state
            .summaries
            .values()
            .filter(|s| s.event_id == event_id)
            .cloned()
            .collect();
        summaries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(summaries)
    }

    async fn write_summaries(&self, writes: &[SummaryWrite]) -> Result<usize> {
        validate_batch(writes.len())?;
        let mut state = self.state.write().await;
        let mut written = 0;
        for write in writes {
            let key = (write.summary.event_id, write.summary.user_id.clone());
            if write.matches(state.summaries.get(&key)) {
                state.summaries.insert(key, write.summary.clone());
                written += 1;
            }
        }
        Ok(written)
    }
}

/// Transaction over [`InMemoryLedgerStore`].
struct InMemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    /// Version observed for each document read; 0 means absent.
    reads: HashMap<DocKey, u64>,
    writes: HashMap<DocKey, PendingWrite>,
    increments: Vec<(EventId, UserId, SummaryDelta)>,
}

impl InMemoryTransaction {
    async fn get(&mut self, key: DocKey) -> Option<Doc> {
        if let Some(pending) = self.writes.get(&key) {
            return match pending {
                PendingWrite::Insert(doc) | PendingWrite::Update(doc) => Some(doc.clone()),
                PendingWrite::Delete => None,
            };
        }

        let state = self.state.read().await;
        let current = state.docs.get(&key);
        let version = current.map(|v| v.version).unwrap_or(0);
        let doc = current.map(|v| v.doc.clone());
        drop(state);

        self.reads.entry(key).or_insert(version);
        doc
    }

    fn insert(&mut self, key: DocKey, doc: Doc) -> Result<()> {
        match self.writes.get(&key) {
            Some(PendingWrite::Insert(_)) | Some(PendingWrite::Update(_)) => {
                Err(StoreError::Conflict(key.to_string()))
            }
            _ => {
                self.writes.insert(key, PendingWrite::Insert(doc));
                Ok(())
            }
        }
    }

    fn update(&mut self, key: DocKey, doc: Doc) {
        let write = match self.writes.get(&key) {
            Some(PendingWrite::Insert(_)) => PendingWrite::Insert(doc),
            _ => PendingWrite::Update(doc),
        };
        self.writes.insert(key, write);
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn get_event(&mut self, id: EventId) -> Result<Option<EventRecord>> {
        Ok(match self.get(DocKey::Event(id)).await {
            Some(Doc::Event(e)) => Some(e),
            _ => None,
        })
    }

    async fn update_event(&mut self, event: &EventRecord) -> Result<()> {
        self.update(DocKey::Event(event.id), Doc::Event(event.clone()));
        Ok(())
    }

    async fn get_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>> {
        Ok(match self.get(DocKey::Ticket(id)).await {
            Some(Doc::Ticket(t)) => Some(t),
            _ => None,
        })
    }

    async fn insert_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        self.insert(DocKey::Ticket(ticket.id), Doc::Ticket(ticket.clone()))
    }

    async fn update_ticket(&mut self, ticket: &Ticket) -> Result<()> {
        self.update(DocKey::Ticket(ticket.id), Doc::Ticket(ticket.clone()));
        Ok(())
    }

    async fn get_token(&mut self, token: &str) -> Result<Option<TokenIndexEntry>> {
        Ok(match self.get(DocKey::Token(token.to_string())).await {
            Some(Doc::Token(entry)) => Some(entry),
            _ => None,
        })
    }

    async fn insert_token(&mut self, entry: &TokenIndexEntry) -> Result<()> {
        self.insert(DocKey::Token(entry.token.clone()), Doc::Token(entry.clone()))
    }

    async fn delete_token(&mut self, token: &str) -> Result<()> {
        self.writes
            .insert(DocKey::Token(token.to_string()), PendingWrite::Delete);
        Ok(())
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>> {
        Ok(match self.get(DocKey::Transfer(id)).await {
            Some(Doc::Transfer(t)) => Some(t),
            _ => None,
        })
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<()> {
        self.insert(
            DocKey::Transfer(transfer.id),
            Doc::Transfer(transfer.clone()),
        )
    }

    async fn update_transfer(&mut self, transfer: &Transfer) -> Result<()> {
        self.update(
            DocKey::Transfer(transfer.id),
            Doc::Transfer(transfer.clone()),
        );
        Ok(())
    }

    async fn get_fulfillment(&mut self, key: &FulfillmentKey) -> Result<Option<Fulfillment>> {
        Ok(match self.get(DocKey::Fulfillment(key.clone())).await {
            Some(Doc::Fulfillment(f)) => Some(f),
            _ => None,
        })
    }

    async fn insert_fulfillment(&mut self, fulfillment: &Fulfillment) -> Result<()> {
        self.insert(
            DocKey::Fulfillment(fulfillment.key.clone()),
            Doc::Fulfillment(fulfillment.clone()),
        )
    }

    async fn update_fulfillment(&mut self, fulfillment: &Fulfillment) -> Result<()> {
        self.update(
            DocKey::Fulfillment(fulfillment.key.clone()),
            Doc::Fulfillment(fulfillment.clone()),
        );
        Ok(())
    }

    async fn increment_summary(
        &mut self,
        event_id: EventId,
        user_id: &UserId,
        delta: SummaryDelta,
    ) -> Result<()> {
        self.increments.push((event_id, user_id.clone(), delta));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.state.write().await;

        for (key, observed) in &this.reads {
            if state.version_of(key) != *observed {
                tracing::debug!(document = %key, "read set changed before commit");
                return Err(StoreError::Conflict(key.to_string()));
            }
        }

        for (key, write) in &this.writes {
            let exists = state.docs.contains_key(key);
            match write {
                PendingWrite::Insert(_) if exists => {
                    return Err(StoreError::Conflict(key.to_string()));
                }
                PendingWrite::Update(_) if !exists => {
                    return Err(StoreError::Conflict(key.to_string()));
                }
                _ => {}
            }
        }

        state.commit_seq += 1;
        let version = state.commit_seq;

        for (key, write) in this.writes {
            match write {
                PendingWrite::Insert(doc) | PendingWrite::Update(doc) => {
                    state.docs.insert(key, Versioned { version, doc });
                }
                PendingWrite::Delete => {
                    state.docs.remove(&key);
                }
            }
        }

        for (event_id, user_id, delta) in this.increments {
            state.apply_increment(event_id, user_id, delta);
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
