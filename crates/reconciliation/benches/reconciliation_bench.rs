use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{EventId, UserId};
use criterion::{Criterion, criterion_group, criterion_main};
use ledger::{IssueRequest, TicketLedger};
use ledger_store::{EventRecord, InMemoryLedgerStore, LedgerStore, Ticket};
use reconciliation::{ReconcileOptions, Reconciler, fold_tickets};

fn bench_fold_1000_tickets(c: &mut Criterion) {
    let event_id = EventId::new();
    let tickets: Vec<Ticket> = (0..1000)
        .map(|i| {
            Ticket::new(
                event_id,
                UserId::new(format!("user-{}", i % 50)),
                2,
                format!("tok-{i}"),
                Utc::now(),
            )
        })
        .collect();

    c.bench_function("reconciliation/fold_1000_tickets", |b| {
        b.iter(|| std::hint::black_box(fold_tickets(std::hint::black_box(&tickets))));
    });
}

fn bench_reconcile_clean_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryLedgerStore::new());
    let event = EventRecord::new("Bench", Utc::now() + Duration::days(1), 10_000);
    rt.block_on(async {
        store.create_event(&event).await.unwrap();
        let ledger = TicketLedger::new(store.clone());
        for i in 0..500 {
            ledger
                .issue(IssueRequest::new(event.id, format!("user-{}", i % 100), 1), None)
                .await
                .unwrap();
        }
    });
    let reconciler = Reconciler::new(store);

    c.bench_function("reconciliation/reconcile_500_tickets", |b| {
        b.iter(|| {
            rt.block_on(async {
                reconciler
                    .reconcile(event.id, ReconcileOptions::default())
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_fold_1000_tickets, bench_reconcile_clean_event);
criterion_main!(benches);
