//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::AppState;
use api::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use common::{EventId, TicketId};
use ledger_store::{EventRecord, InMemoryLedgerStore, LedgerStore};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

type State = Arc<AppState<InMemoryLedgerStore>>;

fn setup_with_config(config: Config) -> (axum::Router, State) {
    let store = Arc::new(InMemoryLedgerStore::new());
    let state = api::create_default_state(store, &config);
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn setup() -> (axum::Router, State) {
    setup_with_config(Config::default())
}

async fn create_event(state: &State, remaining: u32) -> EventId {
    let event = EventRecord::new("Rooftop Session", Utc::now() + Duration::days(10), remaining);
    state.store.create_event(&event).await.unwrap();
    event.id
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, json)
}

/// Settles one item and returns the issued ticket id and its scan token.
async fn issue(
    app: &axum::Router,
    state: &State,
    key: &str,
    event_id: EventId,
    owner: &str,
    quantity: u32,
) -> (TicketId, String) {
    let (status, _, body) = send(
        app,
        "POST",
        "/fulfillments",
        &[],
        Some(json!({
            "key": key,
            "items": [{ "event_id": event_id, "owner_id": owner, "quantity": quantity }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let ticket_id: TicketId =
        serde_json::from_value(body["fulfillment"]["created_ticket_refs"][0]["ticket_id"].clone())
            .unwrap();
    let ticket = state.ledger.ticket(ticket_id).await.unwrap().unwrap();
    (ticket_id, ticket.token.unwrap())
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();
    let (status, _, body) = send(&app, "GET", "/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
}

mod fulfillments {
    use super::*;

    #[tokio::test]
    async fn test_settle_then_replay() {
        let (app, state) = setup();
        let event_id = create_event(&state, 100).await;
        let request = json!({
            "key": "pi_1",
            "items": [{ "event_id": event_id, "owner_id": "A", "quantity": 2 }]
        });

        let (status, _, first) =
            send(&app, "POST", "/fulfillments", &[], Some(request.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["replayed"], false);
        assert_eq!(first["fulfillment"]["status"], "completed");

        let (status, _, second) = send(&app, "POST", "/fulfillments", &[], Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["replayed"], true);
        assert_eq!(second["fulfillment"], first["fulfillment"]);

        let event = state.store.get_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.remaining_quantity, 98);

        let (status, _, stored) = send(&app, "GET", "/fulfillments/pi_1", &[], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored, first["fulfillment"]);
    }

    #[tokio::test]
    async fn test_timed_out_settle_still_completes() {
        let (app, state) = setup_with_config(Config {
            request_timeout: std::time::Duration::from_millis(1),
            ..Config::default()
        });
        let event_id = create_event(&state, 500).await;
        let items: Vec<Value> = (0..200)
            .map(|i| json!({ "event_id": event_id, "owner_id": format!("fan-{i}"), "quantity": 1 }))
            .collect();

        let (status, _, _) = send(
            &app,
            "POST",
            "/fulfillments",
            &[],
            Some(json!({ "key": "pi_slow", "items": items })),
        )
        .await;
        assert!(status == StatusCode::CREATED || status.is_server_error());

        let mut stored = Value::Null;
        for _ in 0..1000 {
            let (status, _, body) = send(&app, "GET", "/fulfillments/pi_slow", &[], None).await;
            if status == StatusCode::OK && body["status"] != "processing" {
                stored = body;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(stored["status"], "completed");
        assert_eq!(stored["created_ticket_refs"].as_array().unwrap().len(), 200);

        let event = state.store.get_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.remaining_quantity, 300);
    }

    #[tokio::test]
    async fn test_unknown_fulfillment_is_404() {
        let (app, _) = setup();
        let (status, _, body) = send(&app, "GET", "/fulfillments/pi_missing", &[], None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_blank_key_is_400() {
        let (app, _) = setup();
        let (status, _, body) = send(
            &app,
            "POST",
            "/fulfillments",
            &[],
            Some(json!({ "key": " ", "items": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_input");
    }
}

mod scans {
    use super::*;

    #[tokio::test]
    async fn test_token_scan_then_already_used() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        let (ticket_id, token) = issue(&app, &state, "pi_scan", event_id, "A", 1).await;

        let (status, _, body) = send(
            &app,
            "POST",
            "/scan/token",
            &[],
            Some(json!({ "token": token, "expected_event_id": event_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ticket_id"], json!(ticket_id));
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["active"], false);

        let (status, _, body) =
            send(&app, "POST", "/scan/token", &[], Some(json!({ "token": token }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "already_used");
    }

    #[tokio::test]
    async fn test_token_for_other_event_is_rejected() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        let other = create_event(&state, 10).await;
        let (_, token) = issue(&app, &state, "pi_wrong", event_id, "A", 1).await;

        let (status, _, body) = send(
            &app,
            "POST",
            "/scan/token",
            &[],
            Some(json!({ "token": token, "expected_event_id": other })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "wrong_event");
    }

    #[tokio::test]
    async fn test_unknown_token_is_404() {
        let (app, _) = setup();
        let (status, _, body) = send(
            &app,
            "POST",
            "/scan/token",
            &[],
            Some(json!({ "token": "not-a-token" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_owner_scan_until_exhausted() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        issue(&app, &state, "pi_owner", event_id, "A", 1).await;
        let request = json!({ "event_id": event_id, "owner_id": "A" });

        let (status, _, body) =
            send(&app, "POST", "/scan/owner", &[], Some(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 0);

        let (status, _, body) = send(&app, "POST", "/scan/owner", &[], Some(request)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "exhausted");
    }
}

mod transfers {
    use super::*;

    #[tokio::test]
    async fn test_transfer_to_recipient_by_email() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        let (ticket_id, old_token) = issue(&app, &state, "pi_gift", event_id, "a", 1).await;

        let (status, _, created) = send(
            &app,
            "POST",
            "/transfers",
            &[("x-user-id", "a")],
            Some(json!({ "ticket_id": ticket_id, "to_email": "B@x.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["transfer"]["recipient"]["email"], "b@x.com");
        let transfer_id = created["transfer"]["id"].as_str().unwrap().to_string();
        let claim_token = created["raw_claim_token"].as_str().unwrap().to_string();

        let (status, _, ticket) = send(
            &app,
            "POST",
            "/transfers/claim",
            &[("x-user-id", "b"), ("x-user-email", "b@x.com")],
            Some(json!({ "claim_token": claim_token })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ticket["owner_id"], "b");
        assert_eq!(ticket["previous_owner_id"], "a");

        let (status, _, _) =
            send(&app, "POST", "/scan/token", &[], Some(json!({ "token": old_token }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, body) = send(
            &app,
            "POST",
            "/scan/token",
            &[],
            Some(json!({ "token": ticket["token"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 0);

        let (status, _, view) =
            send(&app, "GET", &format!("/transfers/{transfer_id}"), &[], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["effective_status"], "claimed");
    }

    #[tokio::test]
    async fn test_create_requires_identity() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        let (ticket_id, _) = issue(&app, &state, "pi_anon", event_id, "a", 1).await;

        let (status, _, body) = send(
            &app,
            "POST",
            "/transfers",
            &[],
            Some(json!({ "ticket_id": ticket_id, "to_email": "b@x.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "unauthorized");
    }

    #[tokio::test]
    async fn test_wrong_recipient_is_forbidden() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        let (ticket_id, _) = issue(&app, &state, "pi_wrong_claim", event_id, "a", 1).await;

        let (_, _, created) = send(
            &app,
            "POST",
            "/transfers",
            &[("x-user-id", "a")],
            Some(json!({ "ticket_id": ticket_id, "to_email": "b@x.com" })),
        )
        .await;

        let (status, _, body) = send(
            &app,
            "POST",
            "/transfers/claim",
            &[("x-user-id", "c"), ("x-user-email", "c@x.com")],
            Some(json!({ "claim_token": created["raw_claim_token"] })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "forbidden");
    }

    #[tokio::test]
    async fn test_cancel_by_owner_and_admin_only() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        let (ticket_id, _) = issue(&app, &state, "pi_cancel", event_id, "a", 1).await;

        let (_, _, created) = send(
            &app,
            "POST",
            "/transfers",
            &[("x-user-id", "a")],
            Some(json!({ "ticket_id": ticket_id, "to_email": "b@x.com" })),
        )
        .await;
        let uri = format!(
            "/transfers/{}/cancel",
            created["transfer"]["id"].as_str().unwrap()
        );

        let (status, _, _) = send(&app, "POST", &uri, &[("x-user-id", "mallory")], None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, body) = send(&app, "POST", &uri, &[("x-admin", "true")], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["cancelled_by"], "admin");
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let (app, state) = setup_with_config(Config {
            transfer_rate_limit_max: 1,
            ..Config::default()
        });
        let event_id = create_event(&state, 10).await;
        let (first, _) = issue(&app, &state, "pi_rl_1", event_id, "a", 1).await;
        let (second, _) = issue(&app, &state, "pi_rl_2", event_id, "a", 1).await;

        let (status, _, _) = send(
            &app,
            "POST",
            "/transfers",
            &[("x-user-id", "a")],
            Some(json!({ "ticket_id": first, "to_email": "b@x.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, headers, body) = send(
            &app,
            "POST",
            "/transfers",
            &[("x-user-id", "a")],
            Some(json!({ "ticket_id": second, "to_email": "b@x.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["kind"], "rate_limited");
        assert!(headers.contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_unknown_transfer_is_404() {
        let (app, _) = setup();
        let uri = format!("/transfers/{}", common::TransferId::new());
        let (status, _, _) = send(&app, "GET", &uri, &[], None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

mod admin {
    use ledger_store::{EventUserSummary, SummaryWrite};

    use super::*;

    #[tokio::test]
    async fn test_reconcile_requires_admin() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        let uri = format!("/admin/reconcile/{event_id}");

        let (status, _, _) = send(&app, "POST", &uri, &[("x-user-id", "a")], None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_reconcile_dry_run_then_repair() {
        let (app, state) = setup();
        let event_id = create_event(&state, 10).await;
        issue(&app, &state, "pi_recon", event_id, "a", 2).await;

        let expected = state.store.get_summary(event_id, &"a".into()).await.unwrap();
        let mut drifted = EventUserSummary::empty(event_id, "a".into(), Utc::now());
        drifted.total_tickets = 7;
        let write = SummaryWrite {
            summary: drifted,
            expected,
        };
        assert_eq!(state.store.write_summaries(&[write]).await.unwrap(), 1);

        let admin = [("x-admin", "true")];
        let (status, _, report) = send(
            &app,
            "POST",
            &format!("/admin/reconcile/{event_id}?dry_run=true"),
            &admin,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["dry_run"], true);
        assert_eq!(report["updated"], 0);
        assert_eq!(report["changes"].as_array().unwrap().len(), 1);

        let (status, _, report) = send(
            &app,
            "POST",
            &format!("/admin/reconcile/{event_id}"),
            &admin,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["updated"], 1);
        assert_eq!(report["skipped"], 0);

        let summary = state
            .store
            .get_summary(event_id, &"a".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total_tickets, 2);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_event_is_404() {
        let (app, _) = setup();
        let uri = format!("/admin/reconcile/{}", EventId::new());
        let (status, _, body) = send(&app, "POST", &uri, &[("x-admin", "true")], None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }
}
