//! Integration tests for the board, Lock, and dispatch HTTP APIs.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory database and drives it over real HTTP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use agent_board::app::{AppState, build_router};
use agent_board::config::BoardConfig;
use agent_board::dispatch::CommandExecutor;
use agent_board::error::ReconcileError;
use agent_board::reconcile::{HttpBoardApi, OptimisticBoard};
use agent_board::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Start an Axum server on a random port, return its base URL.
async fn start_server() -> String {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let state = AppState::new(db, &BoardConfig::default(), Arc::new(CommandExecutor::new("true")));
    let app = build_router(&state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

async fn post(base: &str, path: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{base}{path}"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn get(base: &str, path: &str) -> (u16, Value) {
    let resp = reqwest::get(format!("{base}{path}")).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

fn column_id(board: &Value, name: &str) -> String {
    board["columns"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == name)
        .unwrap_or_else(|| panic!("no column {name}"))["id"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn create_board(base: &str, body: Value) -> Value {
    let (status, board) = post(base, "/api/boards", body).await;
    assert_eq!(status, 201);
    board
}

async fn create_ticket(base: &str, board: &Value, title: &str, column: &str) -> String {
    let path = format!("/api/boards/{}/tickets", board["board"]["id"].as_str().unwrap());
    let (status, ticket) = post(
        base,
        &path,
        json!({ "title": title, "column_id": column_id(board, column) }),
    )
    .await;
    assert_eq!(status, 201);
    ticket["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn move_api_validates_then_commits() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let board = create_board(&base, json!({ "name": "Main" })).await;
        assert_eq!(board["columns"].as_array().unwrap().len(), 6);

        // No column given: lands in Backlog.
        let path = format!("/api/boards/{}/tickets", board["board"]["id"].as_str().unwrap());
        let (_, ticket) = post(&base, &path, json!({ "title": "Write docs", "priority": "high" })).await;
        assert_eq!(ticket["column_id"], column_id(&board, "Backlog"));
        let ticket_id = ticket["id"].as_str().unwrap();

        let move_path = format!("/api/tickets/{ticket_id}/move");
        let (status, verdict) =
            post(&base, &move_path, json!({ "column_id": column_id(&board, "Done") })).await;
        assert_eq!(status, 200);
        assert_eq!(verdict["valid"], false);
        assert_eq!(verdict["reason"], "cannot move from Backlog to Done");

        let (_, verdict) =
            post(&base, &move_path, json!({ "column_id": column_id(&board, "Ready") })).await;
        assert_eq!(verdict["valid"], true);

        let (_, state) = get(&base, &format!("/api/boards/{}", board["board"]["id"].as_str().unwrap())).await;
        assert_eq!(state["tickets"][0]["column_id"], column_id(&board, "Ready"));

        let (_, events) = get(&base, &format!("/api/events?ticket_id={ticket_id}")).await;
        let types: Vec<_> = events
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["ticket_moved", "ticket_created"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn lock_api_full_lifecycle() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let board = create_board(&base, json!({ "name": "Locks" })).await;
        let ticket_id = create_ticket(&base, &board, "Fix bug", "Ready").await;

        let (status, claim) = post(&base, "/api/lock/acquire", json!({ "ticket_id": ticket_id })).await;
        assert_eq!(status, 200);
        assert_eq!(claim["ticket"]["column_id"], column_id(&board, "In Progress"));
        let run_id = claim["run_id"].as_str().unwrap().to_string();

        let (status, _) = post(&base, "/api/lock/acquire", json!({ "ticket_id": ticket_id })).await;
        assert_eq!(status, 409);

        let (status, beat) = post(&base, "/api/lock/heartbeat", json!({ "run_id": run_id })).await;
        assert_eq!(status, 200);
        assert!(beat["lease_expires_at"].is_string());

        let stranger = uuid::Uuid::new_v4();
        let (status, _) = post(&base, "/api/lock/heartbeat", json!({ "run_id": stranger })).await;
        assert_eq!(status, 409);

        let (status, err) = post(
            &base,
            "/api/lock/release",
            json!({ "run_id": run_id, "status": "running" }),
        )
        .await;
        assert_eq!(status, 400);
        assert!(err["error"].as_str().unwrap().contains("not terminal"));

        let other = create_ticket(&base, &board, "Second", "Ready").await;
        let (status, _) = post(
            &base,
            "/api/lock/acquire",
            json!({ "ticket_id": other, "run_id": run_id }),
        )
        .await;
        assert_eq!(status, 409);

        let (status, report) = post(
            &base,
            "/api/lock/release",
            json!({ "run_id": run_id, "status": "finished", "exit_code": 0, "summary": "ok" }),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(report["outcome"], "success");
        assert_eq!(report["column_id"], column_id(&board, "Review"));

        let (status, again) = post(
            &base,
            "/api/lock/release",
            json!({ "run_id": run_id, "status": "error" }),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(again["already_finalized"], true);

        let (status, sweep) = post(&base, "/api/lock/sweep", json!({})).await;
        assert_eq!(status, 200);
        assert!(sweep["reclaimed"].as_array().unwrap().is_empty());

        let (status, _) = post(&base, "/api/lock/acquire", json!({ "ticket_id": uuid::Uuid::new_v4() })).await;
        assert_eq!(status, 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_dispatch_has_one_winner() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let board = create_board(&base, json!({ "name": "Race" })).await;
        create_ticket(&base, &board, "Only one", "Ready").await;

        let polls = (0..6).map(|_| {
            let base = base.clone();
            tokio::spawn(async move {
                post(&base, "/api/dispatch/next", json!({ "agent_variant": "variant_a" })).await
            })
        });
        let mut winners = 0;
        for poll in polls.collect::<Vec<_>>() {
            let (status, claim) = poll.await.unwrap();
            assert_eq!(status, 200);
            if !claim.is_null() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let (_, status) = get(&base, "/api/queue/status").await;
        assert_eq!(status["ready_count"], 0);
        assert_eq!(status["in_progress_count"], 1);
        assert_eq!(status["worker_count"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn wip_limit_caps_dispatch() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let board = create_board(
            &base,
            json!({
                "name": "Limited",
                "columns": [
                    { "name": "Backlog" },
                    { "name": "Ready" },
                    { "name": "In Progress", "wip_limit": 1 },
                    { "name": "Blocked" },
                    { "name": "Review" },
                    { "name": "Done" }
                ]
            }),
        )
        .await;
        create_ticket(&base, &board, "first", "Ready").await;
        create_ticket(&base, &board, "second", "Ready").await;

        let next = json!({ "agent_variant": "variant_b" });
        let (_, first) = post(&base, "/api/dispatch/next", next.clone()).await;
        assert!(!first.is_null());
        let (_, second) = post(&base, "/api/dispatch/next", next).await;
        assert!(second.is_null());

        let (_, status) = get(&base, "/api/workers/queue").await;
        assert_eq!(status["ready_count"], 1);
        assert_eq!(status["in_progress_count"], 1);
        assert_eq!(status["idle_workers"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reconciler_reverts_rejected_move_over_http() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let board = create_board(&base, json!({ "name": "UI" })).await;
        let ticket_id = create_ticket(&base, &board, "Drag me", "Backlog").await;
        let board_id = board["board"]["id"].as_str().unwrap().parse().unwrap();
        let ticket_id: uuid::Uuid = ticket_id.parse().unwrap();
        let done = column_id(&board, "Done").parse().unwrap();
        let ready = column_id(&board, "Ready").parse().unwrap();

        let view = OptimisticBoard::load(Arc::new(HttpBoardApi::new(&base)), board_id)
            .await
            .unwrap();

        let err = view.move_ticket(ticket_id, done).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Rejected { .. }));
        assert_eq!(
            view.snapshot().ticket(ticket_id).unwrap().column_id.to_string(),
            column_id(&board, "Backlog")
        );

        view.move_ticket(ticket_id, ready).await.unwrap();
        view.reload().await.unwrap();
        assert_eq!(view.snapshot().ticket(ticket_id).unwrap().column_id, ready);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn workers_can_be_started_and_stopped() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server().await;
        let (status, worker) = post(
            &base,
            "/api/workers",
            json!({ "agent_variant": "variant_a", "project_id": "web" }),
        )
        .await;
        assert_eq!(status, 201);
        assert_eq!(worker["state"], "idle");

        let (_, workers) = get(&base, "/api/workers").await;
        assert_eq!(workers.as_array().unwrap().len(), 1);

        let id = worker["id"].as_str().unwrap();
        let resp = reqwest::Client::new()
            .delete(format!("{base}/api/workers/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let stopped: Value = resp.json().await.unwrap();
        assert_eq!(stopped["state"], "stopped");

        let resp = reqwest::Client::new()
            .delete(format!("{base}/api/workers/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    })
    .await
    .expect("test timed out");
}
