//! Scenario: Capacity flag over HTTP, occupancy fan-out on the bus
//!
//! # Invariant under test
//!
//! An over-capacity entry is accepted with `over_capacity: true` in the
//! response body, and every applied transition broadcasts the fresh
//! snapshot on the SSE bus so connected dashboards update without polling.
//!
//! All tests are pure in-process; no DB or network required.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use cw_daemon::{routes, state};
use cw_engine::{Engine, OccupancyStore};
use cw_testkit::MemoryStore;
use http_body_util::BodyExt;
use tower::ServiceExt; // oneshot

async fn test_state(max_capacity: i64) -> Arc<state::AppState> {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::recover(store as Arc<dyn OccupancyStore>, max_capacity)
        .await
        .expect("recover");
    Arc::new(state::AppState::new(
        Arc::new(engine),
        cw_config::Config::default(),
        "test-config-hash".to_string(),
        None,
    ))
}

async fn call(
    router: axum::Router,
    req: Request<axum::body::Body>,
) -> (StatusCode, serde_json::Value) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, serde_json::from_slice(&body).expect("body is not valid JSON"))
}

fn post_entry(track_id: i64) -> Request<axum::body::Body> {
    let body = serde_json::json!({ "track_id": track_id, "kind": "entry", "timestamp": 100.0 });
    Request::builder()
        .method("POST")
        .uri("/v1/events")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn over_capacity_entry_is_accepted_and_flagged() {
    let st = test_state(1).await;

    let (status, json) = call(routes::build_router(Arc::clone(&st)), post_entry(1)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["over_capacity"], false);

    let (status, json) = call(routes::build_router(Arc::clone(&st)), post_entry(2)).await;
    assert_eq!(status, StatusCode::OK, "capacity is advisory, never a gate");
    assert_eq!(json["status"], "applied");
    assert_eq!(json["over_capacity"], true);
    assert_eq!(json["snapshot"]["occupancy"], 2);

    let (_, json) = call(
        routes::build_router(st),
        Request::builder()
            .method("GET")
            .uri("/v1/occupancy")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(json["at_capacity"], true);
}

#[tokio::test]
async fn applied_events_broadcast_the_new_snapshot() {
    let st = test_state(80).await;
    let mut rx = st.bus.subscribe();

    call(routes::build_router(Arc::clone(&st)), post_entry(1)).await;

    let msg = rx.try_recv().expect("one bus message after an applied event");
    match msg {
        state::BusMsg::Occupancy(snap) => {
            assert_eq!(snap.occupancy, 1);
            assert_eq!(snap.entry_count, 1);
        }
        other => panic!("expected occupancy broadcast, got {other:?}"),
    }

    // Duplicates do not broadcast: nothing changed.
    call(routes::build_router(Arc::clone(&st)), post_entry(1)).await;
    assert!(rx.try_recv().is_err(), "duplicate must not broadcast");
}
