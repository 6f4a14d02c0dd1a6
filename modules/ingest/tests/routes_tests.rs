mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use event_bus::EventBus;
use ingest_rs::pipeline::POLICIES_QUEUE;
use ingest_rs::{build_router, AppState};
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = build_router(AppState::default());

    let response = app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = common::body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "ingest-rs");
}

#[tokio::test]
async fn test_ready_follows_consumer_state() {
    let (_, queues) = common::topology(3).await;
    let state = AppState::new(queues);
    let app = build_router(state.clone());

    let response = app.clone().oneshot(get("/api/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.set_ready(true);
    let response = app.oneshot(get("/api/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = common::body_json(response).await;
    assert_eq!(json["queues"][0], "claims-ingest");
    assert_eq!(json["queues"][1], "policies-ingest");
}

#[tokio::test]
async fn test_depth_reports_counts() {
    let (bus, queues) = common::topology(3).await;
    bus.publish(&common::policy_created("E1", "POL-1")).await.unwrap();
    bus.publish(&common::policy_created("E2", "POL-2")).await.unwrap();

    let policies = common::queue(&queues, POLICIES_QUEUE).clone();
    policies.receive(1, Duration::ZERO).await.unwrap();

    let app = build_router(AppState::new(queues));
    let response = app
        .oneshot(get("/api/queues/policies-ingest/depth"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = common::body_json(response).await;
    assert_eq!(json["queue"], "policies-ingest");
    assert_eq!(json["available"], 1);
    assert_eq!(json["in_flight"], 1);
    assert_eq!(json["dead_lettered"], 0);
}

#[tokio::test]
async fn test_unknown_queue_is_not_found() {
    let (_, queues) = common::topology(3).await;
    let app = build_router(AppState::new(queues));

    let response = app
        .oneshot(get("/api/queues/audit-ingest/depth"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dead_letter_listing_and_redrive() {
    let (bus, queues) = common::topology(1).await;
    bus.publish(&common::policy_created("E-dead", "POL-9")).await.unwrap();

    let policies = common::queue(&queues, POLICIES_QUEUE).clone();
    let leased = policies.receive(1, Duration::ZERO).await.unwrap();
    policies
        .release(leased[0].message_id, "permanent: search rejected document")
        .await
        .unwrap();

    let app = build_router(AppState::new(queues));

    let response = app
        .clone()
        .oneshot(get("/api/queues/policies-ingest/dead-letters"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = common::body_json(response).await;
    let letters = json["dead_letters"].as_array().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0]["event_id"], "E-dead");
    assert_eq!(letters[0]["event_type"], "PolicyCreated");
    assert_eq!(letters[0]["receive_count"], 1);
    assert_eq!(letters[0]["reason"], "permanent: search rejected document");
    assert!(letters[0]["body"].as_str().unwrap().contains("POL-9"));

    let uri = format!(
        "/api/queues/policies-ingest/dead-letters/{}/redrive",
        leased[0].message_id
    );
    let response = app.clone().oneshot(post(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(common::body_json(response).await["redriven"], true);

    let depth = policies.depth().await.unwrap();
    assert_eq!(depth.available, 1);
    assert_eq!(depth.dead_lettered, 0);

    // Second redrive of the same message has nothing to move
    let response = app.oneshot(post(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_redrive_unknown_message() {
    let (_, queues) = common::topology(3).await;
    let app = build_router(AppState::new(queues));

    let uri = format!(
        "/api/queues/claims-ingest/dead-letters/{}/redrive",
        Uuid::new_v4()
    );
    let response = app.oneshot(post(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = common::body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("dead-letter"));
}
