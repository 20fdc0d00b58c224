//! Admin API driven through the router against an in-memory switch.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use steer_api::{ApiState, build_router};
use steer_core::SwitchConfigSet;
use steer_forwarding::{ForwardingStateManager, ManagerConfig, MemorySwitch};
use tower::ServiceExt;

const CONFIG: &str = r#"[{
    "name": "t2na_load_balancer",
    "addr": "127.0.0.1:50052",
    "load_balancer_ip": "10.0.0.10",
    "service_port": 12345,
    "master": true,
    "nodes": [
        {"ipv4": "10.0.0.0", "sw_port": 1, "is_lb_node": false},
        {"ipv4": "10.0.0.1", "sw_port": 2, "is_lb_node": true},
        {"ipv4": "10.0.0.2", "sw_port": 3, "is_lb_node": true}
    ]
}]"#;

async fn test_state() -> (ApiState<MemorySwitch>, MemorySwitch) {
    let set = SwitchConfigSet::from_json_str(CONFIG).unwrap();
    let config = ManagerConfig::try_from(&set.master).unwrap();
    let switch = MemorySwitch::new();
    let mut manager = ForwardingStateManager::new(switch.clone(), config);
    manager.initialize().await.unwrap();
    (ApiState::new(manager), switch)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn migrate_node_success() {
    let (state, _switch) = test_state().await;
    let router = build_router(state.clone());

    let req = post("/migrateNode", json!({"old_ipv4": "10.0.0.1", "new_ipv4": "10.0.0.9"}));
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({"status": "success"}));

    let snapshot = state.manager.lock().await.snapshot();
    assert_eq!(snapshot.actions.get(&0), Some(&"10.0.0.9".parse().unwrap()));
}

#[tokio::test]
async fn migrate_node_missing_parameters() {
    let (state, switch) = test_state().await;
    let writes = switch.writes();
    let router = build_router(state);

    let req = post("/migrateNode", json!({"old_ipv4": "10.0.0.1"}));
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await, json!({"error": "Missing parameters"}));

    let req = Request::builder()
        .method("POST")
        .uri("/migrateNode")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(switch.writes(), writes);
}

#[tokio::test]
async fn migrate_non_member_is_server_error() {
    let (state, _switch) = test_state().await;
    let router = build_router(state);

    let req = post("/migrateNode", json!({"old_ipv4": "10.0.0.0", "new_ipv4": "10.0.0.9"}));
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(resp).await, json!({"error": "Node with IP 10.0.0.0 is not LB node"}));
}

#[tokio::test]
async fn update_forward_and_nodes() {
    let (state, _switch) = test_state().await;
    let router = build_router(state);

    let req = post("/updateForward", json!({"ipv4": "10.0.0.2", "sw_port": 7}));
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = Request::builder().uri("/nodes").body(Body::empty()).unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["forwards"]["10.0.0.2"]["sw_port"], json!(7));
    assert_eq!(body["group"]["members"], json!([0, 1]));
}

#[tokio::test]
async fn add_then_remove_node() {
    let (state, _switch) = test_state().await;
    let router = build_router(state);

    let req = post("/addNode", json!({"ipv4": "10.0.0.3", "sw_port": 4, "is_lb_node": true}));
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["node"]["slot"], json!(2));

    let req = post("/removeNode", json!({"ipv4": "10.0.0.3"}));
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = Request::builder().uri("/verify").body(Body::empty()).unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(json_body(resp).await["consistent"], json!(true));
}

#[tokio::test]
async fn cleanup_then_reinitialize() {
    let (state, switch) = test_state().await;
    let router = build_router(state);

    let req = Request::builder().method("POST").uri("/cleanup").body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        json_body(resp).await,
        json!({"status": "success", "message": "Cleanup complete"})
    );
    assert!(switch.rows(steer_forwarding::tables::FORWARD).is_empty());

    let req = Request::builder()
        .method("POST")
        .uri("/reinitialize")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(switch.rows(steer_forwarding::tables::FORWARD).len(), 3);
}
