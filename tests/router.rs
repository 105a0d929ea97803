// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use qhp_bridge::config::BridgeConfig;
use qhp_bridge::message::{Context, Kind, Message};
use qhp_bridge::peer::PeerConnection;
use qhp_bridge::router::Router;
use qhp_bridge::session::Session;
use qhp_bridge::translator::ExternalRequest;
use qhp_bridge::trust::TrustTable;
use qhp_bridge::validator::Validator;
use serde_json::json;
use tokio::sync::mpsc;

async fn router_with_disconnected_peer(config: BridgeConfig) -> (Router, Arc<PeerConnection>) {
    let dir = tempfile::tempdir().unwrap();
    let validator = Arc::new(Validator::with_random_key());
    let trust = Arc::new(TrustTable::new(Duration::from_secs(config.queue_max_age_seconds)));
    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let (fatal_tx, _fatal_rx) = mpsc::channel(4);

    let peer_i = Arc::new(
        PeerConnection::new(
            "I",
            config.internal_peer_endpoint.clone(),
            &config,
            dir.path().to_path_buf(),
            trust,
            Arc::clone(&validator),
            inbound_tx,
            fatal_tx,
        )
        .await
        .unwrap(),
    );
    // Leaking the tempdir keeps the queue file alive for the test's duration;
    // tests are short-lived processes so this is not a real leak.
    std::mem::forget(dir);

    let router = Router::new(config, validator, Arc::clone(&peer_i));
    (router, peer_i)
}

fn request(id: &str) -> ExternalRequest {
    let mut uc = BTreeMap::new();
    uc.insert("operation".to_string(), json!("lookup"));
    ExternalRequest { name: "lookup".to_string(), parameters: json!({}), id: id.to_string(), user_context: uc }
}

fn test_session() -> (Arc<Session>, mpsc::Receiver<qhp_bridge::message::Frame>) {
    let (tx, rx) = mpsc::channel(16);
    (Arc::new(Session::new("sess-1", tx)), rx)
}

/// S3. Disconnect-then-flush: while the I-peer is disconnected, three
/// requests are queued in order and each gets an immediate `queued` ack.
#[tokio::test]
async fn requests_are_queued_in_order_while_peer_is_disconnected() {
    let (router, peer_i) = router_with_disconnected_peer(BridgeConfig::default()).await;
    let (session, mut rx) = test_session();
    router.register_session(Arc::clone(&session));

    for id in ["R1", "R2", "R3"] {
        router.handle_request(&session, request(id)).await.unwrap();
    }

    assert_eq!(peer_i.queue_depth().await, 3);

    for expected_id in ["R1", "R2", "R3"] {
        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.kind, Kind::Response);
        assert_eq!(ack.correlation_id.as_deref(), Some(expected_id));
    }
}

/// S4. Request/response correlation: a reply carrying the originating
/// correlationId is delivered exactly once; a second reply with the same id
/// is dropped (its pendingRequests entry has already been removed).
#[tokio::test]
async fn correlated_response_is_delivered_once_and_a_duplicate_is_dropped() {
    let (router, _peer_i) = router_with_disconnected_peer(BridgeConfig::default()).await;
    let (session, mut rx) = test_session();
    router.register_session(Arc::clone(&session));

    router.handle_request(&session, request("req-42")).await.unwrap();
    let _ack = rx.recv().await.unwrap();
    assert_eq!(router.pending_count(), 1);

    let reply = Message::new("reply-1", Kind::Response, json!({"ok": true}), Context::system("reply"))
        .with_correlation_id("req-42");
    router.handle_peer_i_message(reply.clone()).await;

    let delivered = rx.recv().await.unwrap();
    assert_eq!(delivered.kind, Kind::Response);
    assert_eq!(delivered.correlation_id.as_deref(), Some("req-42"));
    assert_eq!(router.pending_count(), 0);

    // A second reply with the same correlation id has nothing left to match.
    router.handle_peer_i_message(reply).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

/// S5. Request timeout: a request that never gets a correlated response is
/// swept once its deadline passes, and the Session is sent a `timeout` error.
#[tokio::test]
async fn unanswered_request_is_swept_and_reported_as_timeout() {
    let mut config = BridgeConfig::default();
    config.request_timeout_seconds = 0;
    let (router, _peer_i) = router_with_disconnected_peer(config).await;
    let (session, mut rx) = test_session();
    router.register_session(Arc::clone(&session));

    router.handle_request(&session, request("req-99")).await.unwrap();
    let _ack = rx.recv().await.unwrap();

    router.sweep_deadlines().await;

    let error_frame = rx.recv().await.unwrap();
    assert_eq!(error_frame.kind, Kind::Error);
    let payload = error_frame.content.unwrap();
    assert_eq!(payload["errorType"], json!("timeout"));
    assert_eq!(router.pending_count(), 0);
}

/// S6. Rate-limit denial: once a category's bucket is exhausted, further
/// requests in that category are rejected with `rate_limit_exceeded`.
#[tokio::test]
async fn sixth_heavy_request_is_rejected_once_bucket_is_exhausted() {
    let mut config = BridgeConfig::default();
    config.rate_limits.insert(
        "heavy".to_string(),
        qhp_bridge::config::RateLimitConfig { capacity: 5, refill_per_minute: 0 },
    );
    config.tool_name_map.insert("heavy".to_string(), "heavy_operation".to_string());
    let (router, _peer_i) = router_with_disconnected_peer(config).await;
    let (session, mut rx) = test_session();
    router.register_session(Arc::clone(&session));

    for i in 0..5 {
        let mut req = request(&format!("h{i}"));
        req.name = "heavy".to_string();
        router.handle_request(&session, req).await.unwrap();
        let _ack = rx.recv().await.unwrap();
    }

    let mut sixth = request("h5");
    sixth.name = "heavy".to_string();
    let result = router.handle_request(&session, sixth).await;
    assert!(result.is_err());

    let error_frame = rx.recv().await.unwrap();
    assert_eq!(error_frame.kind, Kind::Error);
    let payload = error_frame.content.unwrap();
    assert_eq!(payload["errorType"], json!("rate_limit_exceeded"));
}
