// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `Router`: applies the translation pipeline, correlates responses, and
//! decides per-message whether to forward, queue, or reject (spec §4.4).
//!
//! `Router` holds weak references to `PeerLink`s and `Session`s; it owns
//! neither (spec §3 "Ownership").

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::message::{Context, ErrorPayload, Frame, Kind, Message};
use crate::peer::PeerConnection;
use crate::ratelimit::RateLimiter;
use crate::session::Session;
use crate::translator::{ContextTranslator, ExternalRequest};
use crate::validator::Validator;

/// One outstanding request awaiting a correlated response (spec §3
/// "pendingRequests").
struct PendingRequest {
    session_id: String,
    original_request_name: String,
    deadline: Instant,
}

/// Maps request-name to the rate-limit category it is billed against.
/// Anything not named here is billed to `default`.
fn category_for(tool_name: &str, config: &BridgeConfig) -> String {
    if config.rate_limits.contains_key(tool_name) {
        tool_name.to_string()
    } else {
        "default".to_string()
    }
}

/// The core switch: translate, validate, admit, correlate.
pub struct Router {
    config: BridgeConfig,
    translator: ContextTranslator,
    validator: Arc<Validator>,
    rate_limiter: RateLimiter,
    peer_i: Arc<PeerConnection>,
    sessions: DashMap<String, Arc<Session>>,
    monitoring: DashMap<String, Arc<Session>>,
    pending: DashMap<String, PendingRequest>,
    request_timeout: Duration,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("sessions", &self.sessions.len())
            .field("monitoring", &self.monitoring.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Router {
    pub fn new(config: BridgeConfig, validator: Arc<Validator>, peer_i: Arc<PeerConnection>) -> Self {
        let translator = ContextTranslator::new(&config);
        let rate_limiter = RateLimiter::new(&config);
        let request_timeout = Duration::from_secs(config.request_timeout_seconds);

        Self {
            config,
            translator,
            validator,
            rate_limiter,
            peer_i,
            sessions: DashMap::new(),
            monitoring: DashMap::new(),
            pending: DashMap::new(),
            request_timeout,
        }
    }

    pub fn register_session(&self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn deregister_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        self.monitoring.remove(session_id);
    }

    pub fn register_monitoring(&self, session: Arc<Session>) {
        self.monitoring.insert(session.id.clone(), session);
    }

    /// Request path (E -> I), spec §4.4 steps 1-6.
    pub async fn handle_request(&self, session: &Arc<Session>, req: ExternalRequest) -> Result<()> {
        if let Err(e) = self.validator_check_structural(&req) {
            self.reply_error(session, &req.id, &e).await;
            return Err(e);
        }

        if self.translator.lookup_capability(&req.name).is_none()
            && !req.user_context.contains_key("operation")
            && !req.user_context.contains_key("type")
        {
            let known: Vec<String> = self.config.tool_name_map.keys().cloned().collect();
            let error = BridgeError::UnsupportedTool(req.name.clone());
            self.reply_unsupported_tool(session, &req.id, &error, known).await;
            return Err(error);
        }

        let category = category_for(&req.name, &self.config);
        let admission = self.rate_limiter.admit(&category);
        if !admission.admitted {
            let error = BridgeError::RateLimited { category: category.clone() };
            self.reply_rate_limited(session, &req.id, &error, admission.category_remaining)
                .await;
            return Err(error);
        }

        let message = match self.translator.to_internal(&req) {
            Ok(m) => m,
            Err(e) => {
                self.reply_error(session, &req.id, &e).await;
                return Err(e);
            }
        };

        self.pending.insert(
            message.id.clone(),
            PendingRequest {
                session_id: session.id.clone(),
                original_request_name: req.name.clone(),
                deadline: Instant::now() + self.request_timeout,
            },
        );

        if let Err(e) = self.peer_i.send(message).await {
            self.pending.remove(&req.id);
            self.reply_error(session, &req.id, &e).await;
            return Err(e);
        }

        let ack = Frame::new(Kind::Response, req.id.clone())
            .with_content(json!({ "status": "queued" }))
            .with_correlation_id(req.id.clone());
        let _ = session.send(ack).await;

        Ok(())
    }

    fn validator_check_structural(&self, req: &ExternalRequest) -> Result<()> {
        if req.name.is_empty() {
            return Err(BridgeError::SchemaViolation("request name is empty".to_string()));
        }
        if req.id.is_empty() {
            return Err(BridgeError::SchemaViolation("request id is empty".to_string()));
        }
        Ok(())
    }

    /// Response path (I -> E), spec §4.4.
    pub async fn handle_peer_i_message(&self, message: Message) {
        let Some(correlation_id) = message.correlation_id.clone() else {
            self.broadcast_to_monitoring(&message).await;
            return;
        };

        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            // Unmatched or already-swept: dropped, per spec §4.4.
            self.broadcast_to_monitoring(&message).await;
            return;
        };

        let Some(session) = self.sessions.get(&pending.session_id).map(|s| s.clone()) else {
            return;
        };

        match self.translator.to_external(&message, &self.config.preferred_version) {
            Ok(external) => {
                let frame = Frame::new(Kind::Response, external.id)
                    .with_content(json!({ "result": external.result, "metadata": external.metadata }))
                    .with_correlation_id(correlation_id);
                let _ = session.send(frame).await;
            }
            Err(e) => {
                self.reply_error(&session, &correlation_id, &e).await;
            }
        }

        let _ = pending.original_request_name;
    }

    async fn broadcast_to_monitoring(&self, message: &Message) {
        for entry in self.monitoring.iter() {
            let frame = Frame::new(Kind::Context, message.id.clone())
                .with_content(message.payload.clone())
                .with_context(message.context.clone());
            // Failures to a monitoring socket do not block the main path.
            let _ = entry.value().send(frame).await;
        }
    }

    /// Deadline sweep (spec §4.4 "Deadlines", §4.8 Supervisor loop).
    pub async fn sweep_deadlines(&self) {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| (entry.key().clone(), entry.value().session_id.clone()))
            .collect();

        for (request_id, session_id) in expired {
            self.pending.remove(&request_id);
            if let Some(session) = self.sessions.get(&session_id).map(|s| s.clone()) {
                let error = BridgeError::RequestTimedOut(request_id.clone());
                self.reply_error(&session, &request_id, &error).await;
            }
            info!(request_id, "pending request swept after timeout");
        }
    }

    async fn reply_error(&self, session: &Arc<Session>, request_id: &str, error: &BridgeError) {
        let payload = error.to_error_payload();
        let frame = Frame::new(Kind::Error, request_id.to_string())
            .with_content(json!(payload))
            .with_correlation_id(request_id.to_string());
        if session.send(frame).await.is_err() {
            warn!(request_id, "failed to deliver error to session");
        }
    }

    async fn reply_unsupported_tool(
        &self,
        session: &Arc<Session>,
        request_id: &str,
        error: &BridgeError,
        known_tools: Vec<String>,
    ) {
        let payload = error.to_error_payload().with_suggestions(known_tools);
        let frame = Frame::new(Kind::Error, request_id.to_string())
            .with_content(json!(payload))
            .with_correlation_id(request_id.to_string());
        let _ = session.send(frame).await;
    }

    async fn reply_rate_limited(
        &self,
        session: &Arc<Session>,
        request_id: &str,
        error: &BridgeError,
        remaining: u32,
    ) {
        let mut payload = json!(error.to_error_payload());
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("remaining".to_string(), json!(remaining));
        }
        let frame = Frame::new(Kind::Error, request_id.to_string())
            .with_content(payload)
            .with_correlation_id(request_id.to_string());
        let _ = session.send(frame).await;
    }

    /// Handles the supplemented `command` message kind (SPEC_FULL §5):
    /// `status`, `reconnect`, `sync`.
    pub async fn handle_command(
        &self,
        session: &Arc<Session>,
        request_id: &str,
        command: &str,
        compression_stats: &crate::translator::CompressionStatsHandle,
    ) {
        let reply = match command {
            "status" => json!({
                "peerI": { "status": format!("{:?}", self.peer_i.status().await), "queueDepth": self.peer_i.queue_depth().await },
                "rateLimits": self.rate_limiter.snapshot(),
                "pendingRequests": self.pending.len(),
                "compression": compression_stats.snapshot(),
            }),
            "reconnect" => {
                let peer_i = Arc::clone(&self.peer_i);
                tokio::spawn(async move { peer_i.connect().await });
                json!({ "reconnecting": true })
            }
            "sync" => {
                self.send_context_sync(&self.peer_i).await;
                json!({ "synced": true })
            }
            other => json!({ "error": format!("unknown command: {other}") }),
        };

        let frame = Frame::new(Kind::Command, request_id.to_string()).with_content(reply);
        let _ = session.send(frame).await;
    }

    /// Context-sync heartbeat (spec §4.8 "Context-sync loop").
    pub async fn send_context_sync(&self, peer: &Arc<PeerConnection>) {
        let context = Context::system("context_sync");
        let message = Message::new(
            format!("ctxsync-{}", crate::message::wall_now_secs()),
            Kind::Context,
            json!({}),
            context,
        );
        if let Err(e) = peer.send(message).await {
            warn!(error = %e, "context-sync send failed");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Notifies every live E-side `Session` that the bridge is shutting down
    /// (spec §4.8 "graceful shutdown"), so clients see a close/error frame
    /// rather than a bare socket drop.
    pub async fn close_all_sessions(&self) {
        let payload = ErrorPayload::new("connection_failure", "bridge is shutting down", false);
        for entry in self.sessions.iter() {
            let frame = Frame::new(Kind::Error, "shutdown").with_content(json!(payload));
            let _ = entry.value().send(frame).await;
        }
    }
}
