// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `PeerLink`/`PeerConnection`: one outbound socket to a named peer, driven
//! through `disconnected -> connecting -> handshaking -> ready` and back
//! (spec §4.1).
//!
//! `PeerConnection` does not know about `Router`: it emits inbound messages
//! onto a channel the caller owns, per the re-architecture note against
//! reference cycles (spec §9).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::codec::{JsonTextCodec, MessageCodec};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handshake::{new_msg_id, Handshake, HandshakeState, PeerHandshakeResponse};
use crate::message::{Context, Kind, Message};
use crate::queue::DurableQueue;
use crate::trust::TrustTable;
use crate::validator::Validator;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The socket-lifecycle status named in spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
}

struct SharedState {
    status: PeerStatus,
    session_key: Option<Vec<u8>>,
    selected_version: Option<String>,
    /// Signals the current connection attempt's receive loop to stop
    /// without falling through to reconnect. Set fresh on every `connect()`,
    /// fired by `close()`.
    shutdown_tx: Option<watch::Sender<bool>>,
}

/// Owns one outbound socket plus the peer's durable outbound queue.
pub struct PeerConnection {
    pub peer_name: String,
    endpoint: String,
    state: RwLock<SharedState>,
    backoff_attempts: AtomicU32,
    backoff: std::sync::Mutex<ExponentialBackoff>,
    queue: Arc<DurableQueue>,
    trust: Arc<TrustTable>,
    validator: Arc<Validator>,
    codec: JsonTextCodec,
    inbound_tx: mpsc::Sender<Message>,
    handshake_timeout: Duration,
    preferred_version: String,
    writer: RwLock<Option<futures_util::stream::SplitSink<WsStream, WsMessage>>>,
    /// Notified when this peer hits an unrecoverable error (spec.md §7's
    /// fatal taxonomy) so the owning `Bridge` can terminate the process.
    fatal_tx: mpsc::Sender<BridgeError>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_name", &self.peer_name)
            .field("endpoint", &self.endpoint)
            .field("backoff_attempts", &self.backoff_attempts.load(Ordering::SeqCst))
            .finish()
    }
}

impl PeerConnection {
    pub async fn new(
        peer_name: impl Into<String>,
        endpoint: impl Into<String>,
        config: &BridgeConfig,
        queue_dir: PathBuf,
        trust: Arc<TrustTable>,
        validator: Arc<Validator>,
        inbound_tx: mpsc::Sender<Message>,
        fatal_tx: mpsc::Sender<BridgeError>,
    ) -> Result<Self> {
        let peer_name = peer_name.into();
        let queue = Arc::new(
            DurableQueue::load(
                queue_dir.join(format!("{peer_name}.json")),
                Duration::from_secs(config.queue_max_age_seconds),
            )
            .await?,
        );

        let backoff = ExponentialBackoff {
            current_interval: Duration::from_millis(config.backoff_base_ms),
            initial_interval: Duration::from_millis(config.backoff_base_ms),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(config.backoff_ceiling_ms),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        Ok(Self {
            peer_name,
            endpoint: endpoint.into(),
            state: RwLock::new(SharedState {
                status: PeerStatus::Disconnected,
                session_key: None,
                selected_version: None,
                shutdown_tx: None,
            }),
            backoff_attempts: AtomicU32::new(0),
            backoff: std::sync::Mutex::new(backoff),
            queue,
            trust,
            validator,
            codec: JsonTextCodec,
            inbound_tx,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_seconds),
            preferred_version: config.preferred_version.clone(),
            writer: RwLock::new(None),
            fatal_tx,
        })
    }

    pub async fn status(&self) -> PeerStatus {
        self.state.read().await.status
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    /// Next backoff delay per `delay(n) = min(base * 2^n, ceiling)`; does not
    /// advance the attempt counter (see [`PeerConnection::record_failed_attempt`]).
    fn next_backoff_delay(&self) -> Duration {
        let mut backoff = self.backoff.lock().expect("backoff mutex poisoned");
        backoff.next_backoff().unwrap_or(backoff.max_interval)
    }

    fn record_failed_attempt(&self) {
        self.backoff_attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn reset_backoff(&self) {
        self.backoff_attempts.store(0, Ordering::SeqCst);
        self.backoff.lock().expect("backoff mutex poisoned").reset();
    }

    pub fn backoff_attempts(&self) -> u32 {
        self.backoff_attempts.load(Ordering::SeqCst)
    }

    /// Drives one connect-and-handshake attempt (spec §4.1 steps 1-7). On
    /// failure, schedules a reconnect after the current backoff delay and
    /// returns without error — reconnection is a data transition, not an
    /// exception (spec §9).
    #[tracing::instrument(skip(self), fields(peer = %self.peer_name))]
    pub async fn connect(self: &Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut state = self.state.write().await;
            state.status = PeerStatus::Connecting;
            state.shutdown_tx = Some(shutdown_tx);
        }

        let stream = match connect_async(&self.endpoint).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                warn!(peer = %self.peer_name, error = %e, "connect failed");
                self.fail_and_schedule_reconnect().await;
                return;
            }
        };

        {
            let mut state = self.state.write().await;
            state.status = PeerStatus::Handshaking;
        }

        let (writer, mut reader) = stream.split();
        *self.writer.write().await = Some(writer);

        let (mut handshake, init_frame) =
            Handshake::begin(&self.peer_name, vec!["1.0".to_string()], self.preferred_version.clone());

        if self.send_raw(init_frame).await.is_err() {
            self.fail_and_schedule_reconnect().await;
            return;
        }

        let response_frame = match tokio::time::timeout(self.handshake_timeout, reader.next()).await {
            Ok(Some(Ok(ws_msg))) => ws_msg,
            _ => {
                warn!(peer = %self.peer_name, "handshake response timed out");
                self.fail_and_schedule_reconnect().await;
                return;
            }
        };

        let frame = match self.codec.decode(response_frame) {
            Ok(Some(frame)) if frame.kind == Kind::QhpHandshakeResponse => frame,
            _ => {
                warn!(peer = %self.peer_name, "malformed or unexpected handshake response");
                self.fail_and_schedule_reconnect().await;
                return;
            }
        };

        let content = frame.content.unwrap_or_else(|| json!({}));
        let parsed = parse_handshake_response(&content);
        let parsed = match parsed {
            Some(p) => p,
            None => {
                self.fail_and_schedule_reconnect().await;
                return;
            }
        };

        let ack = match handshake.on_response(parsed) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(peer = %self.peer_name, error = %e, "handshake challenge mismatch");
                self.fail_and_schedule_reconnect().await;
                return;
            }
        };

        if self.send_raw(ack).await.is_err() {
            self.fail_and_schedule_reconnect().await;
            return;
        }
        handshake.on_ack_accepted();

        if handshake.state != HandshakeState::Ready {
            self.fail_and_schedule_reconnect().await;
            return;
        }

        let selected_version = self.negotiate_version(&mut reader, &handshake).await;

        let session_key = handshake.our_fingerprint.clone();
        self.trust
            .record(self.peer_name.clone(), handshake.our_fingerprint.clone(), session_key.clone())
            .await;

        {
            let mut state = self.state.write().await;
            state.status = PeerStatus::Ready;
            state.session_key = Some(session_key);
            state.selected_version = Some(handshake.negotiate_version(selected_version));
        }
        self.reset_backoff();
        info!(peer = %self.peer_name, "handshake complete, peer ready");

        self.spawn_receive_loop(reader, shutdown_rx);
        self.pump_queue().await;
    }

    /// Exchanges a `VersionNegotiation`/`VersionNegotiationResponse` frame
    /// pair (spec §4.1 step 7a) and returns the peer's `selectedVersion`, if
    /// any. Any failure (timeout, malformed frame, wrong kind) is non-fatal:
    /// the caller falls back to the preferred version via
    /// [`Handshake::negotiate_version`].
    async fn negotiate_version(
        &self,
        reader: &mut futures_util::stream::SplitStream<WsStream>,
        handshake: &Handshake,
    ) -> Option<String> {
        let frame = crate::message::Frame::new(Kind::VersionNegotiation, new_msg_id()).with_content(json!({
            "supportedVersions": handshake.supported_versions(),
            "preferredVersion": handshake.preferred_version(),
        }));

        if self.send_raw(frame).await.is_err() {
            return None;
        }

        let response = match tokio::time::timeout(self.handshake_timeout, reader.next()).await {
            Ok(Some(Ok(ws_msg))) => ws_msg,
            _ => {
                debug!(peer = %self.peer_name, "version negotiation response timed out, falling back to preferred version");
                return None;
            }
        };

        let frame = match self.codec.decode(response) {
            Ok(Some(frame)) if frame.kind == Kind::VersionNegotiationResponse => frame,
            _ => {
                debug!(peer = %self.peer_name, "malformed or unexpected version negotiation response");
                return None;
            }
        };

        frame
            .content
            .as_ref()
            .and_then(|c| c.get("selectedVersion"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    }

    async fn fail_and_schedule_reconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            state.status = PeerStatus::Disconnected;
            state.session_key = None;
        }
        self.record_failed_attempt();
        let delay = self.next_backoff_delay();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.connect().await;
        });
    }

    fn spawn_receive_loop(
        self: &Arc<Self>,
        mut reader: futures_util::stream::SplitStream<WsStream>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    next = reader.next() => {
                        let Some(next) = next else { break };
                        let ws_msg = match next {
                            Ok(m) => m,
                            Err(e) => {
                                debug!(peer = %this.peer_name, error = %e, "receive error");
                                break;
                            }
                        };

                        let frame = match this.codec.decode(ws_msg) {
                            Ok(Some(frame)) => frame,
                            Ok(None) => continue,
                            Err(e) => {
                                debug!(peer = %this.peer_name, error = %e, "framing error, continuing");
                                continue;
                            }
                        };

                        if let Err(e) = this.validator.check_inbound(&frame) {
                            debug!(peer = %this.peer_name, error = %e, "inbound frame rejected by validator");
                            continue;
                        }

                        let context = frame.context.clone().unwrap_or_else(|| Context::system(&this.peer_name));
                        let payload = frame.content.clone().unwrap_or(serde_json::Value::Null);
                        let mut message = Message::new(frame.id.clone(), frame.kind, payload, context);
                        message.correlation_id = frame.correlation_id.clone();

                        if this.inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            }

            let deliberately_closed = this.status().await == PeerStatus::Closing;

            let mut state = this.state.write().await;
            state.status = PeerStatus::Disconnected;
            state.session_key = None;
            drop(state);

            if !deliberately_closed {
                this.fail_and_schedule_reconnect().await;
            }
        });
    }

    async fn send_raw(&self, frame: crate::message::Frame) -> Result<()> {
        let signed = self.validator.sign(frame)?;
        let ws_msg = self.codec.encode(&signed)?;
        let mut writer_guard = self.writer.write().await;
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| BridgeError::ConnectionClosed { peer: self.peer_name.clone(), reason: "no writer".to_string() })?;
        writer
            .send(ws_msg)
            .await
            .map_err(|e| BridgeError::ConnectionClosed { peer: self.peer_name.clone(), reason: e.to_string() })
    }

    /// Send contract (spec §4.1): transmits when ready, else enqueues.
    /// The caller cannot distinguish the two outcomes; delivery is
    /// at-least-once. A message already older than the queue's max-age is
    /// rejected outright rather than queued (outcome (c)).
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.queue.is_stale(&message) {
            warn!(peer = %self.peer_name, id = %message.id, "message dropped: already older than queue max-age at send time");
            return Err(BridgeError::MessageExpired(message.id));
        }

        let ready = self.status().await == PeerStatus::Ready;
        let queue_has_entries = !self.queue.is_empty().await;

        let result = if ready && !queue_has_entries {
            let frame = crate::message::Frame::new(message.kind, message.id.clone())
                .with_content(message.payload.clone())
                .with_context(message.context.clone());
            let frame = match &message.correlation_id {
                Some(cid) => frame.with_correlation_id(cid.clone()),
                None => frame,
            };

            match self.send_raw(frame).await {
                Ok(()) => Ok(()),
                Err(_) => self.queue.enqueue(message).await,
            }
        } else {
            self.queue.enqueue(message).await
        };

        if let Err(e) = &result {
            if e.is_fatal() {
                let _ = self.fatal_tx.send(BridgeError::QueuePersistence {
                    peer: self.peer_name.clone(),
                    reason: e.to_string(),
                }).await;
            }
        }

        result
    }

    /// Pumps the outbound queue while `status == ready` (spec §4.1 step 7,
    /// §4.2 `drain`).
    pub async fn pump_queue(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let result = this
            .queue
            .drain(
                {
                    let this = Arc::clone(&this);
                    move || matches!(this.state.try_read().map(|s| s.status), Ok(PeerStatus::Ready))
                },
                {
                    let this = Arc::clone(&this);
                    move |message| {
                        let this = Arc::clone(&this);
                        async move {
                            let frame = crate::message::Frame::new(message.kind, message.id.clone())
                                .with_content(message.payload.clone())
                                .with_context(message.context.clone());
                            this.send_raw(frame).await
                        }
                    }
                },
            )
            .await;

        if let Err(e) = result {
            warn!(peer = %this.peer_name, error = %e, "queue drain failed");
            if e.is_fatal() {
                let _ = this.fatal_tx.send(e).await;
            }
        }
    }

    /// Idempotent: transitions to `closing`, and drops the writer half.
    /// Does not purge the `DurableQueue` (spec §4.1).
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if state.status == PeerStatus::Closing {
            return;
        }
        state.status = PeerStatus::Closing;
        state.session_key = None;
        if let Some(tx) = &state.shutdown_tx {
            let _ = tx.send(true);
        }
        drop(state);

        if let Some(mut writer) = self.writer.write().await.take() {
            let _ = writer.close().await;
        }
    }
}

fn parse_handshake_response(content: &serde_json::Value) -> Option<PeerHandshakeResponse> {
    let peer_fingerprint = hex::decode(content.get("fingerprint")?.as_str()?).ok()?;
    let peer_challenge = hex::decode(content.get("challenge")?.as_str()?).ok()?;
    let response_to_our_challenge = hex::decode(content.get("response")?.as_str()?).ok()?;
    Some(PeerHandshakeResponse { peer_fingerprint, peer_challenge, response_to_our_challenge })
}
