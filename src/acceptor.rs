// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `AcceptorServer`: listens for inbound E-side client connections; owns one
//! `Session` per client and pumps its requests to the `Router` (spec §4.5).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::codec::{JsonTextCodec, MessageCodec};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::message::{Frame, Kind};
use crate::router::Router;
use crate::session::Session;
use crate::translator::{CompressionStatsHandle, ExternalRequest};

/// Listens on `config.listen_port`; refuses to start if the port is already
/// bound (spec §4.5 "Startup guard").
pub struct AcceptorServer {
    router: Arc<Router>,
    idle_timeout: Duration,
    compression_stats: CompressionStatsHandle,
}

impl std::fmt::Debug for AcceptorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorServer").field("idle_timeout", &self.idle_timeout).finish()
    }
}

impl AcceptorServer {
    pub fn new(router: Arc<Router>, config: &BridgeConfig, compression_stats: CompressionStatsHandle) -> Self {
        Self {
            router,
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            compression_stats,
        }
    }

    /// Binds the listener, failing fast if the port is already in use — the
    /// bridge must never double-bind.
    pub async fn bind(listen_port: u16) -> Result<TcpListener> {
        TcpListener::bind(("0.0.0.0", listen_port)).await.map_err(BridgeError::Io)
    }

    #[tracing::instrument(skip(self, listener))]
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let mut session_seq: u64 = 0;
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            session_seq += 1;
            let session_id = format!("session-{session_seq}");
            info!(%session_id, %addr, "accepted inbound connection");

            let this = Arc::clone(&self);
            tokio::spawn(async move { this.serve_session(session_id, stream).await });
        }
    }

    async fn serve_session(self: Arc<Self>, session_id: String, stream: TcpStream) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%session_id, error = %e, "websocket handshake failed");
                return;
            }
        };

        let (mut writer, mut reader) = ws_stream.split();
        let codec = JsonTextCodec;
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);

        let session = Arc::new(Session::new(session_id.clone(), outbound_tx));
        self.router.register_session(Arc::clone(&session));

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let encoded = match codec.encode(&frame) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound frame");
                        continue;
                    }
                };
                if writer.send(encoded).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let next = tokio::time::timeout(self.idle_timeout, reader.next()).await;
            match next {
                Ok(Some(Ok(ws_msg))) => {
                    session.reset_idle_probe_failures();
                    self.handle_inbound(&session, ws_msg).await;
                }
                Ok(Some(Err(e))) => {
                    debug!(%session_id, error = %e, "session read error");
                    break;
                }
                Ok(None) => break,
                Err(_timeout_elapsed) => {
                    let past_threshold = session.record_idle_probe_failure();
                    let _ = session.send(Frame::new(Kind::Ping, format!("ping-{session_id}"))).await;
                    if past_threshold {
                        info!(%session_id, "two consecutive idle intervals, closing session");
                        break;
                    }
                }
            }
        }

        self.router.deregister_session(&session_id);
        writer_task.abort();
        info!(%session_id, "session closed");
    }

    async fn handle_inbound(&self, session: &Arc<Session>, ws_msg: WsMessage) {
        let codec = JsonTextCodec;
        let frame = match codec.decode(ws_msg) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "malformed inbound frame");
                return;
            }
        };

        match frame.kind {
            Kind::Request => {
                let req = match external_request_from_frame(&frame) {
                    Ok(req) => req,
                    Err(e) => {
                        debug!(error = %e, "could not parse external request shape");
                        return;
                    }
                };
                let _ = self.router.handle_request(session, req).await;
            }
            Kind::Command => {
                let command = frame
                    .content
                    .as_ref()
                    .and_then(|c| c.get("command"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                self.router.register_monitoring(Arc::clone(session));
                self.router.handle_command(session, &frame.id, command, &self.compression_stats).await;
            }
            Kind::Pong => {
                // Idle-probe acknowledged; nothing further to do.
            }
            other => {
                debug!(?other, "unexpected frame kind on an E-side session");
            }
        }
    }
}

fn external_request_from_frame(frame: &Frame) -> Result<ExternalRequest> {
    let content = frame
        .content
        .as_ref()
        .ok_or_else(|| BridgeError::SchemaViolation("request frame missing content".to_string()))?;

    let name = content
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::SchemaViolation("request missing name".to_string()))?
        .to_string();

    let parameters = content.get("parameters").cloned().unwrap_or(Value::Null);

    let user_context: BTreeMap<String, Value> = content
        .get("userContext")
        .and_then(Value::as_object)
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default();

    Ok(ExternalRequest { name, parameters, id: frame.id.clone(), user_context })
}
