// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `Session`: per-inbound-E-client state (spec §3). Destroyed on socket
//! close or two consecutive idle-probe failures.

use std::time::Instant;

use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::message::Frame;

/// Per-inbound-client record. The write half is serialized behind a mutex
/// (spec §5: "Session write side — per-session mutex") since multiple Router
/// paths may write to the same Session concurrently (a response and an
/// out-of-band error, say).
///
/// Request/response correlation (`pendingRequests`) is owned by `Router`,
/// not `Session` (spec §5); a `Session` only tracks its own idle-probe state.
pub struct Session {
    pub id: String,
    pub created_at: Instant,
    outbound: Mutex<mpsc::Sender<Frame>>,
    idle_probe_failures: std::sync::atomic::AtomicU8,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Session {
    pub fn new(id: impl Into<String>, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: id.into(),
            created_at: Instant::now(),
            outbound: Mutex::new(outbound),
            idle_probe_failures: std::sync::atomic::AtomicU8::new(0),
        }
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        let sender = self.outbound.lock().await;
        sender
            .send(frame)
            .await
            .map_err(|_| crate::error::BridgeError::ConnectionClosed {
                peer: self.id.clone(),
                reason: "session outbound channel closed".to_string(),
            })
    }

    /// Records one idle-probe failure; returns whether the session has now
    /// failed two consecutive probes and should be closed.
    pub fn record_idle_probe_failure(&self) -> bool {
        let count = self.idle_probe_failures.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        count >= 2
    }

    pub fn reset_idle_probe_failures(&self) {
        self.idle_probe_failures.store(0, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;

    #[tokio::test]
    async fn two_consecutive_idle_failures_signal_close() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new("s1", tx);
        assert!(!session.record_idle_probe_failure());
        assert!(session.record_idle_probe_failure());
    }

    #[tokio::test]
    async fn activity_resets_idle_failure_count() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new("s1", tx);
        assert!(!session.record_idle_probe_failure());
        session.reset_idle_probe_failures();
        assert!(!session.record_idle_probe_failure());
    }

    #[tokio::test]
    async fn send_delivers_to_outbound_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let session = Session::new("s1", tx);
        tokio_test::assert_ok!(session.send(Frame::new(Kind::Response, "resp-1")).await);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "resp-1");
    }

    #[tokio::test]
    async fn send_on_a_closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let session = Session::new("s1", tx);
        tokio_test::assert_err!(session.send(Frame::new(Kind::Response, "resp-1")).await);
    }
}
