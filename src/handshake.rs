// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! QHP handshake and version negotiation as an explicit state machine
//! (spec §4.1, §9 "re-architect the async callback pyramid").
//!
//! Transitions are driven by typed events; a timeout is a transition, not an
//! exception — callers await with `tokio::time::timeout` and feed the
//! resulting `Option` into [`Handshake::on_timeout`] when it elapses.

use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{BridgeError, Result};
use crate::message::{Frame, Kind};

/// The handshake's own state, independent of the owning `PeerLink`'s wider
/// `disconnected/connecting/handshaking/ready` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    InitSent,
    RespReceived,
    AckSent,
    Ready,
}

/// 256-bit local fingerprint: random bytes hashed with local identity via
/// SHA-256, per spec §4.1 step 3.
pub fn generate_fingerprint(local_identity: &str) -> Vec<u8> {
    let mut random = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random);

    let mut hasher = Sha256::new();
    hasher.update(random);
    hasher.update(local_identity.as_bytes());
    hasher.finalize().to_vec()
}

/// 128-bit challenge.
pub fn generate_challenge() -> Vec<u8> {
    let mut challenge = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge.to_vec()
}

fn respond_to_challenge(challenge: &[u8], fingerprint: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(fingerprint);
    hasher.finalize().to_vec()
}

/// Drives one outbound handshake attempt against a single peer.
#[derive(Debug)]
pub struct Handshake {
    pub state: HandshakeState,
    pub our_fingerprint: Vec<u8>,
    our_challenge: Vec<u8>,
    supported_versions: Vec<String>,
    preferred_version: String,
}

/// What the peer sent back in its handshake-response frame.
#[derive(Debug)]
pub struct PeerHandshakeResponse {
    pub peer_fingerprint: Vec<u8>,
    pub peer_challenge: Vec<u8>,
    pub response_to_our_challenge: Vec<u8>,
}

impl Handshake {
    pub fn begin(
        local_identity: &str,
        supported_versions: Vec<String>,
        preferred_version: String,
    ) -> (Self, Frame) {
        let our_fingerprint = generate_fingerprint(local_identity);
        let our_challenge = generate_challenge();

        let frame = Frame::new(Kind::QhpHandshake, new_msg_id()).with_content(json!({
            "fingerprint": hex::encode(&our_fingerprint),
            "challenge": hex::encode(&our_challenge),
            "supportedVersions": supported_versions,
        }));

        (
            Self {
                state: HandshakeState::InitSent,
                our_fingerprint,
                our_challenge,
                supported_versions,
                preferred_version,
            },
            frame,
        )
    }

    /// Step 5: verify `SHA-256(ourChallenge || peerFingerprint) == peerResponse`.
    /// On success, builds the handshake-ack frame (step 6) and advances to
    /// `AckSent`.
    pub fn on_response(&mut self, response: PeerHandshakeResponse) -> Result<Frame> {
        if self.state != HandshakeState::InitSent {
            return Err(BridgeError::Handshake {
                peer: "unknown".to_string(),
                reason: format!("handshake-response received in state {:?}", self.state),
            });
        }

        let expected = respond_to_challenge(&self.our_challenge, &response.peer_fingerprint);
        if expected != response.response_to_our_challenge {
            return Err(BridgeError::Handshake {
                peer: hex::encode(&response.peer_fingerprint),
                reason: "challenge response mismatch".to_string(),
            });
        }

        self.state = HandshakeState::RespReceived;

        let our_response = respond_to_challenge(&response.peer_challenge, &self.our_fingerprint);
        let ack = Frame::new(Kind::QhpHandshakeAck, new_msg_id())
            .with_content(json!({ "response": hex::encode(&our_response) }));

        self.state = HandshakeState::AckSent;
        Ok(ack)
    }

    /// Step 7: the peer accepted our ack; transition to `Ready`.
    pub fn on_ack_accepted(&mut self) {
        self.state = HandshakeState::Ready;
    }

    /// Called when the handshake-response timeout (5s) elapses in `InitSent`.
    pub fn on_timeout(&mut self) -> BridgeError {
        BridgeError::Handshake {
            peer: "unknown".to_string(),
            reason: "handshake response timed out".to_string(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Selects a protocol version from the peer's `selectedVersion`, falling
    /// back to our preferred version when absent.
    pub fn negotiate_version(&self, peer_selected: Option<String>) -> String {
        peer_selected
            .filter(|v| self.supported_versions.contains(v))
            .unwrap_or_else(|| self.preferred_version.clone())
    }

    pub fn supported_versions(&self) -> &[String] {
        &self.supported_versions
    }

    pub fn preferred_version(&self) -> &str {
        &self.preferred_version
    }
}

pub(crate) fn new_msg_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1. Handshake success.
    #[test]
    fn matching_challenge_response_reaches_ack_sent() {
        let (mut hs, _init_frame) =
            Handshake::begin("local", vec!["1.0".to_string()], "1.0".to_string());

        let peer_fingerprint = b"AAA_peer_fingerprint_bytes".to_vec();
        let expected_response = respond_to_challenge(&hs.our_challenge.clone(), &peer_fingerprint);

        let response = PeerHandshakeResponse {
            peer_fingerprint,
            peer_challenge: b"0123456789abcdef0123456789abcdef".to_vec(),
            response_to_our_challenge: expected_response,
        };

        let ack = hs.on_response(response).unwrap();
        assert_eq!(hs.state, HandshakeState::AckSent);
        assert_eq!(ack.kind, Kind::QhpHandshakeAck);

        hs.on_ack_accepted();
        assert!(hs.is_ready());
    }

    /// S2. Handshake failure.
    #[test]
    fn mismatched_challenge_response_fails_closed() {
        let (mut hs, _init_frame) =
            Handshake::begin("local", vec!["1.0".to_string()], "1.0".to_string());

        let response = PeerHandshakeResponse {
            peer_fingerprint: b"AAA".to_vec(),
            peer_challenge: b"0123456789abcdef0123456789abcdef".to_vec(),
            response_to_our_challenge: b"deadbeefdeadbeefdeadbeefdeadbeef".to_vec(),
        };

        let result = hs.on_response(response);
        assert_matches::assert_matches!(result, Err(BridgeError::Handshake { .. }));
        assert_ne!(hs.state, HandshakeState::Ready);
    }

    #[test]
    fn version_negotiation_falls_back_to_preferred() {
        let (hs, _) = Handshake::begin("local", vec!["1.0".to_string(), "1.1".to_string()], "1.1".to_string());
        assert_eq!(hs.negotiate_version(None), "1.1");
        assert_eq!(hs.negotiate_version(Some("1.0".to_string())), "1.0");
        assert_eq!(hs.negotiate_version(Some("9.9".to_string())), "1.1");
    }
}
