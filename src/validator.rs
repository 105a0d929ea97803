// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Structural, signature, freshness, and replay checks on inbound frames;
//! signing of outbound frames (spec §4.7).

use std::num::NonZeroUsize;
use std::sync::Mutex;

use hmac::{Hmac, Mac};
use lru::LruCache;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{BridgeError, Result};
use crate::message::{wall_now_secs, Frame, FrameMeta};

type HmacSha256 = Hmac<Sha256>;

/// Frames with `meta.timestamp` older than this are rejected as stale.
const FRESHNESS_WINDOW_SECS: f64 = 5.0 * 60.0;

/// Bound on the replay table: the last 1000 inbound message ids.
const REPLAY_TABLE_SIZE: usize = 1000;

/// Signs outbound frames and checks inbound frames for schema conformance,
/// signature validity, freshness, and replay.
pub struct Validator {
    signing_key: Vec<u8>,
    replay_table: Mutex<LruCache<String, ()>>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").finish_non_exhaustive()
    }
}

impl Validator {
    /// `signing_key` is derived from machine identity at construction time
    /// by the caller (spec §4.7); the Validator itself only consumes it.
    pub fn new(signing_key: Vec<u8>) -> Self {
        Self {
            signing_key,
            replay_table: Mutex::new(LruCache::new(
                NonZeroUsize::new(REPLAY_TABLE_SIZE).expect("nonzero replay table size"),
            )),
        }
    }

    /// Derives a fresh random signing key, for deployments with no
    /// pre-provisioned machine identity.
    pub fn with_random_key() -> Self {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    /// Structural check: required fields present (spec §6: every frame has
    /// a non-empty `kind`+`id`; `meta` is required by the time this runs).
    fn check_structure(&self, frame: &Frame) -> Result<()> {
        if frame.id.is_empty() {
            return Err(BridgeError::SchemaViolation("frame id is empty".to_string()));
        }
        Ok(())
    }

    fn canonical_signing_bytes(frame: &Frame) -> Result<Vec<u8>> {
        let mut unsigned = frame.clone();
        unsigned.meta = None;
        // `to_vec` on a serde_json::Value sorts map keys only if the Value
        // was built from a BTreeMap; Frame's fields are not a map, so we
        // instead serialize the struct as-is — field order is stable across
        // calls because it is declaration order, which is what both sides
        // of a signature check need to agree on.
        serde_json::to_vec(&unsigned).map_err(BridgeError::Codec)
    }

    fn sign_bytes(&self, bytes: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| BridgeError::Translation(format!("bad HMAC key: {e}")))?;
        mac.update(bytes);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Adds `meta.messageId`, `meta.timestamp`, `meta.signature` to an
    /// outbound frame.
    pub fn sign(&self, mut frame: Frame) -> Result<Frame> {
        let message_id = frame.id.clone();
        let timestamp = wall_now_secs();
        frame.meta = Some(FrameMeta { message_id, timestamp, signature: String::new() });

        let bytes = Self::canonical_signing_bytes(&frame)?;
        let signature = self.sign_bytes(&bytes)?;
        if let Some(meta) = frame.meta.as_mut() {
            meta.signature = signature;
        }
        Ok(frame)
    }

    /// Full inbound check: structure, then signature, then freshness, then
    /// replay. Each failure maps to a distinct [`BridgeError`] variant.
    pub fn check_inbound(&self, frame: &Frame) -> Result<()> {
        self.check_structure(frame)?;

        let meta = frame
            .meta
            .as_ref()
            .ok_or_else(|| BridgeError::SchemaViolation("frame missing meta".to_string()))?;

        let bytes = Self::canonical_signing_bytes(frame)?;
        let expected = self.sign_bytes(&bytes)?;
        if !constant_time_eq(expected.as_bytes(), meta.signature.as_bytes()) {
            return Err(BridgeError::BadSignature);
        }

        if wall_now_secs() - meta.timestamp > FRESHNESS_WINDOW_SECS {
            return Err(BridgeError::StaleFrame);
        }

        let mut replay_table = self.replay_table.lock().expect("replay table mutex poisoned");
        if replay_table.contains(&meta.message_id) {
            return Err(BridgeError::Replay(meta.message_id.clone()));
        }
        replay_table.put(meta.message_id.clone(), ());

        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
