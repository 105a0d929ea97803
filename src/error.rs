// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::io;
use thiserror::Error;

use crate::message::ErrorPayload;

/// The type returned by every fallible operation in this crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Internal error taxonomy for the bridge runtime.
///
/// Every variant maps onto exactly one of the wire-level `errorType` values
/// via [`BridgeError::to_error_payload`]; the mapping is the seam between our
/// internal recovery taxonomy and what a Session is told.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum BridgeError {
    /// I/O error, e.g. reading the queue file or binding the listener.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialisation failure on the wire.
    #[error("JSON codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A frame could not be parsed into the wire shape at all.
    #[error("malformed frame: {0}")]
    Framing(String),

    /// The QHP handshake failed verification or timed out.
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    /// The underlying socket closed or could not be reached.
    #[error("connection to {peer} closed: {reason}")]
    ConnectionClosed { peer: String, reason: String },

    /// Validator rejected an inbound frame on structural grounds.
    #[error("schema validation failed: {0}")]
    SchemaViolation(String),

    /// Validator rejected an inbound frame because its signature did not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// Validator rejected an inbound frame because its timestamp is too old.
    #[error("frame is stale (older than the freshness window)")]
    StaleFrame,

    /// Validator rejected an inbound frame because its message id was seen before.
    #[error("message id {0} is a replay")]
    Replay(String),

    /// RateLimiter denied admission.
    #[error("rate limit exceeded for category {category}")]
    RateLimited { category: String },

    /// Router could not map a tool name to a capability.
    #[error("unsupported tool: {0}")]
    UnsupportedTool(String),

    /// A request went unanswered past its correlation deadline.
    #[error("request {0} timed out waiting for a response")]
    RequestTimedOut(String),

    /// ContextTranslator could not produce a valid shape in either direction.
    #[error("translation failed: {0}")]
    Translation(String),

    /// Configuration could not be parsed or was internally inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The durable queue could not persist to stable storage.
    #[error("queue persistence failed for peer {peer}: {reason}")]
    QueuePersistence { peer: String, reason: String },

    /// A message was already older than the queue's max-age at enqueue/send
    /// time and was dropped rather than queued (spec.md §4.1 outcome (c)).
    #[error("message {0} is older than the queue's max age and was dropped")]
    MessageExpired(String),
}

impl BridgeError {
    /// Maps this error onto the closed wire-level error taxonomy (spec.md §6/§7).
    pub fn to_error_payload(&self) -> ErrorPayload {
        use BridgeError::*;
        match self {
            SchemaViolation(_) | BadSignature | StaleFrame | Replay(_) => {
                ErrorPayload::new("validation_failure", self.to_string(), true)
            }
            UnsupportedTool(_) => ErrorPayload::new("unsupported_tool", self.to_string(), true),
            RateLimited { .. } => {
                ErrorPayload::new("rate_limit_exceeded", self.to_string(), true)
            }
            RequestTimedOut(_) => ErrorPayload::new("timeout", self.to_string(), true),
            ConnectionClosed { .. } | Handshake { .. } => {
                ErrorPayload::new("connection_failure", self.to_string(), true)
            }
            Framing(_) | Codec(_) => {
                ErrorPayload::new("invalid_json", self.to_string(), true)
            }
            Io(_) | QueuePersistence { .. } | Config(_) => {
                ErrorPayload::new("communication_failure", self.to_string(), false)
            }
            Translation(_) => ErrorPayload::new("general_error", self.to_string(), true),
            MessageExpired(_) => ErrorPayload::new("general_error", self.to_string(), false),
        }
    }

    /// Whether this failure is one of the two conditions spec.md §7 names as fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::QueuePersistence { .. })
    }
}
