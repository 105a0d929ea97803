// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Wire-level message shapes: the closed kind enum, the seven-dimensional
//! context envelope, and the error payload carried inside an `error` frame.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A globally-unique message identifier.
pub type MsgId = String;

/// The closed set of frame kinds recognised on the wire.
///
/// `Command` is a supplemented kind (monitoring status/reconnect/sync) that
/// sits alongside the closed protocol set rather than inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    QhpHandshake,
    QhpHandshakeResponse,
    QhpHandshakeAck,
    VersionNegotiation,
    VersionNegotiationResponse,
    Request,
    Response,
    Error,
    Context,
    Ping,
    Pong,
    Command,
}

/// The seven-dimensional context envelope that accompanies every internal
/// message. Contexts are immutable; derive a new one with [`Context::derive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub who: String,
    pub what: String,
    /// Wall-clock instant, seconds since epoch.
    pub when: f64,
    #[serde(rename = "where")]
    pub where_: String,
    pub why: String,
    pub how: String,
    pub extent: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Context {
    /// A context for internally-generated messages (context-sync heartbeats,
    /// synthetic errors) that has no originating external request.
    pub fn system(what: impl Into<String>) -> Self {
        Self {
            who: "System".to_string(),
            what: what.into(),
            when: wall_now_secs(),
            where_: "bridge".to_string(),
            why: format!("operation_{}", "system"),
            how: "bridge".to_string(),
            extent: "single".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    /// Copy-with-overrides derivation; the spec requires contexts to be
    /// immutable and produced only by derivation, never in-place mutation.
    pub fn derive(&self) -> ContextBuilder {
        ContextBuilder { base: self.clone() }
    }

    /// Invariant check: every message crossing the bridge must carry a
    /// non-empty `who`, `what`, and `when`.
    pub fn is_well_formed(&self) -> bool {
        !self.who.is_empty() && !self.what.is_empty() && self.when > 0.0
    }
}

/// Builder returned by [`Context::derive`] for copy-with-overrides updates.
#[derive(Debug)]
pub struct ContextBuilder {
    base: Context,
}

impl ContextBuilder {
    pub fn who(mut self, who: impl Into<String>) -> Self {
        self.base.who = who.into();
        self
    }

    pub fn what(mut self, what: impl Into<String>) -> Self {
        self.base.what = what.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.base.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Context {
        self.base
    }
}

/// Returns the current wall-clock time as fractional seconds since epoch.
pub fn wall_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Signature/freshness/replay metadata attached by the Validator to every
/// outbound frame, and checked on every inbound frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    pub message_id: String,
    pub timestamp: f64,
    pub signature: String,
}

/// The structured failure payload carried inside an `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
    pub error_type: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl ErrorPayload {
    pub fn new(error_type: impl Into<String>, error: impl Into<String>, recoverable: bool) -> Self {
        Self {
            error: error.into(),
            error_type: error_type.into(),
            recoverable,
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }
}

/// The single wire frame shape shared by every socket (spec §6): required
/// `kind`/`id`, everything else optional depending on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub kind: Kind,
    pub id: MsgId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FrameMeta>,
}

impl Frame {
    pub fn new(kind: Kind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            content: None,
            context: None,
            correlation_id: None,
            meta: None,
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// The immutable internal message record (spec §3). `id` is globally unique;
/// `correlation_id` links a response back to its originating request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MsgId,
    pub kind: Kind,
    pub payload: Value,
    pub context: Context,
    /// Wall-clock component of the timestamp; the monotonic component lives
    /// only in-process (see [`Message::received_at`] callers) and is never
    /// serialized onto the wire.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, kind: Kind, payload: Value, context: Context) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            context,
            timestamp: wall_now_secs(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}
