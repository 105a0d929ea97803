// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Translation between the external tool-call shape and the internal 7D
//! context envelope (spec §4.3).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::message::{wall_now_secs, Context, Kind, Message};

/// A request as received from an E-side Session, before translation.
#[derive(Debug, Clone)]
pub struct ExternalRequest {
    pub name: String,
    pub parameters: Value,
    pub id: String,
    pub user_context: BTreeMap<String, Value>,
}

/// A response ready to hand back to an E-side Session.
#[derive(Debug, Clone)]
pub struct ExternalResponse {
    pub id: String,
    pub result: Value,
    pub metadata: Value,
}

/// Converts between E's request/response shape and I's 7D envelope.
///
/// The `toolNameMap` is a closed, configuration-enumerated lookup; names
/// absent from it translate to `what = "unknown_operation"`, which the
/// Router rejects upstream rather than forwarding.
#[derive(Debug, Clone)]
pub struct ContextTranslator {
    tool_name_map: BTreeMap<String, String>,
    seq: std::sync::Arc<AtomicU64>,
}

/// Statistics exposed by the `compress`/`decompress` stub so the monitoring
/// `status` command has something real to report.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CompressionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub calls: u64,
}

impl ContextTranslator {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            tool_name_map: config.tool_name_map.clone(),
            seq: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// Looks up `name` in the tool map; `None` means the name is unknown and
    /// must be rejected as `unsupported_tool` before translation proceeds.
    pub fn lookup_capability(&self, name: &str) -> Option<&str> {
        self.tool_name_map.get(name).map(String::as_str)
    }

    /// external → internal (spec §4.3 "To-internal rules").
    pub fn to_internal(&self, req: &ExternalRequest) -> Result<Message> {
        let uc = &req.user_context;

        let who = string_field(uc, "identity")
            .or_else(|| string_field(uc, "user"))
            .unwrap_or_else(|| "System".to_string());

        let what = string_field(uc, "operation")
            .or_else(|| string_field(uc, "type"))
            .or_else(|| self.lookup_capability(&req.name).map(str::to_string))
            .unwrap_or_else(|| "unknown_operation".to_string());

        let when = uc
            .get("timestamp")
            .and_then(Value::as_f64)
            .map(normalize_timestamp)
            .unwrap_or_else(wall_now_secs);

        let where_ = derive_where(&req.parameters)
            .or_else(|| string_field(uc, "location"))
            .unwrap_or_else(|| "bridge".to_string());

        let why = string_field(uc, "purpose").unwrap_or_else(|| format!("operation_{}", req.name));

        let how = string_field(uc, "method").unwrap_or_else(|| "bridge".to_string());

        let extent = string_field(uc, "scope").unwrap_or_else(|| {
            if has_list_or_page_params(&req.parameters) {
                "multiple".to_string()
            } else {
                "single".to_string()
            }
        });

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "originalRequest".to_string(),
            json!({ "name": req.name, "parameters": req.parameters, "id": req.id }),
        );

        let context = Context { who, what, when, where_, why, how, extent, metadata };
        if !context.is_well_formed() {
            return Err(BridgeError::Translation(
                "derived context is missing who/what/when".to_string(),
            ));
        }

        Ok(Message::new(req.id.clone(), Kind::Request, req.parameters.clone(), context))
    }

    /// internal → external (spec §4.3 "To-external rules").
    pub fn to_external(&self, msg: &Message, protocol_version: &str) -> Result<ExternalResponse> {
        let result = match &msg.payload {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed) => parsed,
                Err(_) => json!({ "content": s }),
            },
            other => other.clone(),
        };

        let metadata = json!({
            "who": msg.context.who,
            "what": msg.context.what,
            "when": msg.context.when,
            "where": msg.context.where_,
            "why": msg.context.why,
            "how": msg.context.how,
            "extent": msg.context.extent,
            "protocolVersion": protocol_version,
        });

        Ok(ExternalResponse { id: msg.id.clone(), result, metadata })
    }

    /// Opaque pass-through compression hook over the `when` field (Open
    /// Question 2): true round-trip, no actual size reduction. `level` is
    /// accepted for shape parity with the monitoring `status` report and is
    /// otherwise unused.
    pub fn compress(&self, when: f64, _level: u8, stats: &CompressionStatsHandle) -> String {
        let encoded = when.to_bits().to_string();
        stats.record(encoded.len() as u64, encoded.len() as u64);
        self.seq.fetch_add(1, Ordering::Relaxed);
        encoded
    }

    pub fn decompress(&self, encoded: &str, stats: &CompressionStatsHandle) -> Result<f64> {
        let bits: u64 = encoded
            .parse()
            .map_err(|_| BridgeError::Translation(format!("bad compressed when: {encoded}")))?;
        stats.record(encoded.len() as u64, encoded.len() as u64);
        Ok(f64::from_bits(bits))
    }
}

/// Shared, cheaply-cloneable handle for accumulating [`CompressionStats`].
#[derive(Debug, Clone, Default)]
pub struct CompressionStatsHandle(std::sync::Arc<std::sync::Mutex<CompressionStats>>);

impl CompressionStatsHandle {
    fn record(&self, bytes_in: u64, bytes_out: u64) {
        let mut stats = self.0.lock().expect("compression stats mutex poisoned");
        stats.bytes_in += bytes_in;
        stats.bytes_out += bytes_out;
        stats.calls += 1;
    }

    pub fn snapshot(&self) -> CompressionStats {
        self.0.lock().expect("compression stats mutex poisoned").clone()
    }
}

fn string_field(map: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Milliseconds-since-epoch values are normalized to seconds; anything at or
/// below 10^10 is already in seconds.
fn normalize_timestamp(value: f64) -> f64 {
    if value > 1e10 {
        value / 1000.0
    } else {
        value
    }
}

fn derive_where(params: &Value) -> Option<String> {
    params.get("path").and_then(Value::as_str).map(str::to_string)
}

fn has_list_or_page_params(params: &Value) -> bool {
    params.get("list").is_some() || params.get("page").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> ContextTranslator {
        let mut config = BridgeConfig::default();
        config.tool_name_map.insert("search".to_string(), "search_operation".to_string());
        ContextTranslator::new(&config)
    }

    #[test]
    fn unmapped_tool_yields_unknown_operation() {
        let t = translator();
        let req = ExternalRequest {
            name: "nonexistent_tool".to_string(),
            parameters: json!({}),
            id: "r1".to_string(),
            user_context: BTreeMap::new(),
        };
        let msg = t.to_internal(&req).unwrap();
        assert_eq!(msg.context.what, "unknown_operation");
    }

    #[test]
    fn mapped_tool_name_becomes_what() {
        let t = translator();
        let req = ExternalRequest {
            name: "search".to_string(),
            parameters: json!({}),
            id: "r2".to_string(),
            user_context: BTreeMap::new(),
        };
        let msg = t.to_internal(&req).unwrap();
        assert_eq!(msg.context.what, "search_operation");
    }

    #[test]
    fn explicit_operation_overrides_tool_map() {
        let t = translator();
        let mut uc = BTreeMap::new();
        uc.insert("operation".to_string(), json!("explicit_op"));
        let req = ExternalRequest {
            name: "search".to_string(),
            parameters: json!({}),
            id: "r3".to_string(),
            user_context: uc,
        };
        let msg = t.to_internal(&req).unwrap();
        assert_eq!(msg.context.what, "explicit_op");
    }

    #[test]
    fn millisecond_timestamps_are_normalized() {
        let t = translator();
        let mut uc = BTreeMap::new();
        uc.insert("timestamp".to_string(), json!(1_700_000_000_000_f64));
        let req = ExternalRequest {
            name: "search".to_string(),
            parameters: json!({}),
            id: "r4".to_string(),
            user_context: uc,
        };
        let msg = t.to_internal(&req).unwrap();
        assert!((msg.context.when - 1_700_000_000.0).abs() < 1.0);
    }

    #[test]
    fn round_trip_preserves_seven_dimensions() {
        let t = translator();
        let mut uc = BTreeMap::new();
        uc.insert("user".to_string(), json!("alice"));
        uc.insert("purpose".to_string(), json!("debugging"));
        let req = ExternalRequest {
            name: "search".to_string(),
            parameters: json!({"query": "foo"}),
            id: "r5".to_string(),
            user_context: uc,
        };
        let internal = t.to_internal(&req).unwrap();
        let external = t.to_external(&internal, "1.0").unwrap();
        let internal_again = t
            .to_internal(&ExternalRequest {
                name: req.name.clone(),
                parameters: external.result,
                id: req.id.clone(),
                user_context: req.user_context.clone(),
            })
            .unwrap();
        assert_eq!(internal.context.who, internal_again.context.who);
        assert_eq!(internal.context.what, internal_again.context.what);
    }

    #[test]
    fn compression_round_trips() {
        let t = translator();
        let stats = CompressionStatsHandle::default();
        let encoded = t.compress(12345.6789, 3, &stats);
        let decoded = t.decompress(&encoded, &stats).unwrap();
        assert_eq!(decoded, 12345.6789);
        assert_eq!(stats.snapshot().calls, 2);
    }
}
