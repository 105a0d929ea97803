// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Wire codec: encodes/decodes [`Frame`]s as JSON text over a websocket
//! frame. Binary framing is out of scope (spec §6).

use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{BridgeError, Result};
use crate::message::Frame;

/// Encode/decode contract between a [`Frame`] and a transport-level websocket
/// message. Kept as a trait — rather than a bare function pair — so tests
/// can substitute a recording codec without touching `PeerConnection`.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<WsMessage>;
    fn decode(&self, msg: WsMessage) -> Result<Option<Frame>>;
}

/// The only codec this bridge ships: JSON text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTextCodec;

impl MessageCodec for JsonTextCodec {
    fn encode(&self, frame: &Frame) -> Result<WsMessage> {
        let text = serde_json::to_string(frame)?;
        Ok(WsMessage::Text(text))
    }

    fn decode(&self, msg: WsMessage) -> Result<Option<Frame>> {
        match msg {
            WsMessage::Text(text) => {
                let frame = serde_json::from_str(&text)
                    .map_err(|e| BridgeError::Framing(format!("invalid frame JSON: {e}")))?;
                Ok(Some(frame))
            }
            WsMessage::Binary(_) => Err(BridgeError::Framing(
                "binary frames are not supported".to_string(),
            )),
            WsMessage::Ping(_) | WsMessage::Pong(_) => Ok(None),
            WsMessage::Close(_) => Ok(None),
            WsMessage::Frame(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Context, Kind};
    use serde_json::json;

    #[test]
    fn round_trips_a_request_frame() {
        let codec = JsonTextCodec;
        let ctx = Context::system("test_op");
        let frame = Frame::new(Kind::Request, "req-1")
            .with_content(json!({"ok": true}))
            .with_context(ctx);

        let encoded = codec.encode(&frame).unwrap();
        let decoded = codec.decode(encoded).unwrap().expect("a frame");
        assert_eq!(decoded.id, "req-1");
        assert_eq!(decoded.kind, Kind::Request);
    }

    #[test]
    fn rejects_binary_frames() {
        let codec = JsonTextCodec;
        let result = codec.decode(WsMessage::Binary(vec![1, 2, 3]));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_json_is_a_framing_error() {
        let codec = JsonTextCodec;
        let result = codec.decode(WsMessage::Text("{not json".to_string()));
        assert_matches::assert_matches!(result, Err(BridgeError::Framing(_)));
    }
}
