// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::collections::BTreeMap;

use proptest::prelude::*;
use qhp_bridge::config::BridgeConfig;
use qhp_bridge::translator::{ContextTranslator, ExternalRequest};
use serde_json::json;

fn request(name: &str, user_context: BTreeMap<String, serde_json::Value>) -> ExternalRequest {
    ExternalRequest { name: name.to_string(), parameters: json!({}), id: "id-1".to_string(), user_context }
}

#[test]
fn derived_context_is_well_formed() {
    let mut config = BridgeConfig::default();
    config.tool_name_map.insert("lookup".to_string(), "lookup_operation".to_string());
    let translator = ContextTranslator::new(&config);

    let msg = translator.to_internal(&request("lookup", BTreeMap::new())).unwrap();
    assert!(msg.context.is_well_formed());
}

#[test]
fn unknown_tool_without_explicit_operation_is_unknown_operation() {
    let config = BridgeConfig::default();
    let translator = ContextTranslator::new(&config);
    let msg = translator.to_internal(&request("not_in_map", BTreeMap::new())).unwrap();
    assert_eq!(msg.context.what, "unknown_operation");
}

proptest! {
    /// Round-trip law (spec §8): for every well-formed external request `x`,
    /// translating to internal and back preserves the seven named context
    /// dimensions across re-derivation.
    #[test]
    fn who_and_what_survive_a_to_internal_to_external_to_internal_round_trip(
        user in "[a-zA-Z0-9_]{1,12}",
        purpose in "[a-zA-Z0-9_]{1,12}",
    ) {
        let mut config = BridgeConfig::default();
        config.tool_name_map.insert("op".to_string(), "op_operation".to_string());
        let translator = ContextTranslator::new(&config);

        let mut uc = BTreeMap::new();
        uc.insert("user".to_string(), json!(user));
        uc.insert("purpose".to_string(), json!(purpose));

        let req = request("op", uc.clone());
        let internal = translator.to_internal(&req).unwrap();
        let external = translator.to_external(&internal, "1.0").unwrap();

        let round_tripped = translator
            .to_internal(&ExternalRequest {
                name: req.name,
                parameters: external.result,
                id: req.id,
                user_context: uc,
            })
            .unwrap();

        prop_assert_eq!(internal.context.who, round_tripped.context.who);
        prop_assert_eq!(internal.context.what, round_tripped.context.what);
    }
}
