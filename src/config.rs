// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `BridgeConfig`: the single record threaded through every constructor.
//! No module holds its own copy of global state; everything reachable here
//! is passed in, per the re-architecture note against source-style globals.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// One rate-limiting bucket's shape (spec §6 `rateLimits` values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_minute: u32,
}

/// The closed configuration surface named in spec §6, as a plain
/// serializable record with defaults matching the stated timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    pub listen_port: u16,
    pub external_peer_endpoint: String,
    pub internal_peer_endpoint: String,
    pub preferred_version: String,
    pub idle_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub handshake_timeout_seconds: u64,
    pub queue_max_age_seconds: u64,
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub health_check_interval_seconds: u64,
    pub context_sync_interval_seconds: u64,
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    pub tool_name_map: BTreeMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let mut rate_limits = BTreeMap::new();
        rate_limits.insert(
            "default".to_string(),
            RateLimitConfig { capacity: 60, refill_per_minute: 60 },
        );
        rate_limits.insert(
            "heavy".to_string(),
            RateLimitConfig { capacity: 5, refill_per_minute: 5 },
        );
        rate_limits.insert(
            "lightweight".to_string(),
            RateLimitConfig { capacity: 120, refill_per_minute: 120 },
        );

        Self {
            listen_port: 8765,
            external_peer_endpoint: "ws://127.0.0.1:9001".to_string(),
            internal_peer_endpoint: "ws://127.0.0.1:9002".to_string(),
            preferred_version: "1.0".to_string(),
            idle_timeout_seconds: 5,
            request_timeout_seconds: 30,
            handshake_timeout_seconds: 5,
            queue_max_age_seconds: 3600,
            backoff_base_ms: 1000,
            backoff_ceiling_ms: 30_000,
            health_check_interval_seconds: 30,
            context_sync_interval_seconds: 60,
            rate_limits,
            tool_name_map: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Loads a TOML file and merges it over [`BridgeConfig::default`].
    /// An unknown key is a hard error rather than a silent no-op.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))
    }

    /// Applies CLI overrides (highest precedence) onto a loaded config.
    pub fn apply_cli_overrides(mut self, opt: &Opt) -> Self {
        if let Some(port) = opt.listen_port {
            self.listen_port = port;
        }
        if let Some(endpoint) = &opt.external_endpoint {
            self.external_peer_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &opt.internal_endpoint {
            self.internal_peer_endpoint = endpoint.clone();
        }
        self
    }

    pub fn rate_limit(&self, category: &str) -> RateLimitConfig {
        self.rate_limits
            .get(category)
            .copied()
            .unwrap_or(RateLimitConfig { capacity: 60, refill_per_minute: 60 })
    }
}

/// CLI surface (spec's `argparse` equivalent, Rust-native via `clap`).
/// CLI flags override the config file, which overrides built-in defaults.
#[derive(Debug, Parser)]
#[command(name = "qhp-bridge", about = "Bidirectional MCP protocol bridge")]
pub struct Opt {
    /// TOML config file merged over the built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub listen_port: Option<u16>,

    #[arg(long)]
    pub external_endpoint: Option<String>,

    #[arg(long)]
    pub internal_endpoint: Option<String>,

    /// Directory for rotating log files; stdout logging when unset.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

impl Opt {
    /// Resolves the final [`BridgeConfig`]: defaults, then config file (if
    /// any), then CLI overrides.
    pub fn resolve_config(&self) -> Result<BridgeConfig> {
        let base = match &self.config {
            Some(path) => BridgeConfig::from_file(path)?,
            None => BridgeConfig::default(),
        };
        Ok(base.apply_cli_overrides(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_timeouts() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.idle_timeout_seconds, 5);
        assert_eq!(cfg.request_timeout_seconds, 30);
        assert_eq!(cfg.handshake_timeout_seconds, 5);
        assert_eq!(cfg.queue_max_age_seconds, 3600);
        assert_eq!(cfg.backoff_base_ms, 1000);
        assert_eq!(cfg.backoff_ceiling_ms, 30_000);
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let opt = Opt {
            config: None,
            listen_port: Some(9999),
            external_endpoint: None,
            internal_endpoint: None,
            log_dir: None,
            verbose: false,
        };
        let cfg = opt.resolve_config().unwrap();
        assert_eq!(cfg.listen_port, 9999);
    }

    #[test]
    fn unknown_toml_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not_a_real_field = 1\n").unwrap();
        assert!(BridgeConfig::from_file(&path).is_err());
    }
}
