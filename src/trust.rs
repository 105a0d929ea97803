// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `TrustTable`: established-peer fingerprints and session keys, expired by
//! a background sweep (spec §3 "TrustTable").

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::info;

/// One established peer's trust record.
#[derive(Debug, Clone)]
pub struct TrustEntry {
    pub fingerprint: Vec<u8>,
    pub session_key: Vec<u8>,
    pub established_at: Instant,
}

/// Protected by a single mutex; reads dominate (spec §5 shared-state list).
pub struct TrustTable {
    entries: Mutex<BTreeMap<String, TrustEntry>>,
    ttl: Duration,
}

impl std::fmt::Debug for TrustTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustTable").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl TrustTable {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(BTreeMap::new()), ttl }
    }

    pub async fn record(&self, peer_name: impl Into<String>, fingerprint: Vec<u8>, session_key: Vec<u8>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            peer_name.into(),
            TrustEntry { fingerprint, session_key, established_at: Instant::now() },
        );
    }

    /// Returns the trust entry iff it exists and has not expired; an
    /// expired entry is removed and forces re-handshake on next use.
    pub async fn get(&self, peer_name: &str) -> Option<TrustEntry> {
        let mut entries = self.entries.lock().await;
        match entries.get(peer_name) {
            Some(entry) if entry.established_at.elapsed() <= self.ttl => Some(entry.clone()),
            Some(_) => {
                entries.remove(peer_name);
                None
            }
            None => None,
        }
    }

    /// Background sweep: removes every entry older than `ttl`.
    pub async fn sweep_expired(&self) {
        let mut entries = self.entries.lock().await;
        let ttl = self.ttl;
        entries.retain(|peer, entry| {
            let alive = entry.established_at.elapsed() <= ttl;
            if !alive {
                info!(peer, "trust entry expired, re-handshake required");
            }
            alive
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_entry_is_retrievable() {
        let table = TrustTable::new(Duration::from_secs(60));
        table.record("peer-i", vec![1, 2, 3], vec![4, 5, 6]).await;
        assert!(table.get("peer-i").await.is_some());
    }

    #[tokio::test]
    async fn expired_entry_forces_rehandshake() {
        let table = TrustTable::new(Duration::from_millis(1));
        table.record("peer-i", vec![1], vec![2]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(table.get("peer-i").await.is_none());
    }
}
