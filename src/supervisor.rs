// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `Supervisor`: drives the health, context-sync, and deadline-sweep loops,
//! and coordinates graceful shutdown (spec §4.8).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::config::BridgeConfig;
use crate::peer::{PeerConnection, PeerStatus};
use crate::router::Router;
use crate::trust::TrustTable;

/// Fixed deadline-sweep cadence (spec §4.8): distinct from the configurable
/// health and context-sync intervals.
const DEADLINE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period Sessions are given to drain on shutdown (spec §4.8).
const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    router: Arc<Router>,
    peer_e: Arc<PeerConnection>,
    peer_i: Arc<PeerConnection>,
    trust: Arc<TrustTable>,
    health_interval: Duration,
    context_sync_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("health_interval", &self.health_interval)
            .field("context_sync_interval", &self.context_sync_interval)
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        router: Arc<Router>,
        peer_e: Arc<PeerConnection>,
        peer_i: Arc<PeerConnection>,
        trust: Arc<TrustTable>,
        config: &BridgeConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            router,
            peer_e,
            peer_i,
            trust,
            health_interval: Duration::from_secs(config.health_check_interval_seconds),
            context_sync_interval: Duration::from_secs(config.context_sync_interval_seconds),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawns the three independent periodic loops and returns immediately;
    /// callers await [`Supervisor::shutdown`] to drive graceful stop.
    pub fn spawn_loops(self: &Arc<Self>) {
        self.spawn_health_loop();
        self.spawn_context_sync_loop();
        self.spawn_deadline_sweep_loop();
        self.spawn_trust_sweep_loop();
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = this.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(this.health_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.run_health_check().await,
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }

    #[tracing::instrument(skip(self))]
    async fn run_health_check(&self) {
        for peer in [&self.peer_e, &self.peer_i] {
            if peer.status().await != PeerStatus::Ready {
                info!(peer = %peer.peer_name, "health check: peer unreachable, reconnecting");
                let peer = Arc::clone(peer);
                tokio::spawn(async move { peer.connect().await });
            }
        }
    }

    fn spawn_context_sync_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = this.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(this.context_sync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.router.send_context_sync(&this.peer_e).await;
                        this.router.send_context_sync(&this.peer_i).await;
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }

    fn spawn_deadline_sweep_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = this.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(DEADLINE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.router.sweep_deadlines().await,
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }

    fn spawn_trust_sweep_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = this.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(this.health_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.trust.sweep_expired().await,
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                }
            }
        });
    }

    /// Probes both peer endpoints at startup (SPEC_FULL §5); non-fatal —
    /// the health loop retries if either isn't up yet.
    pub async fn probe_startup_reachability(&self) {
        for peer in [&self.peer_e, &self.peer_i] {
            let peer = Arc::clone(peer);
            tokio::spawn(async move { peer.connect().await });
        }
    }

    /// Cancels the three loops, notifies live E-side Sessions, waits out the
    /// drain grace period, then closes both PeerLinks. DurableQueues persist
    /// whatever remains.
    pub async fn shutdown(&self) {
        info!("graceful shutdown initiated");
        let _ = self.shutdown_tx.send(true);
        self.router.close_all_sessions().await;
        tokio::time::sleep(SHUTDOWN_DRAIN_GRACE).await;
        self.peer_e.close().await;
        self.peer_i.close().await;
        info!("graceful shutdown complete");
    }
}
