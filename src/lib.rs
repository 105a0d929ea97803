// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! A bidirectional protocol bridge between an external tool-style MCP
//! endpoint and an internal seven-dimensional-context MCP endpoint.
//!
//! See [`Bridge`] for the assembled runtime; the individual modules
//! (`codec`, `translator`, `queue`, `ratelimit`, `validator`, `handshake`,
//! `peer`, `router`, `acceptor`, `supervisor`) are the components spec'd
//! independently and composed here.

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations, unreachable_pub)]

pub mod acceptor;
pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod log;
pub mod message;
pub mod peer;
pub mod queue;
pub mod ratelimit;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod translator;
pub mod trust;
pub mod validator;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

pub use error::{BridgeError, Result};

use crate::acceptor::AcceptorServer;
use crate::config::BridgeConfig;
use crate::peer::PeerConnection;
use crate::router::Router;
use crate::supervisor::Supervisor;
use crate::translator::CompressionStatsHandle;
use crate::trust::TrustTable;
use crate::validator::Validator;

/// The assembled runtime: every component wired together from one
/// [`BridgeConfig`], with no global state (spec §9).
pub struct Bridge {
    config: BridgeConfig,
    router: Arc<Router>,
    acceptor: Arc<AcceptorServer>,
    supervisor: Arc<Supervisor>,
    fatal_rx: mpsc::Receiver<BridgeError>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Bridge {
    /// Constructs every component. Does not bind the listener or dial peers;
    /// call [`Bridge::run`] to start the runtime.
    pub async fn new(config: BridgeConfig, queue_dir: PathBuf) -> Result<Self> {
        let validator = Arc::new(Validator::with_random_key());
        let trust = Arc::new(TrustTable::new(std::time::Duration::from_secs(
            config.queue_max_age_seconds,
        )));

        let (peer_i_tx, mut peer_i_rx) = mpsc::channel(1024);
        let (peer_e_tx, mut peer_e_rx) = mpsc::channel(1024);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);

        let peer_i = Arc::new(
            PeerConnection::new(
                "I",
                config.internal_peer_endpoint.clone(),
                &config,
                queue_dir.clone(),
                Arc::clone(&trust),
                Arc::clone(&validator),
                peer_i_tx,
                fatal_tx.clone(),
            )
            .await?,
        );
        let peer_e = Arc::new(
            PeerConnection::new(
                "E",
                config.external_peer_endpoint.clone(),
                &config,
                queue_dir,
                Arc::clone(&trust),
                Arc::clone(&validator),
                peer_e_tx,
                fatal_tx,
            )
            .await?,
        );

        let router = Arc::new(Router::new(config.clone(), Arc::clone(&validator), Arc::clone(&peer_i)));

        {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                while let Some(message) = peer_i_rx.recv().await {
                    router.handle_peer_i_message(message).await;
                }
            });
        }
        // Inbound messages from the E peer connection (context-sync heartbeats,
        // out-of-band traffic) are informational; they are observed but do not
        // enter the request/response correlation path (spec §4.4 is written
        // entirely in terms of PeerLink(I)).
        tokio::spawn(async move { while peer_e_rx.recv().await.is_some() {} });

        let compression_stats = CompressionStatsHandle::default();
        let acceptor = Arc::new(AcceptorServer::new(Arc::clone(&router), &config, compression_stats));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&router),
            Arc::clone(&peer_e),
            Arc::clone(&peer_i),
            trust,
            &config,
        ));

        Ok(Self { config, router, acceptor, supervisor, fatal_rx })
    }

    /// Binds the listen port (failing fast if unavailable), probes both
    /// peer endpoints, and starts the supervisor loops and accept loop. Runs
    /// until `shutdown_signal` resolves, or returns `Err` early if a peer
    /// reports one of the two fatal conditions named in spec.md §7 (the
    /// other — an unavailable listen port — is already surfaced above, by
    /// `AcceptorServer::bind`).
    pub async fn run(mut self, shutdown_signal: impl std::future::Future<Output = ()>) -> Result<()> {
        let listener = AcceptorServer::bind(self.config.listen_port).await?;

        self.supervisor.probe_startup_reachability().await;
        self.supervisor.spawn_loops();

        let acceptor = Arc::clone(&self.acceptor);
        let accept_handle = tokio::spawn(async move { acceptor.run(listener).await });

        let outcome = tokio::select! {
            () = shutdown_signal => Ok(()),
            Some(fatal) = self.fatal_rx.recv() => Err(fatal),
        };

        self.supervisor.shutdown().await;
        accept_handle.abort();
        outcome
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}
