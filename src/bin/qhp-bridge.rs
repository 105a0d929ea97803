// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use clap::Parser;
use eyre::Result;
use qhp_bridge::config::Opt;
use qhp_bridge::log::init_bridge_logging;
use qhp_bridge::Bridge;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let opt = Opt::parse();
    let _log_guard = init_bridge_logging(opt.log_dir.as_deref())?;

    let config = opt.resolve_config()?;
    info!(listen_port = config.listen_port, "starting qhp-bridge");

    let queue_dir = std::env::temp_dir().join("qhp-bridge-queues");
    let bridge = Bridge::new(config, queue_dir).await?;

    bridge
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
