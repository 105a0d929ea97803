// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::Targets, fmt, prelude::*, registry};

/// Initialises the global tracing subscriber for the bridge.
///
/// Plain text to stdout when `log_dir` is `None`; non-blocking rotating file
/// output otherwise. The returned guard must be held for the life of the
/// process — dropping it early silently stops the file writer from flushing.
/// Must be called exactly once, before any other module logs.
pub fn init_bridge_logging(log_dir: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    let target_filter = Targets::new().with_target(current_crate_str(), tracing::Level::TRACE);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            println!("Starting logging to directory: {dir:?}");
            let file_appender = tracing_appender::rolling::daily(dir, "qhp-bridge.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(target_filter);

            registry().with(layer).init();
            Ok(Some(guard))
        }
        None => {
            println!("Starting logging to stdout");
            let layer = fmt::layer()
                .with_target(false)
                .with_filter(target_filter);

            registry().with(layer).init();
            Ok(None)
        }
    }
}

/// Root module name derived from `module_path!()`, e.g. `"qhp_bridge"`.
fn current_crate_str() -> &'static str {
    let m = module_path!();
    &m[..m.find(':').unwrap_or(m.len())]
}
