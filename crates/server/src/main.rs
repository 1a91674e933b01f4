use std::sync::Arc;

use anyhow::Result;
use server::{config, Collector, MemoryStore};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging and print header
    let _guard = shared::init(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
    print_header_info()?;

    // Load and validate configuration
    let settings = config::load_config()?;
    let settings = config::validate_settings(settings)?;

    let store = Arc::new(MemoryStore::new());
    let collector = Collector::bind(&settings.server, store)?;

    let shutdown = CancellationToken::new();
    let mut join_collector = tokio::spawn(collector.run(shutdown.clone()));

    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl + c received; shutting down...");
        }
        result = &mut join_collector => {
            warn!("collector stopped unexpectedly");
            return result?;
        }
    }

    shutdown.cancel();
    join_collector.await??;
    warn!("Collector stopped; exiting...");

    Ok(())
}

fn print_header_info() -> Result<()> {
    let bandwatch_official_build = option_env!("BANDWATCH_OFFICIAL_BUILD").unwrap_or("false").parse::<bool>()?;
    let cargo_pkg_name = env!("CARGO_PKG_NAME");
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");
    let vergen_git_describe = env!("VERGEN_GIT_DESCRIBE");
    let vergen_git_dirty = env!("VERGEN_GIT_DIRTY");
    let vergen_build_timestamp = env!("VERGEN_BUILD_TIMESTAMP");
    let vergen_cargo_target_triple = env!("VERGEN_CARGO_TARGET_TRIPLE");

    shared::print_header(
        bandwatch_official_build,
        cargo_pkg_name,
        cargo_pkg_version,
        vergen_git_describe,
        vergen_git_dirty,
        vergen_build_timestamp,
        vergen_cargo_target_triple,
    );

    Ok(())
}
