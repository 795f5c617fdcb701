//! The crucible submission API server.

pub mod config;
pub mod handlers;
mod server;

use anyhow::Result;
use config::Config;
use crucible_store::Store;
use handlers::Api;
use slog::{info, Logger};
use std::{process, sync::Arc};

pub fn main(config: Config, log: Logger) -> Result<()> {
    main_inner(config, log)
}

#[tokio::main]
async fn main_inner(config: Config, log: Logger) -> Result<()> {
    info!(log, "started"; "config" => ?config, "pid" => process::id());
    let store = Store::connect(&config.redis(), &log).await?;
    let api = Arc::new(Api::new(store, config.api_options(), log.clone()));
    server::serve(api, config.listen_addr, log).await
}
