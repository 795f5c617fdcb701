//! Code for the worker binary.

pub mod config;
pub mod dispatcher;
pub mod executor;

use anyhow::{Context as _, Result};
use config::Config;
use crucible_store::Store;
use dispatcher::Dispatcher;
use executor::Executor;
use slog::{info, Logger};
use std::{process, sync::Arc};
use tokio::{sync::watch, task};

pub fn main(config: Config, log: Logger) -> Result<()> {
    main_inner(config, log)
}

#[tokio::main]
async fn main_inner(config: Config, log: Logger) -> Result<()> {
    info!(log, "started"; "config" => ?config, "pid" => process::id());

    tokio::fs::create_dir_all(&config.jobs_root)
        .await
        .with_context(|| format!("creating jobs root {}", config.jobs_root.display()))?;

    let store = Store::connect(&config.redis(), &log).await?;
    let executor = Arc::new(Executor::new(
        store.clone(),
        config.jobs_root.clone(),
        config.config_dir.clone(),
        config.launcher.clone(),
        config.result_ttl(),
        config.cache_ttl(),
        log.clone(),
    )?);
    let dispatcher = Dispatcher::new(store, executor, config.concurrency, log.clone());

    let (shutdown_sender, shutdown_receiver) = watch::channel(false);
    task::spawn(wait_for_signal(shutdown_sender, log.clone()));

    dispatcher.run(shutdown_receiver).await;
    info!(log, "shut down");
    Ok(())
}

async fn wait_for_signal(sender: watch::Sender<bool>, log: Logger) {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!(log, "shutdown signal received");
    let _ = sender.send(true);
}
