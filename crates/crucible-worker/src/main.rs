use anyhow::Result;
use clap::Parser as _;
use crucible_util::log::with_logger;
use crucible_worker::config::Config;

fn main() -> Result<()> {
    let config = Config::parse();
    with_logger(config.log_level, |log| crucible_worker::main(config, log))
}
