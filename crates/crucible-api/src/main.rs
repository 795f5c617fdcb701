use anyhow::Result;
use clap::Parser as _;
use crucible_api::config::Config;
use crucible_util::log::with_logger;

fn main() -> Result<()> {
    let config = Config::parse();
    with_logger(config.log_level, |log| crucible_api::main(config, log))
}
