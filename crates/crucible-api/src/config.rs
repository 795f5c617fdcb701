use clap::Parser;
use crucible_store::ConnectOptions;
use crucible_util::config::{LogLevel, Password};
use std::{net::SocketAddr, time::Duration};

#[derive(Parser, Debug)]
#[command(name = "crucible-api", version, about = "Crucible submission API server.")]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Redis host.
    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    /// Redis port.
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Redis password, if the server requires one.
    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<Password>,

    /// TTL for job status and result records, in seconds.
    #[arg(long, env = "RESULT_TTL_SECONDS", default_value_t = 300)]
    pub result_ttl_seconds: u64,

    /// Submissions allowed per caller per window.
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 10)]
    pub rate_limit_max: u64,

    /// Rate-limit window, in seconds.
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECONDS", default_value_t = 60)]
    pub rate_limit_window_seconds: u64,

    /// Whether cache hits consume rate-limit budget.
    #[arg(
        long,
        env = "RATE_LIMIT_CACHE_HITS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub rate_limit_cache_hits: bool,

    /// Minimum log level to output.
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

impl Config {
    pub fn redis(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.redis_host.clone(),
            port: self.redis_port,
            password: self.redis_password.clone(),
        }
    }

    pub fn api_options(&self) -> crate::handlers::ApiOptions {
        crate::handlers::ApiOptions {
            rate_limit_max: self.rate_limit_max,
            rate_limit_window: Duration::from_secs(self.rate_limit_window_seconds),
            rate_limit_cache_hits: self.rate_limit_cache_hits,
            result_ttl: Duration::from_secs(self.result_ttl_seconds),
        }
    }
}
