use clap::Parser;
use crucible_store::ConnectOptions;
use crucible_util::config::{LogLevel, Password};
use std::{path::PathBuf, time::Duration};

#[derive(Parser, Debug)]
#[command(name = "crucible-worker", version, about = "Crucible execution worker.")]
pub struct Config {
    /// Redis host.
    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    /// Redis port.
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Redis password, if the server requires one.
    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<Password>,

    /// Number of concurrent execution slots.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 4)]
    pub concurrency: usize,

    /// Directory under which per-job workspaces are created.
    #[arg(long, env = "SANDBOX_JOBS", default_value = "/var/lib/crucible/jobs")]
    pub jobs_root: PathBuf,

    /// Directory holding the per-language sandbox config templates.
    #[arg(long, env = "SANDBOX_CONFIG_DIR", default_value = "sandbox")]
    pub config_dir: PathBuf,

    /// The sandbox launcher binary.
    #[arg(long, env = "LAUNCHER_BIN", default_value = "/usr/local/bin/sandbox-launcher")]
    pub launcher: PathBuf,

    /// TTL for job status and result records, in seconds.
    #[arg(long, env = "RESULT_TTL_SECONDS", default_value_t = 300)]
    pub result_ttl_seconds: u64,

    /// TTL for cached results, in seconds.
    #[arg(long, env = "CACHE_TTL_SECONDS", default_value_t = 3600)]
    pub cache_ttl_seconds: u64,

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

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}
