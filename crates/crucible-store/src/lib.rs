//! The Redis layer. One `Store` value is shared (cloned) by every concurrent
//! user; `redis::aio::ConnectionManager` multiplexes and reconnects under it.
//!
//! Queue entries are whole [`Job`] records, so enqueue is a single LPUSH and
//! a worker that crashes after popping orphans nothing beyond the TTLs. The
//! BRPOP on the other end is atomic, which is what keeps any job id from
//! running on two workers at once.

pub mod keys;

use anyhow::{Context as _, Result};
use crucible_base::{Job, JobId, JobResult, StatusRecord};
use crucible_util::config::Password;
use redis::{aio::ConnectionManager, AsyncCommands as _, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use slog::{debug, o, Logger};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<Password>,
}

impl ConnectOptions {
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                password: self.password.as_ref().map(|p| p.expose().to_owned()),
                ..Default::default()
            },
        }
    }
}

/// The outcome of bumping a caller's rate-limit counter. The decision rule is
/// "reject if the pre-increment value had already reached the max", so
/// concurrent callers can overshoot by at most their own count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Counter value after this increment.
    pub count: u64,
    pub max: u64,
}

impl RateLimitDecision {
    pub fn rejected(&self) -> bool {
        self.count > self.max
    }
}

#[derive(Clone)]
pub struct Store {
    con: ConnectionManager,
    log: Logger,
}

impl Store {
    pub async fn connect(options: &ConnectOptions, log: &Logger) -> Result<Self> {
        let client = Client::open(options.connection_info())?;
        let con = ConnectionManager::new(client)
            .await
            .with_context(|| format!("connecting to redis at {}:{}", options.host, options.port))?;
        Ok(Self {
            con,
            log: log.new(o!("host" => options.host.clone(), "port" => options.port)),
        })
    }

    /*
     *  queue
     */

    pub async fn enqueue(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut con = self.con.clone();
        let _: () = con.lpush(keys::QUEUE, payload).await?;
        debug!(self.log, "enqueued job"; "job_id" => %job.id);
        Ok(())
    }

    /// Block up to `timeout` for the next job. `None` means the poll timed
    /// out; callers loop.
    pub async fn pop_job(&self, timeout: Duration) -> Result<Option<Job>> {
        let mut con = self.con.clone();
        let popped: Option<(String, String)> =
            con.brpop(keys::QUEUE, timeout.as_secs_f64()).await?;
        match popped {
            Some((_, payload)) => {
                let job: Job = serde_json::from_str(&payload).context("decoding queue entry")?;
                debug!(self.log, "popped job"; "job_id" => %job.id);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /*
     *  status and results
     */

    pub async fn put_status(&self, id: &JobId, record: &StatusRecord, ttl: Duration) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con
            .set_ex(keys::status(id), serde_json::to_string(record)?, ttl.as_secs())
            .await?;
        Ok(())
    }

    pub async fn get_status(&self, id: &JobId) -> Result<Option<StatusRecord>> {
        let mut con = self.con.clone();
        let payload: Option<String> = con.get(keys::status(id)).await?;
        payload
            .map(|p| serde_json::from_str(&p).context("decoding status record"))
            .transpose()
    }

    pub async fn delete_status(&self, id: &JobId) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.del(keys::status(id)).await?;
        Ok(())
    }

    pub async fn put_result(&self, id: &JobId, result: &JobResult, ttl: Duration) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con
            .set_ex(keys::result(id), serde_json::to_string(result)?, ttl.as_secs())
            .await?;
        Ok(())
    }

    pub async fn get_result(&self, id: &JobId) -> Result<Option<JobResult>> {
        let mut con = self.con.clone();
        let payload: Option<String> = con.get(keys::result(id)).await?;
        payload
            .map(|p| serde_json::from_str(&p).context("decoding result record"))
            .transpose()
    }

    /*
     *  cache
     */

    pub async fn cache_get(&self, fingerprint: &str) -> Result<Option<JobResult>> {
        let mut con = self.con.clone();
        let payload: Option<String> = con.get(keys::cache(fingerprint)).await?;
        payload
            .map(|p| serde_json::from_str(&p).context("decoding cache entry"))
            .transpose()
    }

    /// Concurrent writers of the same fingerprint are fine: the values are
    /// semantically equivalent, last write wins.
    pub async fn cache_put(&self, fingerprint: &str, result: &JobResult, ttl: Duration) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con
            .set_ex(keys::cache(fingerprint), serde_json::to_string(result)?, ttl.as_secs())
            .await?;
        Ok(())
    }

    /*
     *  rate limiting
     */

    /// INCR-then-check. The window's expiry is set only on the 0 -> 1
    /// transition so later hits in the window don't push it out.
    pub async fn rate_limit_hit(
        &self,
        fingerprint: &str,
        window: Duration,
        max: u64,
    ) -> Result<RateLimitDecision> {
        let key = keys::rate_limit(fingerprint);
        let mut con = self.con.clone();
        let count: u64 = con.incr(&key, 1u64).await?;
        if count == 1 {
            let _: () = con.expire(&key, window.as_secs() as i64).await?;
        }
        Ok(RateLimitDecision { count, max })
    }
}
