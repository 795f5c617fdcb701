//! Key naming for every family the service stores. All cross-process state
//! lives under these keys; nothing else is written to Redis.

use crucible_base::JobId;

/// The FIFO job queue. Producers LPUSH the head; workers BRPOP the tail.
pub const QUEUE: &str = "queue:code-execution";

pub fn status(id: &JobId) -> String {
    format!("job:status:{id}")
}

pub fn result(id: &JobId) -> String {
    format!("job:result:{id}")
}

pub fn cache(fingerprint: &str) -> String {
    format!("cache:{fingerprint}")
}

pub fn rate_limit(fingerprint: &str) -> String {
    format!("ratelimit:{fingerprint}")
}
