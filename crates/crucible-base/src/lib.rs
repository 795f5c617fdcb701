//! Types shared between the submission API and the worker: jobs, statuses,
//! results, ids, and content fingerprints. Everything here crosses the Redis
//! boundary, so it is all serde-serializable and versioned by field presence.

pub mod languages;

use rand::RngCore as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

/// Maximum accepted source size, in bytes.
pub const MAX_CODE_LEN: usize = 65_536;

/// Per-stream cap on captured stdout/stderr, in bytes.
pub const MAX_OUTPUT_LEN: usize = 65_536;

/// Seconds since the Unix epoch.
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/*  _     _
 * (_) __| |___
 * | |/ _` / __|
 * | | (_| \__ \
 * |_|\__,_|___/
 *  FIGLET: ids
 */

const JOB_ID_PREFIX: &str = "job_";
const CACHED_ID_PREFIX: &str = "cached_";
const ID_TOKEN_BYTES: usize = 12;

fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(job_|cached_)[A-Za-z0-9._]+$").unwrap())
}

#[derive(Debug, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "invalid job id {:?}", _0)]
pub struct InvalidJobId(String);

impl std::error::Error for InvalidJobId {}

/// An opaque job identifier. `job_`-prefixed ids name queued jobs;
/// `cached_`-prefixed ids are minted for synchronous cache hits and never
/// appear in the queue or the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// A fresh queue-job id: `job_` plus 96 random bits, hex-encoded.
    pub fn generate() -> Self {
        Self(format!("{JOB_ID_PREFIX}{}", random_token()))
    }

    /// A fresh id for a result served straight from the cache.
    pub fn generate_cached() -> Self {
        Self(format!("{CACHED_ID_PREFIX}{}", random_token()))
    }

    pub fn parse(s: &str) -> Result<Self, InvalidJobId> {
        if job_id_pattern().is_match(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(InvalidJobId(s.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_cached(&self) -> bool {
        self.0.starts_with(CACHED_ID_PREFIX)
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; ID_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/*   __ _                                 _       _
 *  / _(_)_ __   __ _  ___ _ __ _ __  _ __(_)_ __ | |_ ___
 * | |_| | '_ \ / _` |/ _ \ '__| '_ \| '__| | '_ \| __/ __|
 * |  _| | | | | (_| |  __/ |  | |_) | |  | | | | | |_\__ \
 * |_| |_|_| |_|\__, |\___|_|  | .__/|_|  |_|_| |_|\__|___/
 *              |___/          |_|
 *  FIGLET: fingerprints
 */

/// Cache key for a submission: SHA-256 over `language ":" code`. The colon
/// cannot appear in a language id, so the input is unambiguous.
pub fn content_fingerprint(language: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(language.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// One-way hash of a caller's network identifier. Used as the rate-limit key
/// and recorded on jobs for observability; the raw address is never stored.
pub fn caller_fingerprint(network_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(network_id.as_bytes());
    hex::encode(hasher.finalize())[..16].to_owned()
}

/*    _       _
 *   (_) ___ | |__  ___
 *   | |/ _ \| '_ \/ __|
 *   | | (_) | |_) \__ \
 *  _/ |\___/|_.__/|___/
 * |__/
 *  FIGLET: jobs
 */

/// A queued submission. The queue entry is the whole record, so a worker
/// needs no second lookup after popping and a crashed worker orphans nothing
/// beyond the TTL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub language: String,
    pub code: String,
    pub submitted_at: u64,
    pub client_fingerprint: String,
    /// Hint only. Jobs are attempted once; every pop is a fresh attempt.
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

/// The `job:status:<id>` record. Transitions are monotonic per id:
/// pending, then processing, then the record is deleted once a result exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

impl StatusRecord {
    pub fn pending(created_at: u64) -> Self {
        Self {
            status: JobState::Pending,
            created_at: Some(created_at),
            started_at: None,
        }
    }

    pub fn processing(started_at: u64) -> Self {
        Self {
            status: JobState::Processing,
            created_at: None,
            started_at: Some(started_at),
        }
    }

    /// Whatever timestamp the record carries, for the status endpoint.
    pub fn timestamp(&self) -> Option<u64> {
        self.created_at.or(self.started_at)
    }
}

/*                       _ _
 *   _ __ ___  ___ _   _| | |_ ___
 *  | '__/ _ \/ __| | | | | __/ __|
 *  | | |  __/\__ \ |_| | | |_\__ \
 *  |_|  \___||___/\__,_|_|\__|___/
 *  FIGLET: results
 */

/// Exit code reported when the child was killed by a watchdog or the job
/// failed inside the worker itself.
pub const EXIT_CODE_KILLED: i32 = -1;

/// The outcome of one job. Compile and runtime failures are outcomes, not
/// errors; `error` is set only when the worker itself failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default)]
    pub compile_error: bool,
    pub execution_time_ms: u64,
    /// Set only on responses served from the cache, never on stored results.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cached: bool,
    /// Set when the worker hit an infrastructure failure.
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl JobResult {
    /// Only clean runs are cached: exit 0, no compile error, no worker error.
    pub fn is_cacheable(&self) -> bool {
        self.exit_code == 0 && !self.compile_error && !self.error
    }

    pub fn infrastructure_failure(message: String, execution_time_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit_code: EXIT_CODE_KILLED,
            compile_error: false,
            execution_time_ms,
            cached: false,
            error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn generated_job_ids_match_the_id_grammar() {
        for _ in 0..100 {
            let id = JobId::generate();
            assert_matches!(JobId::parse(id.as_str()), Ok(parsed) if parsed == id);
            assert!(!id.is_cached());
        }
    }

    #[test]
    fn generated_cached_ids_match_the_id_grammar() {
        let id = JobId::generate_cached();
        assert_matches!(JobId::parse(id.as_str()), Ok(parsed) if parsed == id);
        assert!(id.is_cached());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn job_id_parse_rejects_bad_ids() {
        for bad in [
            "",
            "job_",
            "cached_",
            "nope_abc",
            "job_has space",
            "job_semi;colon",
            "JOB_abc",
            "job_abc\n",
            "job_abc/def",
        ] {
            assert_matches!(JobId::parse(bad), Err(InvalidJobId(_)), "{bad:?}");
        }
    }

    #[test]
    fn job_id_parse_accepts_dots_and_underscores() {
        assert_matches!(JobId::parse("job_a.b_c.1"), Ok(_));
        assert_matches!(JobId::parse("cached_0123abcdef"), Ok(_));
    }

    #[test]
    fn content_fingerprint_is_stable() {
        assert_eq!(
            content_fingerprint("python", "print(1)"),
            content_fingerprint("python", "print(1)"),
        );
    }

    #[test]
    fn content_fingerprint_separator_prevents_ambiguity() {
        // "ab" + "c" and "a" + "bc" concatenate identically without the
        // separator; the fingerprints must still differ.
        assert_ne!(content_fingerprint("ab", "c"), content_fingerprint("a", "bc"));
    }

    #[test]
    fn content_fingerprint_distinguishes_languages() {
        assert_ne!(
            content_fingerprint("python", "x"),
            content_fingerprint("javascript", "x"),
        );
    }

    #[test]
    fn caller_fingerprint_is_short_and_stable() {
        let fp = caller_fingerprint("203.0.113.9");
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, caller_fingerprint("203.0.113.9"));
        assert_ne!(fp, caller_fingerprint("203.0.113.10"));
    }

    #[test]
    fn status_record_timestamp_prefers_created_at() {
        assert_eq!(StatusRecord::pending(7).timestamp(), Some(7));
        assert_eq!(StatusRecord::processing(9).timestamp(), Some(9));
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job {
            id: JobId::generate(),
            language: "python".into(),
            code: "print(1)".into(),
            submitted_at: 1_700_000_000,
            client_fingerprint: "deadbeefdeadbeef".into(),
            attempts: 0,
        };
        let encoded = serde_json::to_string(&job).unwrap();
        assert_eq!(serde_json::from_str::<Job>(&encoded).unwrap(), job);
    }

    #[test]
    fn job_attempts_defaults_when_absent() {
        let job: Job = serde_json::from_value(serde_json::json!({
            "id": "job_abc",
            "language": "python",
            "code": "print(1)",
            "submitted_at": 1,
            "client_fingerprint": "deadbeefdeadbeef",
        }))
        .unwrap();
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn result_serialization_omits_unset_flags() {
        let result = JobResult {
            stdout: "hi\n".into(),
            stderr: String::new(),
            exit_code: 0,
            compile_error: false,
            execution_time_ms: 12,
            cached: false,
            error: false,
        };
        let value = serde_json::to_value(&result).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("cached"));
        assert!(!object.contains_key("error"));
        assert_eq!(object["compile_error"], serde_json::json!(false));
    }

    #[test]
    fn result_serialization_keeps_set_flags() {
        let mut result = JobResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            compile_error: false,
            execution_time_ms: 0,
            cached: true,
            error: false,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["cached"], serde_json::json!(true));

        result.cached = false;
        result.error = true;
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["error"], serde_json::json!(true));
    }

    #[test]
    fn only_clean_results_are_cacheable() {
        let clean = JobResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            compile_error: false,
            execution_time_ms: 0,
            cached: false,
            error: false,
        };
        assert!(clean.is_cacheable());
        assert!(!JobResult { exit_code: 1, ..clean.clone() }.is_cacheable());
        assert!(!JobResult { compile_error: true, ..clean.clone() }.is_cacheable());
        assert!(!JobResult::infrastructure_failure("boom".into(), 3).is_cacheable());
    }
}
