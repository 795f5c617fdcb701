//! The three request handlers, written against a [`Deps`] seam instead of the
//! concrete store so the decision logic is testable without Redis. HTTP
//! plumbing (routing, CORS, body caps) lives in `server`.

use anyhow::Result;
use crucible_base::{
    content_fingerprint, languages, unix_time_secs, Job, JobId, JobResult, StatusRecord,
    MAX_CODE_LEN,
};
use crucible_store::RateLimitDecision;
use serde::Deserialize;
use serde_json::{json, Value};
use slog::{debug, error, info, Logger};
use std::{future::Future, time::Duration};

/// What the handlers need from the store.
pub trait Deps: Send + Sync + 'static {
    fn rate_limit_hit(
        &self,
        fingerprint: &str,
        window: Duration,
        max: u64,
    ) -> impl Future<Output = Result<RateLimitDecision>> + Send;
    fn cache_get(&self, fingerprint: &str)
        -> impl Future<Output = Result<Option<JobResult>>> + Send;
    fn put_status(
        &self,
        id: &JobId,
        record: &StatusRecord,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
    fn enqueue(&self, job: &Job) -> impl Future<Output = Result<()>> + Send;
    fn get_status(&self, id: &JobId) -> impl Future<Output = Result<Option<StatusRecord>>> + Send;
    fn get_result(&self, id: &JobId) -> impl Future<Output = Result<Option<JobResult>>> + Send;
}

impl Deps for crucible_store::Store {
    async fn rate_limit_hit(
        &self,
        fingerprint: &str,
        window: Duration,
        max: u64,
    ) -> Result<RateLimitDecision> {
        crucible_store::Store::rate_limit_hit(self, fingerprint, window, max).await
    }

    async fn cache_get(&self, fingerprint: &str) -> Result<Option<JobResult>> {
        crucible_store::Store::cache_get(self, fingerprint).await
    }

    async fn put_status(&self, id: &JobId, record: &StatusRecord, ttl: Duration) -> Result<()> {
        crucible_store::Store::put_status(self, id, record, ttl).await
    }

    async fn enqueue(&self, job: &Job) -> Result<()> {
        crucible_store::Store::enqueue(self, job).await
    }

    async fn get_status(&self, id: &JobId) -> Result<Option<StatusRecord>> {
        crucible_store::Store::get_status(self, id).await
    }

    async fn get_result(&self, id: &JobId) -> Result<Option<JobResult>> {
        crucible_store::Store::get_result(self, id).await
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ApiOptions {
    pub rate_limit_max: u64,
    pub rate_limit_window: Duration,
    pub rate_limit_cache_hits: bool,
    pub result_ttl: Duration,
}

/// A JSON response plus the HTTP status to send it with.
#[derive(Debug, PartialEq)]
pub struct JsonResponse {
    pub status: u16,
    pub body: Value,
}

impl JsonResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into(), "success": false }),
        }
    }
}

#[derive(Deserialize)]
struct SubmitRequest {
    language: String,
    code: String,
}

pub struct Api<DepsT> {
    deps: DepsT,
    options: ApiOptions,
    log: Logger,
}

impl<DepsT: Deps> Api<DepsT> {
    pub fn new(deps: DepsT, options: ApiOptions, log: Logger) -> Self {
        Self { deps, options, log }
    }

    /// `POST /execute`. Internal failures never reach the client; they log
    /// and collapse to a generic 500.
    pub async fn submit(&self, client_fingerprint: &str, body: &[u8]) -> JsonResponse {
        match self.submit_inner(client_fingerprint, body).await {
            Ok(response) => response,
            Err(err) => {
                error!(self.log, "submit failed"; "error" => %err);
                JsonResponse::error(500, "internal error")
            }
        }
    }

    async fn submit_inner(&self, client_fingerprint: &str, body: &[u8]) -> Result<JsonResponse> {
        let request: SubmitRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(err) => {
                return Ok(JsonResponse::error(400, format!("invalid request body: {err}")));
            }
        };

        if !languages::has(&request.language) {
            return Ok(JsonResponse::error(
                400,
                format!("unsupported language {:?}", request.language),
            ));
        }
        if request.code.is_empty() {
            return Ok(JsonResponse::error(400, "code must not be empty"));
        }
        if request.code.len() > MAX_CODE_LEN {
            return Ok(JsonResponse::error(400, "code exceeds maximum size (64KB)"));
        }

        // Charging before the cache lookup makes cache hits cost budget,
        // which keeps cheap hits from being an enumeration primitive.
        if self.options.rate_limit_cache_hits {
            if let Some(response) = self.check_rate_limit(client_fingerprint).await? {
                return Ok(response);
            }
        }

        let fingerprint = content_fingerprint(&request.language, &request.code);
        if let Some(mut result) = self.deps.cache_get(&fingerprint).await? {
            let id = JobId::generate_cached();
            debug!(self.log, "cache hit"; "job_id" => %id, "language" => &request.language);
            result.cached = true;
            return Ok(JsonResponse::ok(json!({
                "success": true,
                "job_id": id,
                "status": "completed",
                "cached": true,
                "result": result,
            })));
        }

        if !self.options.rate_limit_cache_hits {
            if let Some(response) = self.check_rate_limit(client_fingerprint).await? {
                return Ok(response);
            }
        }

        let id = JobId::generate();
        let now = unix_time_secs();
        let job = Job {
            id: id.clone(),
            language: request.language,
            code: request.code,
            submitted_at: now,
            client_fingerprint: client_fingerprint.to_owned(),
            attempts: 0,
        };
        self.deps
            .put_status(&id, &StatusRecord::pending(now), self.options.result_ttl)
            .await?;
        self.deps.enqueue(&job).await?;
        info!(self.log, "job queued"; "job_id" => %id, "language" => &job.language);

        Ok(JsonResponse::ok(json!({
            "success": true,
            "job_id": id,
            "status": "queued",
            "cached": false,
        })))
    }

    async fn check_rate_limit(&self, client_fingerprint: &str) -> Result<Option<JsonResponse>> {
        let decision = self
            .deps
            .rate_limit_hit(
                client_fingerprint,
                self.options.rate_limit_window,
                self.options.rate_limit_max,
            )
            .await?;
        if decision.rejected() {
            debug!(self.log, "rate limited"; "client" => client_fingerprint);
            return Ok(Some(JsonResponse {
                status: 429,
                body: json!({ "error": "Rate limit exceeded. Try again later." }),
            }));
        }
        Ok(None)
    }

    /// `GET /status?job_id=…`. Result key first, then status key, then 404.
    pub async fn status(&self, job_id: &str) -> JsonResponse {
        match self.status_inner(job_id).await {
            Ok(response) => response,
            Err(err) => {
                error!(self.log, "status lookup failed"; "job_id" => job_id, "error" => %err);
                JsonResponse::error(500, "internal error")
            }
        }
    }

    async fn status_inner(&self, job_id: &str) -> Result<JsonResponse> {
        let id = match JobId::parse(job_id) {
            Ok(id) => id,
            Err(_) => return Ok(JsonResponse::error(400, "invalid job id")),
        };

        if let Some(result) = self.deps.get_result(&id).await? {
            return Ok(JsonResponse::ok(json!({
                "success": true,
                "job_id": id,
                "status": "completed",
                "result": result,
            })));
        }

        if let Some(record) = self.deps.get_status(&id).await? {
            return Ok(JsonResponse::ok(json!({
                "success": true,
                "job_id": id,
                "status": record.status.as_str(),
                "created_at": record.timestamp(),
            })));
        }

        Ok(JsonResponse {
            status: 404,
            body: json!({ "error": "Job not found" }),
        })
    }

    /// `GET /languages`. Pure: identical payloads on every call.
    pub fn languages(&self) -> JsonResponse {
        JsonResponse::ok(json!({
            "success": true,
            "languages": languages::public_view(),
            "rate_limit": {
                "max": self.options.rate_limit_max,
                "window_seconds": self.options.rate_limit_window.as_secs(),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_util::log::null_logger;
    use maplit::hashmap;
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    #[derive(Default)]
    struct FakeState {
        rate_count: u64,
        cache: HashMap<String, JobResult>,
        statuses: HashMap<String, (StatusRecord, u64)>,
        results: HashMap<String, JobResult>,
        queue: Vec<Job>,
        fail_enqueue: bool,
    }

    #[derive(Clone, Default)]
    struct FakeDeps {
        state: Arc<Mutex<FakeState>>,
    }

    impl Deps for FakeDeps {
        async fn rate_limit_hit(
            &self,
            _fingerprint: &str,
            _window: Duration,
            max: u64,
        ) -> Result<RateLimitDecision> {
            let mut state = self.state.lock().unwrap();
            state.rate_count += 1;
            Ok(RateLimitDecision { count: state.rate_count, max })
        }

        async fn cache_get(&self, fingerprint: &str) -> Result<Option<JobResult>> {
            Ok(self.state.lock().unwrap().cache.get(fingerprint).cloned())
        }

        async fn put_status(&self, id: &JobId, record: &StatusRecord, ttl: Duration) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .statuses
                .insert(id.as_str().to_owned(), (record.clone(), ttl.as_secs()));
            Ok(())
        }

        async fn enqueue(&self, job: &Job) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_enqueue {
                anyhow::bail!("redis connection reset");
            }
            state.queue.push(job.clone());
            Ok(())
        }

        async fn get_status(&self, id: &JobId) -> Result<Option<StatusRecord>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .statuses
                .get(id.as_str())
                .map(|(record, _)| record.clone()))
        }

        async fn get_result(&self, id: &JobId) -> Result<Option<JobResult>> {
            Ok(self.state.lock().unwrap().results.get(id.as_str()).cloned())
        }
    }

    fn options() -> ApiOptions {
        ApiOptions {
            rate_limit_max: 10,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_cache_hits: true,
            result_ttl: Duration::from_secs(300),
        }
    }

    fn api(deps: FakeDeps, options: ApiOptions) -> Api<FakeDeps> {
        Api::new(deps, options, null_logger())
    }

    fn submit_body(language: &str, code: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({ "language": language, "code": code })).unwrap()
    }

    fn ok_result() -> JobResult {
        JobResult {
            stdout: "hi\n".into(),
            stderr: String::new(),
            exit_code: 0,
            compile_error: false,
            execution_time_ms: 5,
            cached: false,
            error: false,
        }
    }

    #[tokio::test]
    async fn submit_rejects_unknown_language() {
        let deps = FakeDeps::default();
        let api = api(deps.clone(), options());
        let response = api.submit("fp", &submit_body("cobol", "x")).await;
        assert_eq!(response.status, 400);
        assert!(deps.state.lock().unwrap().queue.is_empty());
    }

    #[tokio::test]
    async fn submit_rejects_malformed_body() {
        let api = api(FakeDeps::default(), options());
        assert_eq!(api.submit("fp", b"not json").await.status, 400);
        assert_eq!(api.submit("fp", br#"{"language": "python"}"#).await.status, 400);
    }

    #[tokio::test]
    async fn submit_enforces_code_size_boundaries() {
        let deps = FakeDeps::default();
        let api = api(deps.clone(), options());

        assert_eq!(api.submit("fp", &submit_body("python", "")).await.status, 400);

        let at_limit = "x".repeat(MAX_CODE_LEN);
        let response = api.submit("fp", &submit_body("python", &at_limit)).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], json!("queued"));

        let over_limit = "x".repeat(MAX_CODE_LEN + 1);
        let response = api.submit("fp", &submit_body("python", &over_limit)).await;
        assert_eq!(response.status, 400);
        assert_eq!(deps.state.lock().unwrap().queue.len(), 1);
    }

    #[tokio::test]
    async fn submit_queues_a_job_and_records_pending_status() {
        let deps = FakeDeps::default();
        let api = api(deps.clone(), options());

        let response = api.submit("fp", &submit_body("python", "print(1)")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["success"], json!(true));
        assert_eq!(response.body["cached"], json!(false));
        let job_id = response.body["job_id"].as_str().unwrap().to_owned();
        assert!(job_id.starts_with("job_"));

        let state = deps.state.lock().unwrap();
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].id.as_str(), job_id);
        assert_eq!(state.queue[0].language, "python");
        assert_eq!(state.queue[0].client_fingerprint, "fp");
        let (record, ttl) = &state.statuses[&job_id];
        assert_eq!(record.status, crucible_base::JobState::Pending);
        assert_eq!(*ttl, 300);
    }

    #[tokio::test]
    async fn submit_serves_cache_hits_synchronously() {
        let deps = FakeDeps::default();
        let fingerprint = content_fingerprint("python", "print(1)");
        deps.state.lock().unwrap().cache = hashmap! { fingerprint => ok_result() };
        let api = api(deps.clone(), options());

        let response = api.submit("fp", &submit_body("python", "print(1)")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["cached"], json!(true));
        assert_eq!(response.body["status"], json!("completed"));
        assert!(response.body["job_id"].as_str().unwrap().starts_with("cached_"));
        assert_eq!(response.body["result"]["cached"], json!(true));
        assert_eq!(response.body["result"]["stdout"], json!("hi\n"));

        let state = deps.state.lock().unwrap();
        assert!(state.queue.is_empty());
        // Cache hits still cost rate-limit budget by default.
        assert_eq!(state.rate_count, 1);
    }

    #[tokio::test]
    async fn submit_rate_limits_after_the_budget_is_spent() {
        let deps = FakeDeps::default();
        deps.state.lock().unwrap().rate_count = 10;
        let api = api(deps.clone(), options());

        let response = api.submit("fp", &submit_body("python", "print(1)")).await;
        assert_eq!(response.status, 429);
        assert!(deps.state.lock().unwrap().queue.is_empty());
        assert!(deps.state.lock().unwrap().statuses.is_empty());
    }

    #[tokio::test]
    async fn tenth_submission_is_still_accepted() {
        let deps = FakeDeps::default();
        deps.state.lock().unwrap().rate_count = 9;
        let api = api(deps.clone(), options());
        let response = api.submit("fp", &submit_body("python", "print(1)")).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn cache_hits_can_be_exempted_from_rate_limiting() {
        let deps = FakeDeps::default();
        let fingerprint = content_fingerprint("python", "print(1)");
        deps.state.lock().unwrap().cache = hashmap! { fingerprint => ok_result() };
        let api = api(
            deps.clone(),
            ApiOptions { rate_limit_cache_hits: false, ..options() },
        );

        let response = api.submit("fp", &submit_body("python", "print(1)")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["cached"], json!(true));
        assert_eq!(deps.state.lock().unwrap().rate_count, 0);

        // Misses are still charged.
        let response = api.submit("fp", &submit_body("python", "print(2)")).await;
        assert_eq!(response.status, 200);
        assert_eq!(deps.state.lock().unwrap().rate_count, 1);
    }

    #[tokio::test]
    async fn submit_collapses_internal_errors_to_a_generic_500() {
        let deps = FakeDeps::default();
        deps.state.lock().unwrap().fail_enqueue = true;
        let api = api(deps.clone(), options());

        let response = api.submit("fp", &submit_body("python", "print(1)")).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body["error"], json!("internal error"));
        assert!(!response.body.to_string().contains("redis"));
    }

    #[tokio::test]
    async fn status_rejects_malformed_ids() {
        let api = api(FakeDeps::default(), options());
        assert_eq!(api.status("job_abc; DROP").await.status, 400);
        assert_eq!(api.status("nope_123").await.status, 400);
        assert_eq!(api.status("").await.status, 400);
    }

    #[tokio::test]
    async fn status_returns_result_when_completed() {
        let deps = FakeDeps::default();
        deps.state
            .lock()
            .unwrap()
            .results
            .insert("job_abc".into(), ok_result());
        let api = api(deps, options());

        let response = api.status("job_abc").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], json!("completed"));
        assert_eq!(response.body["result"]["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn status_prefers_result_over_status_record() {
        let deps = FakeDeps::default();
        {
            let mut state = deps.state.lock().unwrap();
            state.results.insert("job_abc".into(), ok_result());
            state
                .statuses
                .insert("job_abc".into(), (StatusRecord::processing(5), 300));
        }
        let api = api(deps, options());
        let response = api.status("job_abc").await;
        assert_eq!(response.body["status"], json!("completed"));
    }

    #[tokio::test]
    async fn status_reports_pending_with_created_at() {
        let deps = FakeDeps::default();
        deps.state
            .lock()
            .unwrap()
            .statuses
            .insert("job_abc".into(), (StatusRecord::pending(1234), 300));
        let api = api(deps, options());

        let response = api.status("job_abc").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], json!("pending"));
        assert_eq!(response.body["created_at"], json!(1234));
    }

    #[tokio::test]
    async fn status_returns_404_for_absent_jobs() {
        let api = api(FakeDeps::default(), options());
        let response = api.status("job_never_existed").await;
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"], json!("Job not found"));
    }

    #[tokio::test]
    async fn languages_is_pure_and_lists_rate_limit_params() {
        let api = api(FakeDeps::default(), options());
        let first = api.languages();
        let second = api.languages();
        assert_eq!(first, second);
        assert_eq!(first.status, 200);
        assert_eq!(first.body["rate_limit"]["max"], json!(10));
        assert_eq!(first.body["rate_limit"]["window_seconds"], json!(60));
        assert!(first.body["languages"]["python"].is_object());
        assert!(first.body["languages"]["java"].is_object());
    }
}
