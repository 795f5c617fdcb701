//! The per-job pipeline: workspace, source file, optional compile, sandbox
//! config render, launcher invocation with capped capture and watchdogs,
//! result persistence, cache write, cleanup.
//!
//! A popped job always ends in a stored result — compile and runtime
//! failures travel through the result channel, and even a worker-side
//! failure is collapsed into a result with `error: true` so a polling client
//! never waits forever. The workspace is removed on every exit path before
//! the result is persisted, so a completed job never has a live workspace.

use anyhow::{anyhow, Context as _, Result};
use crucible_base::{
    content_fingerprint,
    languages::{self, Language},
    unix_time_secs, Job, JobId, JobResult, StatusRecord, EXIT_CODE_KILLED, MAX_OUTPUT_LEN,
};
use regex::Regex;
use slog::{debug, error, info, o, warn, Logger};
use std::{
    future::Future,
    io,
    os::unix::process::ExitStatusExt as _,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _},
    process::{Child, Command},
    sync::Notify,
    time,
};

const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack on top of the language's own wall-clock limit. The sandbox is
/// expected to enforce the real limit; this watchdog is the backstop.
const WATCHDOG_GRACE: Duration = Duration::from_secs(5);

const TIMEOUT_MESSAGE: &str = "Execution timeout exceeded";
const OUTPUT_LIMIT_MESSAGE: &str = "Output exceeded maximum size (64KB)";
const COMPILE_TIMEOUT_MESSAGE: &str = "Compilation timeout exceeded";

/// What the executor needs from the store.
pub trait Deps: Send + Sync + 'static {
    fn put_status(
        &self,
        id: &JobId,
        record: &StatusRecord,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
    fn put_result(
        &self,
        id: &JobId,
        result: &JobResult,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
    fn cache_put(
        &self,
        fingerprint: &str,
        result: &JobResult,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
    fn delete_status(&self, id: &JobId) -> impl Future<Output = Result<()>> + Send;
}

impl Deps for crucible_store::Store {
    async fn put_status(&self, id: &JobId, record: &StatusRecord, ttl: Duration) -> Result<()> {
        crucible_store::Store::put_status(self, id, record, ttl).await
    }

    async fn put_result(&self, id: &JobId, result: &JobResult, ttl: Duration) -> Result<()> {
        crucible_store::Store::put_result(self, id, result, ttl).await
    }

    async fn cache_put(&self, fingerprint: &str, result: &JobResult, ttl: Duration) -> Result<()> {
        crucible_store::Store::cache_put(self, fingerprint, result, ttl).await
    }

    async fn delete_status(&self, id: &JobId) -> Result<()> {
        crucible_store::Store::delete_status(self, id).await
    }
}

pub struct Executor<DepsT> {
    deps: DepsT,
    jobs_root: PathBuf,
    config_dir: PathBuf,
    launcher: PathBuf,
    launcher_noise: Regex,
    result_ttl: Duration,
    cache_ttl: Duration,
    log: Logger,
}

impl<DepsT: Deps> Executor<DepsT> {
    pub fn new(
        deps: DepsT,
        jobs_root: PathBuf,
        config_dir: PathBuf,
        launcher: PathBuf,
        result_ttl: Duration,
        cache_ttl: Duration,
        log: Logger,
    ) -> Result<Self> {
        let launcher_noise = launcher_noise_pattern(&launcher)?;
        Ok(Self {
            deps,
            jobs_root,
            config_dir,
            launcher,
            launcher_noise,
            result_ttl,
            cache_ttl,
            log,
        })
    }

    /// Drive one job to a stored result. Infallible by design: whatever goes
    /// wrong inside, something gets persisted and the workspace is gone.
    pub async fn run_job(&self, job: Job) {
        let log = self
            .log
            .new(o!("job_id" => job.id.to_string(), "language" => job.language.clone()));
        let started = Instant::now();
        let result = match self.execute(&job, started, &log).await {
            Ok(result) => result,
            Err(err) => {
                error!(log, "job failed in the worker"; "error" => %err);
                JobResult::infrastructure_failure(format!("{err:#}"), elapsed_ms(started))
            }
        };
        if let Err(err) = self.finish(&job, &result).await {
            error!(log, "failed to persist result"; "error" => %err);
        }
        info!(log, "job finished";
            "exit_code" => result.exit_code,
            "compile_error" => result.compile_error,
            "execution_time_ms" => result.execution_time_ms);
    }

    async fn execute(&self, job: &Job, started: Instant, log: &Logger) -> Result<JobResult> {
        let lang = languages::get(&job.language)
            .ok_or_else(|| anyhow!("unknown language {:?} in queue entry", job.language))?;

        self.deps
            .put_status(
                &job.id,
                &StatusRecord::processing(unix_time_secs()),
                self.result_ttl,
            )
            .await?;

        let workspace = self.create_workspace(&job.id).await?;
        let outcome = self.run_in_workspace(&workspace, job, lang, started, log).await;
        remove_workspace(&workspace, log).await;
        outcome
    }

    async fn create_workspace(&self, id: &JobId) -> Result<PathBuf> {
        let path = self.jobs_root.join(id.as_str());
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(0o700);
        builder
            .create(&path)
            .await
            .with_context(|| format!("creating workspace {}", path.display()))?;
        Ok(path)
    }

    async fn run_in_workspace(
        &self,
        workspace: &Path,
        job: &Job,
        lang: &Language,
        started: Instant,
        log: &Logger,
    ) -> Result<JobResult> {
        tokio::fs::write(workspace.join(lang.source_file), &job.code)
            .await
            .context("writing source file")?;

        if let Some(compile) = &lang.compile {
            let mut command = Command::new(compile.program);
            command
                .args(compile.args)
                .current_dir(workspace)
                .envs(lang.env.iter().copied());
            let capture = run_captured(command, COMPILE_TIMEOUT, log)
                .await
                .context("running compiler")?;
            if capture.timed_out {
                debug!(log, "compile timed out");
                return Ok(JobResult {
                    stdout: String::new(),
                    stderr: COMPILE_TIMEOUT_MESSAGE.into(),
                    exit_code: EXIT_CODE_KILLED,
                    compile_error: true,
                    execution_time_ms: elapsed_ms(started),
                    cached: false,
                    error: false,
                });
            }
            if !capture.status.success() {
                debug!(log, "compile failed"; "exit_code" => capture.exit_code());
                return Ok(JobResult {
                    stdout: String::new(),
                    stderr: capture.stderr_lossy(),
                    exit_code: capture.exit_code(),
                    compile_error: true,
                    execution_time_ms: elapsed_ms(started),
                    cached: false,
                    error: false,
                });
            }
        }

        let config_path = self.render_sandbox_config(workspace, lang).await?;

        let mut command = Command::new(&self.launcher);
        command
            .arg("--config")
            .arg(&config_path)
            .arg("--")
            .arg(lang.run.program)
            .args(lang.run.args)
            .current_dir(workspace)
            .envs(lang.env.iter().copied());
        let deadline = Duration::from_millis(lang.timeout_ms) + WATCHDOG_GRACE;
        let capture = run_captured(command, deadline, log)
            .await
            .context("running sandbox launcher")?;
        Ok(self.result_from_capture(capture, elapsed_ms(started)))
    }

    async fn render_sandbox_config(&self, workspace: &Path, lang: &Language) -> Result<PathBuf> {
        let template_path = self.config_dir.join(lang.sandbox_template);
        let template = tokio::fs::read_to_string(&template_path)
            .await
            .with_context(|| format!("reading sandbox template {}", template_path.display()))?;
        // The launcher needs an absolute mount path however the worker was
        // configured.
        let absolute = tokio::fs::canonicalize(workspace)
            .await
            .context("resolving workspace path")?;
        let config_path = workspace.join("sandbox.cfg");
        tokio::fs::write(&config_path, render_template(&template, &absolute))
            .await
            .context("writing sandbox config")?;
        Ok(config_path)
    }

    fn result_from_capture(&self, capture: Capture, execution_time_ms: u64) -> JobResult {
        if capture.output_overflow {
            return JobResult {
                stdout: capture.stdout_lossy(),
                stderr: OUTPUT_LIMIT_MESSAGE.into(),
                exit_code: EXIT_CODE_KILLED,
                compile_error: false,
                execution_time_ms,
                cached: false,
                error: false,
            };
        }
        if capture.timed_out {
            return JobResult {
                stdout: capture.stdout_lossy(),
                stderr: TIMEOUT_MESSAGE.into(),
                exit_code: EXIT_CODE_KILLED,
                compile_error: false,
                execution_time_ms,
                cached: false,
                error: false,
            };
        }
        JobResult {
            stdout: capture.stdout_lossy(),
            stderr: self.filter_launcher_noise(&capture.stderr_lossy()),
            exit_code: capture.exit_code(),
            compile_error: false,
            execution_time_ms,
            cached: false,
            error: false,
        }
    }

    /// Strip launcher log lines so infrastructure noise never reaches users.
    fn filter_launcher_noise(&self, stderr: &str) -> String {
        self.launcher_noise.replace_all(stderr, "").into_owned()
    }

    async fn finish(&self, job: &Job, result: &JobResult) -> Result<()> {
        self.deps.put_result(&job.id, result, self.result_ttl).await?;
        if result.is_cacheable() {
            let fingerprint = content_fingerprint(&job.language, &job.code);
            self.deps.cache_put(&fingerprint, result, self.cache_ttl).await?;
        }
        self.deps.delete_status(&job.id).await?;
        Ok(())
    }
}

impl<DepsT: Deps> crate::dispatcher::JobRunner for Executor<DepsT> {
    async fn run_job(&self, job: Job) {
        Executor::run_job(self, job).await
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Lines like `[I][2024-…] nsjail …` from the configured launcher binary.
fn launcher_noise_pattern(launcher: &Path) -> Result<Regex> {
    let name = launcher
        .file_stem()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("launcher path {:?} has no file name", launcher))?;
    Regex::new(&format!(r"(?m)^\[[^\n]*{}[^\n]*\n?", regex::escape(name)))
        .context("building launcher noise pattern")
}

const WORKSPACE_TOKEN: &str = "{{WORKSPACE}}";

fn render_template(template: &str, workspace: &Path) -> String {
    template.replace(WORKSPACE_TOKEN, &workspace.to_string_lossy())
}

async fn remove_workspace(workspace: &Path, log: &Logger) {
    if let Err(err) = tokio::fs::remove_dir_all(workspace).await {
        warn!(log, "failed to remove workspace";
            "workspace" => %workspace.display(), "error" => %err);
    }
}

/*                  _
 *   ___ __ _ _ __ | |_ _   _ _ __ ___
 *  / __/ _` | '_ \| __| | | | '__/ _ \
 * | (_| (_| | |_) | |_| |_| | | |  __/
 *  \___\__,_| .__/ \__|\__,_|_|  \___|
 *           |_|
 *  FIGLET: capture
 */

/// One supervised child run: exit status plus capped stdout/stderr and
/// which watchdog, if any, put it down.
#[derive(Debug)]
struct Capture {
    status: ExitStatus,
    timed_out: bool,
    output_overflow: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Capture {
    /// Normal exits report their code; deaths by signal report 128 + signal
    /// in the shell convention, keeping -1 reserved for watchdog and
    /// worker-internal kills.
    fn exit_code(&self) -> i32 {
        match self.status.code() {
            Some(code) => code,
            None => match self.status.signal() {
                Some(signal) => 128 + signal,
                None => EXIT_CODE_KILLED,
            },
        }
    }

    fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Spawn `command` in its own process group, capture both streams with the
/// per-stream cap, and SIGKILL the whole group if the deadline passes or
/// either stream overflows.
async fn run_captured(mut command: Command, deadline: Duration, log: &Logger) -> Result<Capture> {
    let program = command.as_std().get_program().to_owned();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {program:?}"))?;

    let overflow = Arc::new(Notify::new());
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr was not piped"))?;
    let stdout_task = tokio::spawn(read_capped(stdout, MAX_OUTPUT_LEN, overflow.clone()));
    let stderr_task = tokio::spawn(read_capped(stderr, MAX_OUTPUT_LEN, overflow.clone()));

    let mut timed_out = false;
    let mut output_overflow = false;
    let status = tokio::select! {
        status = child.wait() => status.context("waiting for child")?,
        _ = overflow.notified() => {
            output_overflow = true;
            kill_process_group(&child, log);
            child.wait().await.context("reaping killed child")?
        }
        _ = time::sleep(deadline) => {
            timed_out = true;
            kill_process_group(&child, log);
            child.wait().await.context("reaping killed child")?
        }
    };

    let (stdout, stdout_truncated) = stdout_task.await.context("stdout reader")??;
    let (stderr, stderr_truncated) = stderr_task.await.context("stderr reader")??;
    // The child can also exit on its own having already written past the
    // cap; that still counts as an overflow kill for reporting purposes.
    output_overflow = output_overflow || stdout_truncated || stderr_truncated;

    Ok(Capture {
        status,
        timed_out,
        output_overflow,
        stdout,
        stderr,
    })
}

/// Read up to `cap` bytes. The byte after the cap trips `overflow` and ends
/// the read; exactly `cap` bytes pass through untouched.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    overflow: Arc<Notify>,
) -> io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok((buf, false));
        }
        let room = cap - buf.len();
        if n > room {
            buf.extend_from_slice(&chunk[..room]);
            overflow.notify_one();
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// SIGKILL the child's whole process group. The child is its own group
/// leader, so this reaps grandchildren the direct kill would miss.
fn kill_process_group(child: &Child, log: &Logger) {
    let Some(pid) = child.id() else {
        return; // already reaped
    };
    let outcome = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if outcome != 0 {
        warn!(log, "group kill failed";
            "pid" => pid, "error" => %io::Error::last_os_error());
    }
}
