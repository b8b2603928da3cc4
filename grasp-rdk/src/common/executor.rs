//! Runs the external grasp detector, one fresh process per request.
use std::{
    ffi::OsString,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use super::config::{DetectionParams, ServiceConfig};

/// Per-stage visualization toggles understood by the detector.
pub const VISUALIZATION_STAGE_FLAGS: [&str; 7] = [
    "GPD_PLOT_NORMALS",
    "GPD_PLOT_SAMPLES",
    "GPD_PLOT_CANDIDATES",
    "GPD_PLOT_FILTERED_CANDIDATES",
    "GPD_PLOT_VALID_GRASPS",
    "GPD_PLOT_CLUSTERED_GRASPS",
    "GPD_PLOT_SELECTED_GRASPS",
];
/// Asks the detector to render a snapshot.
pub const SAVE_SNAPSHOT_FLAG: &str = "GPD_SAVE_VISUALIZATION";
/// Where a snapshot, if any, must be written.
pub const SNAPSHOT_PATH_VAR: &str = "GPD_VISUALIZATION_PATH";

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
// bounds how long we wait for pipes to drain once the process is gone
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything the detector needs for one request.
#[derive(Clone, Debug)]
pub struct DetectionJob {
    pub request_id: String,
    pub input_path: PathBuf,
    pub params: DetectionParams,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionOutcome {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum ExecutionResult {
    Success(ExecutionOutcome),
    ExecutionFailed(ExecutionOutcome),
    /// The process overran its deadline and was killed, output is whatever was
    /// captured until then.
    Timeout(ExecutionOutcome),
    SpawnFailure(io::Error),
}

impl ExecutionResult {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionResult::Success(_) => "success",
            ExecutionResult::ExecutionFailed(_) => "execution_failed",
            ExecutionResult::Timeout(_) => "timeout",
            ExecutionResult::SpawnFailure(_) => "spawn_failure",
        }
    }
}

/// Seam between the request handler and the process that computes grasps.
pub trait Detector: Send + Sync {
    fn run<'a>(
        &'a self,
        job: &'a DetectionJob,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>>;
}

/// [`Detector`] backed by the external executable.
#[derive(Clone, Debug)]
pub struct ProcessDetector {
    executable: PathBuf,
    primary_config: PathBuf,
    working_dir: PathBuf,
    snapshot_path: PathBuf,
    timeout: Duration,
}

impl ProcessDetector {
    pub fn new(config: &ServiceConfig) -> Self {
        // the detector runs from its own directory, every path handed to it
        // has to survive that change
        Self {
            executable: absolute(config.executable_path()),
            primary_config: absolute(config.primary_config_path()),
            working_dir: absolute(&config.executable_dir()),
            snapshot_path: absolute(&config.snapshot_path()),
            timeout: config.timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Positional arguments after the executable itself.
    pub fn arguments(&self, job: &DetectionJob) -> Vec<OsString> {
        vec![
            self.primary_config.clone().into_os_string(),
            absolute(&job.input_path).into_os_string(),
            job.params.rotation_resolution.to_string().into(),
            job.params.top_n.to_string().into(),
            job.params.n_best.to_string().into(),
        ]
    }

    /// Variables to set (`Some`) or remove (`None`) in the detector's
    /// environment.
    pub fn environment(&self, params: &DetectionParams) -> Vec<(&'static str, Option<OsString>)> {
        let toggle = |enabled: bool| enabled.then(|| OsString::from("1"));
        let mut env: Vec<_> = VISUALIZATION_STAGE_FLAGS
            .iter()
            .map(|flag| (*flag, toggle(params.visualization_enabled)))
            .collect();
        env.push((SAVE_SNAPSHOT_FLAG, toggle(params.visualization_enabled)));
        env.push((
            SNAPSHOT_PATH_VAR,
            Some(self.snapshot_path.clone().into_os_string()),
        ));
        env
    }

    fn command(&self, job: &DetectionJob) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(self.arguments(job))
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in self.environment(&job.params) {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    async fn execute(&self, job: &DetectionJob) -> ExecutionResult {
        let request_id = job.request_id.as_str();
        let start = Instant::now();
        let mut child = match self.command(job).spawn() {
            Ok(child) => child,
            Err(err) => {
                log::warn!(
                    "[{request_id}] failed to spawn detector {}: {err}",
                    self.executable.display()
                );
                return ExecutionResult::SpawnFailure(err);
            }
        };
        let pid = child.id();
        log::info!(
            "[{request_id}] detector spawned pid={pid:?} args={:?} workdir={}",
            self.arguments(job),
            self.working_dir.display()
        );

        let stdout = child.stdout.take().map(OutputCapture::start);
        let stderr = child.stderr.take().map(OutputCapture::start);

        let deadline = time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut heartbeat = time::interval_at(time::Instant::now() + HEARTBEAT_PERIOD, HEARTBEAT_PERIOD);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let waited: Option<io::Result<ExitStatus>> = loop {
            tokio::select! {
                status = child.wait() => break Some(status),
                _ = &mut deadline => break None,
                _ = heartbeat.tick() => {
                    log::debug!(
                        "[{request_id}] detector pid={pid:?} still running after {}ms",
                        start.elapsed().as_millis()
                    );
                }
            }
        };

        let status = match waited {
            Some(Ok(status)) => {
                // anything the detector left running in its group would hold
                // the pipes open
                if kill_group(pid) {
                    log::debug!("[{request_id}] killed leftover processes of pid={pid:?}");
                }
                Some(status)
            }
            Some(Err(err)) => {
                log::error!("[{request_id}] lost track of detector pid={pid:?}: {err}");
                terminate(pid, &mut child, request_id).await;
                return ExecutionResult::SpawnFailure(err);
            }
            None => {
                log::warn!(
                    "[{request_id}] detector pid={pid:?} exceeded {}ms, killing",
                    self.timeout.as_millis()
                );
                terminate(pid, &mut child, request_id).await;
                None
            }
        };

        let outcome = ExecutionOutcome {
            exit_code: status.and_then(|s| s.code()),
            stdout: OutputCapture::finish(stdout, request_id).await,
            stderr: OutputCapture::finish(stderr, request_id).await,
            elapsed: start.elapsed(),
        };
        match status {
            None => ExecutionResult::Timeout(outcome),
            Some(status) if status.success() => {
                log::info!(
                    "[{request_id}] detector finished in {}ms",
                    outcome.elapsed.as_millis()
                );
                ExecutionResult::Success(outcome)
            }
            Some(status) => {
                log::warn!(
                    "[{request_id}] detector exited with {status} after {}ms",
                    outcome.elapsed.as_millis()
                );
                ExecutionResult::ExecutionFailed(outcome)
            }
        }
    }
}

impl Detector for ProcessDetector {
    fn run<'a>(
        &'a self,
        job: &'a DetectionJob,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>> {
        Box::pin(self.execute(job))
    }
}

/// Kills the detector's whole process group, then reaps the detector.
async fn terminate(pid: Option<u32>, child: &mut tokio::process::Child, request_id: &str) {
    if !kill_group(pid) {
        log::debug!("[{request_id}] no process group left for pid={pid:?}");
    }
    if let Err(err) = child.kill().await {
        log::debug!("[{request_id}] kill after timeout: {err}");
        if let Err(err) = child.wait().await {
            log::warn!("[{request_id}] could not reap detector: {err}");
        }
    }
}

/// Sends `SIGKILL` to the process group led by `pid`. Returns whether any
/// process received it.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) -> bool {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: plain syscall, the group was created for this child
    unsafe { libc::killpg(pid, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) -> bool {
    false
}

/// Reads one output pipe in the background. Bytes land in a shared buffer so
/// they survive the reader being abandoned.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn start<R: AsyncRead + Unpin + Send + 'static>(mut pipe: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut buffer) => buffer.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                }
            }
        });
        Self { buffer, task }
    }

    async fn finish(capture: Option<Self>, request_id: &str) -> String {
        let Some(Self { buffer, mut task }) = capture else {
            return String::new();
        };
        if time::timeout(OUTPUT_DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
            log::warn!("[{request_id}] output pipe still open after the detector exited");
        }
        let bytes = match buffer.lock() {
            Ok(buffer) => buffer.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
