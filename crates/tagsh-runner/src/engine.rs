//! Script execution engine.
//!
//! One run at a time per [`Engine`]: a run starts by claiming the engine
//! ([`Engine::try_begin`]), the payload is written to
//! `working_dir/script_name`, `sh <script>` is spawned with stdout and stderr
//! merged into one pipe, and each line lands in a bounded rolling buffer that
//! any number of observers may snapshot while the worker is still reading.
//!
//! Teardown order is fixed: release the wake-hold, kill the process group,
//! reap the child, and only then drop the claim, so an observer that sees
//! "not executing" never races a live process or hold. Teardown lives in the
//! claim's `Drop`, so it also runs when the worker unwinds.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tagsh_core::settings::{DEFAULT_BUFFER_SIZE, DEFAULT_WAKELOCK_TIMEOUT_SECS};

use crate::wake::{NoPower, PowerManager, WakeHold, WAKE_HOLD_TAG};

pub const DEFAULT_SCRIPT_NAME: &str = "script.sh";
pub const DEFAULT_SHELL: &str = "sh";

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub script_bytes: Vec<u8>,
    pub script_name: String,
    /// Required. A request without one is refused.
    pub working_dir: Option<PathBuf>,
    pub shell: String,
    pub hold_wakelock: bool,
    pub wakelock_timeout: Duration,
    /// Lines kept in the rolling buffer; values below 1 are treated as 1.
    pub buffer_size: usize,
}

impl Default for ExecutionRequest {
    fn default() -> Self {
        Self {
            script_bytes: Vec::new(),
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            working_dir: None,
            shell: DEFAULT_SHELL.to_string(),
            hold_wakelock: false,
            wakelock_timeout: Duration::from_secs(DEFAULT_WAKELOCK_TIMEOUT_SECS),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ExecutionRequest {
    pub fn new(script_bytes: Vec<u8>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_bytes,
            working_dir: Some(working_dir.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// `None` when the process was ended by a signal or never started.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// The run was cancelled before its output ended.
    pub cancelled: bool,
    /// A wake-hold was taken and had already expired at teardown.
    pub hold_expired: bool,
    pub lines: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Point-in-time copy of the rolling buffer. `total` counts every line
/// pushed since the last clear, including evicted ones; `generation` goes up
/// on every clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub generation: u64,
    pub total: u64,
    pub lines: Vec<String>,
}

#[derive(Debug, Default)]
struct BufferState {
    lines: VecDeque<String>,
    total: u64,
    generation: u64,
}

/// Rolling line buffer. The bound is enforced on insert, under the same lock
/// readers take, so no reader ever sees more than `bound` lines.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    state: Mutex<BufferState>,
}

impl OutputBuffer {
    pub fn push_bounded(&self, line: String, bound: usize) {
        let bound = bound.max(1);
        let mut state = lock(&self.state);
        while state.lines.len() >= bound {
            state.lines.pop_front();
        }
        state.lines.push_back(line);
        state.total += 1;
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.lines.clear();
        state.total = 0;
        state.generation += 1;
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = lock(&self.state);
        Snapshot {
            generation: state.generation,
            total: state.total,
            lines: state.lines.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct Engine {
    /// Set while a claim is alive, from `try_begin` until teardown ends.
    executing: Arc<AtomicBool>,
    /// Cleared by `cancel`; the output loop runs only while it is set.
    running: Arc<AtomicBool>,
    output: Arc<OutputBuffer>,
    child: Arc<Mutex<Option<Child>>>,
    power: Arc<dyn PowerManager>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Arc::new(NoPower))
    }
}

impl Engine {
    pub fn new(power: Arc<dyn PowerManager>) -> Self {
        Self {
            executing: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            output: Arc::new(OutputBuffer::default()),
            child: Arc::new(Mutex::new(None)),
            power,
        }
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.output.snapshot()
    }

    pub fn output(&self) -> Vec<String> {
        self.output.snapshot().lines
    }

    /// Claim the engine for one run. `None` while another claim is alive.
    /// A `cancel` issued after this returns applies to the claimed run even
    /// if its process has not been spawned yet.
    pub fn try_begin(&self) -> Option<RunClaim> {
        self.executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.running.store(true, Ordering::SeqCst);
        Some(RunClaim {
            engine: self.clone(),
            hold: None,
        })
    }

    /// Stop the current run, if any: clear the running flag and kill the
    /// script. The worker notices at its next line boundary, at EOF once the
    /// kill lands, or before spawning if it has not got that far.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(child) = lock(&self.child).as_mut() {
            tracing::info!(pid = child.id(), "cancelling script");
            kill_process(child);
        }
    }

    /// Claim the engine and run `request` to completion on the calling
    /// thread.
    ///
    /// Returns `Ok(None)` without side effects when the request has no working
    /// directory, and an error when another run holds the engine.
    pub fn execute(&self, request: &ExecutionRequest) -> Result<Option<ExecutionOutcome>> {
        if request.working_dir.is_none() {
            tracing::debug!("execute called without a working directory; ignoring");
            return Ok(None);
        }
        self.try_begin()
            .ok_or_else(|| anyhow!("a script is already running"))?
            .execute(request)
    }

    /// Fill the buffer with the lines of `bytes` instead of running them.
    pub fn view(&self, bytes: &[u8], buffer_size: usize) -> Result<u64> {
        let claim = self
            .try_begin()
            .ok_or_else(|| anyhow!("a script is already running"))?;
        Ok(claim.view(bytes, buffer_size))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn(
        &self,
        request: &ExecutionRequest,
        working_dir: &Path,
        script_path: &Path,
    ) -> Result<std::io::PipeReader> {
        let (reader, writer) = std::io::pipe().context("create output pipe")?;
        let stdout = writer.try_clone().context("clone output pipe")?;

        let mut cmd = Command::new(&request.shell);
        cmd.arg(script_path)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(writer);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().with_context(|| {
            format!(
                "spawn {} {} in {}",
                request.shell,
                script_path.display(),
                working_dir.display()
            )
        })?;
        // The command still owns our copies of the write end; EOF only
        // arrives once they are gone.
        drop(cmd);

        tracing::info!(
            pid = child.id(),
            script = %script_path.display(),
            bytes = request.script_bytes.len(),
            "script started"
        );
        let mut slot = lock(&self.child);
        *slot = Some(child);
        // A cancel that found no child to kill has already cleared the flag.
        if !self.is_running() {
            if let Some(child) = slot.as_mut() {
                kill_process(child);
            }
        }
        Ok(reader)
    }

    fn reap(&self) -> Option<ExitStatus> {
        let mut child = lock(&self.child).take()?;
        kill_process(&mut child);
        match child.wait() {
            Ok(status) => Some(status),
            Err(err) => {
                tracing::warn!(error = %err, "waiting for script process failed");
                None
            }
        }
    }
}

/// Exclusive right to run one script on an [`Engine`].
///
/// Dropping the claim tears the run down: the wake-hold is released, any
/// child is killed and reaped, and the engine becomes free again.
#[must_use = "the engine is released as soon as the claim is dropped"]
pub struct RunClaim {
    engine: Engine,
    hold: Option<Box<dyn WakeHold>>,
}

impl RunClaim {
    pub fn execute(mut self, request: &ExecutionRequest) -> Result<Option<ExecutionOutcome>> {
        let Some(working_dir) = request.working_dir.as_deref() else {
            tracing::debug!("execute called without a working directory; ignoring");
            return Ok(None);
        };
        let started_at = Utc::now();

        let streamed = self.stream(request, working_dir);

        let hold_expired = self.release_hold();
        let status = self.engine.reap();
        let cancelled = !self.engine.is_running();
        drop(self);

        let lines = streamed?;
        let outcome = ExecutionOutcome {
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(exit_signal),
            cancelled,
            hold_expired,
            lines,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            cancelled,
            lines,
            "script finished"
        );
        Ok(Some(outcome))
    }

    pub fn view(self, bytes: &[u8], buffer_size: usize) -> u64 {
        self.engine.output.clear();
        let mut reader = bytes;
        let mut buf = Vec::new();
        let mut lines = 0;
        while self.engine.is_running() {
            match read_line_lossy(&mut reader, &mut buf) {
                Ok(Some(line)) => {
                    self.engine.output.push_bounded(line, buffer_size);
                    lines += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
        lines
    }

    fn stream(&mut self, request: &ExecutionRequest, working_dir: &Path) -> Result<u64> {
        let script_path = std::path::absolute(working_dir.join(&request.script_name))
            .with_context(|| format!("resolve script path in {}", working_dir.display()))?;
        fs::write(&script_path, &request.script_bytes)
            .with_context(|| format!("write script {}", script_path.display()))?;
        self.engine.output.clear();

        if request.hold_wakelock {
            let mut hold = self.engine.power.new_wake_hold(WAKE_HOLD_TAG);
            hold.acquire(request.wakelock_timeout);
            if hold.is_held() {
                self.hold = Some(hold);
            }
        }

        if !self.engine.is_running() {
            tracing::info!("script cancelled before it started");
            return Ok(0);
        }
        let pipe = self.engine.spawn(request, working_dir, &script_path)?;
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        let mut lines = 0;
        while self.engine.is_running() {
            match read_line_lossy(&mut reader, &mut buf) {
                Ok(Some(line)) => {
                    self.engine.output.push_bounded(line, request.buffer_size);
                    lines += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "reading script output failed");
                    break;
                }
            }
        }
        Ok(lines)
    }

    /// Release the hold if one was taken. True when it had already expired.
    fn release_hold(&mut self) -> bool {
        let Some(mut hold) = self.hold.take() else {
            return false;
        };
        if hold.is_held() {
            hold.release();
            false
        } else {
            true
        }
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.release_hold();
        self.engine.reap();
        self.engine.running.store(false, Ordering::SeqCst);
        self.engine.executing.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kill the script and anything it started. Killing an exited process is
/// not an error.
fn kill_process(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child leads its own process group; it stays unreaped until
        // `reap`, so the group id cannot have been recycled.
        let pgid = child.id() as libc::pid_t;
        // SAFETY: kill(2) takes plain integers and touches no memory of
        // ours; a stale or missing group only yields ESRCH.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Next line without its terminator; invalid UTF-8 is replaced.
fn read_line_lossy<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    buf.clear();
    loop {
        match reader.read_until(b'\n', buf) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}
