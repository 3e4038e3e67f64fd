//! Session controller: decides when scripts run and what happens on a scan.
//!
//! A session owns one [`Engine`]. Runs happen on a worker thread; the caller
//! observes them through a [`Poller`] and stops them with [`Session::kill`].

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use tagsh_core::settings::Settings;
use tagsh_core::transport::{ScanEvent, TagFailure, Transport};

use crate::engine::{Engine, ExecutionOutcome, ExecutionRequest, RunClaim};
use crate::workdir::AppDirs;

/// Largest script accepted from a file.
pub const MAX_SCRIPT_BYTES: u64 = 32 * 1024;

/// How often observers should poll the output buffer.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub enum ScanOutcome {
    /// An armed flash was written (or failed); the tag was not executed.
    Flashed(Result<(), TagFailure>),
    /// A script is already running; the scan was dropped.
    Busy,
    /// The tag carried no script.
    Blank,
    /// The event was not a tag scan.
    Ignored,
    Started(RunHandle),
}

/// A run in progress on its worker thread.
pub struct RunHandle {
    pub working_dir: PathBuf,
    pub view_only: bool,
    handle: JoinHandle<Result<Option<ExecutionOutcome>>>,
}

impl RunHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker. View-only runs yield `None`.
    pub fn join(self) -> Result<Option<ExecutionOutcome>> {
        self.handle
            .join()
            .map_err(|_| anyhow!("script worker panicked"))?
    }
}

pub struct Session {
    engine: Engine,
    transport: Transport,
    settings: Settings,
    dirs: AppDirs,
    pending_flash: Option<Vec<u8>>,
}

impl Session {
    pub fn new(engine: Engine, transport: Transport, settings: Settings, dirs: AppDirs) -> Self {
        Self {
            engine,
            transport,
            settings,
            dirs,
            pending_flash: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn dirs(&self) -> &AppDirs {
        &self.dirs
    }

    /// Read a script file, refusing anything over [`MAX_SCRIPT_BYTES`].
    pub fn load_script(path: &Path) -> Result<Vec<u8>> {
        let file = fs::File::open(path)
            .with_context(|| format!("could not read script {}", path.display()))?;
        let mut bytes = Vec::new();
        file.take(MAX_SCRIPT_BYTES + 1)
            .read_to_end(&mut bytes)
            .with_context(|| format!("could not read script {}", path.display()))?;
        if bytes.len() as u64 > MAX_SCRIPT_BYTES {
            return Err(anyhow!(
                "script {} is larger than {} bytes",
                path.display(),
                MAX_SCRIPT_BYTES
            ));
        }
        Ok(bytes)
    }

    /// The next tag scan writes `bytes` instead of running the tag.
    pub fn arm_flash(&mut self, bytes: Vec<u8>) {
        tracing::info!(bytes = bytes.len(), "flash armed; waiting for a tag");
        self.pending_flash = Some(bytes);
    }

    pub fn disarm_flash(&mut self) {
        self.pending_flash = None;
    }

    pub fn is_flash_armed(&self) -> bool {
        self.pending_flash.is_some()
    }

    /// Application became active: take scans directly.
    pub fn resume(&self) {
        self.transport.enable_foreground();
    }

    /// Application went inactive.
    pub fn pause(&self) {
        self.transport.disable_foreground();
    }

    pub fn on_tag_scan(&mut self, event: &mut ScanEvent) -> Result<ScanOutcome> {
        if !event.is_tag_scan() {
            return Ok(ScanOutcome::Ignored);
        }
        if let Some(bytes) = self.pending_flash.take() {
            return Ok(ScanOutcome::Flashed(self.transport.write(event, &bytes)));
        }
        let Some(claim) = self.engine.try_begin() else {
            tracing::info!("tag scanned while a script is running; ignoring");
            return Ok(ScanOutcome::Busy);
        };
        let bytes = self.transport.read(event);
        if bytes.is_empty() {
            return Ok(ScanOutcome::Blank);
        }
        Ok(ScanOutcome::Started(self.start(claim, bytes)?))
    }

    /// Run the text of a scanned 2D code. Codes are not compressed.
    pub fn on_code_scan(&mut self, contents: &str) -> Result<RunHandle> {
        self.run_bytes(contents.as_bytes().to_vec())
    }

    /// Start `bytes` on a worker thread, or only display them in view-only
    /// mode.
    pub fn run_bytes(&self, bytes: Vec<u8>) -> Result<RunHandle> {
        let claim = self
            .engine
            .try_begin()
            .ok_or_else(|| anyhow!("a script is already running"))?;
        self.start(claim, bytes)
    }

    /// The engine is already claimed, so a `kill` issued as soon as this
    /// returns still stops the run.
    fn start(&self, claim: RunClaim, bytes: Vec<u8>) -> Result<RunHandle> {
        let working_dir = self.dirs.prepare(self.settings.auto_clean)?;
        let view_only = self.settings.view_only;

        let handle = if view_only {
            let buffer_size = self.settings.buffer_size;
            std::thread::Builder::new()
                .name("tagsh-view".into())
                .spawn(move || {
                    claim.view(&bytes, buffer_size);
                    Ok(None)
                })
        } else {
            let request = self.request_for(bytes, &working_dir);
            std::thread::Builder::new()
                .name("tagsh-exec".into())
                .spawn(move || claim.execute(&request))
        }
        .context("start script worker")?;

        Ok(RunHandle {
            working_dir,
            view_only,
            handle,
        })
    }

    pub fn request_for(&self, bytes: Vec<u8>, working_dir: &Path) -> ExecutionRequest {
        ExecutionRequest {
            hold_wakelock: self.settings.hold_wakelock,
            wakelock_timeout: Duration::from_secs(self.settings.wakelock_timeout_secs),
            buffer_size: self.settings.buffer_size,
            ..ExecutionRequest::new(bytes, working_dir)
        }
    }

    pub fn kill(&self) {
        self.engine.cancel();
    }

    /// Wipe and recreate the working directory.
    pub fn clean(&self) -> Result<PathBuf> {
        let _claim = self.engine.try_begin().ok_or_else(|| {
            anyhow!("cannot clean the working directory while a script is running")
        })?;
        self.dirs.prepare(true)
    }

    pub fn poller(&self) -> Poller {
        Poller::new(self.engine.clone())
    }
}

/// New lines since the previous poll.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Poll {
    pub lines: Vec<String>,
    /// Lines evicted from the buffer before this poller saw them.
    pub dropped: u64,
}

/// Incremental reader over the engine's rolling buffer.
pub struct Poller {
    engine: Engine,
    generation: u64,
    seen: u64,
}

impl Poller {
    /// Starts at the buffer's current position; only later lines are
    /// reported.
    pub fn new(engine: Engine) -> Self {
        let snap = engine.snapshot();
        Self {
            engine,
            generation: snap.generation,
            seen: snap.total,
        }
    }

    pub fn poll(&mut self) -> Poll {
        let snap = self.engine.snapshot();
        if snap.generation != self.generation {
            self.generation = snap.generation;
            self.seen = 0;
        }
        let fresh = snap.total.saturating_sub(self.seen);
        let available = snap.lines.len() as u64;
        let take = fresh.min(available) as usize;
        self.seen = snap.total;
        Poll {
            lines: snap.lines[snap.lines.len() - take..].to_vec(),
            dropped: fresh - take as u64,
        }
    }
}
