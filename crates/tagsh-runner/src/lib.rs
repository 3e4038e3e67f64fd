pub mod engine;
pub mod session;
pub mod wake;
pub mod workdir;

pub use engine::{Engine, ExecutionOutcome, ExecutionRequest, OutputBuffer, RunClaim, Snapshot};
pub use session::{Poll, Poller, RunHandle, ScanOutcome, Session, MAX_SCRIPT_BYTES, POLL_INTERVAL};
pub use wake::{NoPower, PowerManager, TimedPower, TimedWakeHold, WakeHold, WAKE_HOLD_TAG};
pub use workdir::AppDirs;
