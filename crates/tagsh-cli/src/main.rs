use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tagsh_core::image::DEFAULT_CAPACITY;
use tagsh_core::{ImageAdapter, Settings, TagImage, Transport};
use tagsh_runner::{
    AppDirs, Engine, ExecutionOutcome, Poller, RunHandle, ScanOutcome, Session, TimedPower,
    POLL_INTERVAL,
};

/// Erase the terminal and home the cursor.
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Parser)]
#[command(name = "tagsh", version = "0.3.0", about = "Run shell scripts stored on NFC tags")]
struct Cli {
    /// Settings file (defaults to $TAGSH_SETTINGS or the user config dir).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a blank tag image.
    Format {
        image: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        capacity: usize,
        #[arg(long)]
        read_only: bool,
        #[arg(long)]
        json: bool,
    },
    /// Write a script file to a tag image.
    Flash {
        image: PathBuf,
        script: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the script stored on a tag image.
    Read {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Scan a tag image and run its script.
    Scan {
        image: PathBuf,
        /// Kill the script after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Run a local script file the same way a scanned tag would.
    Run {
        script: PathBuf,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Run the decoded text of a 2D code.
    Code {
        contents: String,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Wipe the working directory.
    Clean {
        #[arg(long)]
        json: bool,
    },
    /// Show the effective settings.
    Settings {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command, cli.settings.as_deref());
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tagsh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(command: Commands, settings_path: Option<&Path>) -> Result<Option<Value>> {
    match command {
        Commands::Format {
            image,
            capacity,
            read_only,
            json,
        } => {
            let tag = TagImage::format(&image, capacity, !read_only)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "format",
                    "image": image_to_json(&tag),
                })));
            }
            println!("image: {}", tag.path().display());
            println!("capacity: {}", tag.capacity());
            println!("writable: {}", tag.writable());
        }
        Commands::Flash { image, script, json } => {
            let bytes = Session::load_script(&script)?;
            let mut session = open_session(settings_path, Some(&image))?;
            session.arm_flash(bytes.clone());
            let mut event = TagImage::open(&image)?.scan_event();
            let written = match session.on_tag_scan(&mut event)? {
                ScanOutcome::Flashed(result) => result,
                _ => return Err(anyhow!("flash did not run")),
            };
            written.map_err(|failure| anyhow!("could not write {}: {}", image.display(), failure))?;
            let tag = TagImage::open(&image)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "flash",
                    "script": payload_to_json(&bytes),
                    "image": image_to_json(&tag),
                })));
            }
            println!("flashed: {} bytes ({})", bytes.len(), digest(&bytes));
            println!("tag_used: {} of {}", tag.used(), tag.capacity());
        }
        Commands::Read { image, json } => {
            let event = TagImage::open(&image)?.scan_event();
            let bytes = tagsh_core::transport::read(&event);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "read",
                    "blank": bytes.is_empty(),
                    "script": payload_to_json(&bytes),
                    "script_base64": STANDARD.encode(&bytes),
                })));
            }
            if bytes.is_empty() {
                eprintln!("tag is blank");
            } else {
                std::io::stdout()
                    .write_all(&bytes)
                    .context("write script to stdout")?;
            }
        }
        Commands::Scan {
            image,
            timeout,
            json,
        } => {
            let mut session = open_session(settings_path, Some(&image))?;
            session.resume();
            let poller = session.poller();
            let mut event = TagImage::open(&image)?.scan_event();
            let outcome = session.on_tag_scan(&mut event);
            session.pause();
            let run = match outcome? {
                ScanOutcome::Started(run) => run,
                ScanOutcome::Blank => {
                    if json {
                        return Ok(Some(json!({
                            "ok": true,
                            "command": "scan",
                            "blank": true,
                        })));
                    }
                    eprintln!("tag is blank; nothing to run");
                    return Ok(None);
                }
                ScanOutcome::Busy | ScanOutcome::Ignored | ScanOutcome::Flashed(_) => {
                    return Err(anyhow!("scan of {} did not start a run", image.display()))
                }
            };
            return finish_run(&session, "scan", run, poller, timeout, json);
        }
        Commands::Run {
            script,
            timeout,
            json,
        } => {
            let bytes = Session::load_script(&script)?;
            let session = open_session(settings_path, None)?;
            let poller = session.poller();
            let run = session.run_bytes(bytes)?;
            return finish_run(&session, "run", run, poller, timeout, json);
        }
        Commands::Code {
            contents,
            timeout,
            json,
        } => {
            let mut session = open_session(settings_path, None)?;
            let poller = session.poller();
            let run = session.on_code_scan(&contents)?;
            return finish_run(&session, "code", run, poller, timeout, json);
        }
        Commands::Clean { json } => {
            let session = open_session(settings_path, None)?;
            let dir = session.clean()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "clean",
                    "working_dir": dir.display().to_string(),
                })));
            }
            println!("cleaned: {}", dir.display());
        }
        Commands::Settings { json } => {
            let (settings, source) = load_settings(settings_path)?;
            let dirs = AppDirs::from_env();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "settings",
                    "source": source.map(|p| p.display().to_string()),
                    "settings": settings_to_json(&settings),
                    "working_dir": dirs.best().display().to_string(),
                })));
            }
            match &source {
                Some(path) => println!("source: {}", path.display()),
                None => println!("source: defaults"),
            }
            print_settings(&settings);
            println!("working_dir: {}", dirs.best().display());
        }
    }
    Ok(None)
}

fn load_settings(explicit: Option<&Path>) -> Result<(Settings, Option<PathBuf>)> {
    let path = explicit.map(Path::to_path_buf).or_else(Settings::default_path);
    let settings = match &path {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    Ok((settings, path.filter(|p| p.exists())))
}

fn open_session(settings_path: Option<&Path>, image: Option<&Path>) -> Result<Session> {
    let (settings, _) = load_settings(settings_path)?;
    let adapter = image.map(|image| {
        let dir = match image.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Box::new(ImageAdapter::new(dir)) as Box<dyn tagsh_core::TagAdapter>
    });
    tracing::debug!(?settings, "session settings");
    Ok(Session::new(
        Engine::new(Arc::new(TimedPower)),
        Transport::new(adapter),
        settings,
        AppDirs::from_env(),
    ))
}

/// Stream the run's output until it ends, then report it.
fn finish_run(
    session: &Session,
    command: &str,
    run: RunHandle,
    mut poller: Poller,
    timeout: Option<u64>,
    json: bool,
) -> Result<Option<Value>> {
    let echo = !json && session.settings().show_output;
    if clears_screen(session.settings(), json, std::io::stdout().is_terminal()) {
        print!("{}", CLEAR_SCREEN);
    }
    let deadline = timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut timed_out = false;
    let mut dropped = 0;
    loop {
        let finished = run.is_finished();
        let poll = poller.poll();
        dropped += poll.dropped;
        if echo {
            if poll.dropped > 0 {
                eprintln!("[{} earlier lines dropped]", poll.dropped);
            }
            for line in &poll.lines {
                println!("{}", line);
            }
        }
        if finished {
            break;
        }
        if !timed_out && deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::warn!(timeout_secs = timeout.unwrap_or_default(), "timeout reached; killing script");
            session.kill();
            timed_out = true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let working_dir = run.working_dir.clone();
    let view_only = run.view_only;
    let outcome = run.join()?;
    if json {
        return Ok(Some(json!({
            "ok": outcome.as_ref().map_or(true, ExecutionOutcome::success),
            "command": command,
            "working_dir": working_dir.display().to_string(),
            "view_only": view_only,
            "timed_out": timed_out,
            "dropped_lines": dropped,
            "output": session.engine().output(),
            "outcome": outcome.as_ref().map(outcome_to_json),
        })));
    }
    match outcome {
        None => Ok(None),
        Some(outcome) if outcome.success() => Ok(None),
        Some(outcome) if outcome.cancelled => Err(anyhow!("script was killed")),
        Some(outcome) => match (outcome.exit_code, outcome.signal) {
            (Some(code), _) => Err(anyhow!("script exited with status {}", code)),
            (None, Some(signal)) => Err(anyhow!("script terminated by signal {}", signal)),
            (None, None) => Err(anyhow!("script ended without an exit status")),
        },
    }
}

/// `autoClear` only applies to live output on a terminal.
fn clears_screen(settings: &Settings, json: bool, terminal: bool) -> bool {
    terminal && !json && settings.show_output && settings.auto_clear
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Format { json, .. }
        | Commands::Flash { json, .. }
        | Commands::Read { json, .. }
        | Commands::Scan { json, .. }
        | Commands::Run { json, .. }
        | Commands::Code { json, .. }
        | Commands::Clean { json }
        | Commands::Settings { json } => *json,
    }
}

fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn payload_to_json(bytes: &[u8]) -> Value {
    json!({
        "bytes": bytes.len(),
        "digest": digest(bytes),
    })
}

fn image_to_json(tag: &TagImage) -> Value {
    json!({
        "path": tag.path().display().to_string(),
        "capacity": tag.capacity(),
        "writable": tag.writable(),
        "used": tag.used(),
    })
}

fn outcome_to_json(outcome: &ExecutionOutcome) -> Value {
    json!({
        "exit_code": outcome.exit_code,
        "signal": outcome.signal,
        "cancelled": outcome.cancelled,
        "hold_expired": outcome.hold_expired,
        "lines": outcome.lines,
        "started_at": outcome.started_at.to_rfc3339(),
        "finished_at": outcome.finished_at.to_rfc3339(),
    })
}

fn settings_to_json(settings: &Settings) -> Value {
    json!({
        "autoClean": settings.auto_clean,
        "viewOnly": settings.view_only,
        "holdWakelock": settings.hold_wakelock,
        "wakelockTimeout": settings.wakelock_timeout_secs,
        "bufferSize": settings.buffer_size,
        "autoClear": settings.auto_clear,
        "autoScroll": settings.auto_scroll,
        "showOutput": settings.show_output,
    })
}

fn print_settings(settings: &Settings) {
    println!("autoClean: {}", settings.auto_clean);
    println!("viewOnly: {}", settings.view_only);
    println!("holdWakelock: {}", settings.hold_wakelock);
    println!("wakelockTimeout: {}", settings.wakelock_timeout_secs);
    println!("bufferSize: {}", settings.buffer_size);
    println!("autoClear: {}", settings.auto_clear);
    println!("autoScroll: {}", settings.auto_scroll);
    println!("showOutput: {}", settings.show_output);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn json_flag_is_detected_per_command() {
        let cli = Cli::try_parse_from(["tagsh", "read", "tag.json", "--json"]).expect("parse");
        assert!(command_json_mode(&cli.command));
        let cli = Cli::try_parse_from(["tagsh", "clean"]).expect("parse");
        assert!(!command_json_mode(&cli.command));
    }

    #[test]
    fn settings_flag_is_global() {
        let cli = Cli::try_parse_from(["tagsh", "run", "x.sh", "--settings", "s.yaml", "--timeout", "5"])
            .expect("parse");
        assert_eq!(cli.settings.as_deref(), Some(Path::new("s.yaml")));
        match cli.command {
            Commands::Run { timeout, .. } => assert_eq!(timeout, Some(5)),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn json_errors_carry_code_and_message() {
        let err = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(err["ok"], json!(false));
        assert_eq!(err["error"]["code"], json!("command_failed"));
        assert_eq!(err["error"]["message"], json!("boom"));
    }

    #[test]
    fn auto_clear_only_clears_live_terminal_output() {
        let settings = Settings::default();
        assert!(clears_screen(&settings, false, true));
        assert!(!clears_screen(&settings, true, true));
        assert!(!clears_screen(&settings, false, false));
        let quiet = Settings {
            auto_clear: false,
            ..Settings::default()
        };
        assert!(!clears_screen(&quiet, false, true));
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn flash_then_read_through_an_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("tag.json");
        let script = dir.path().join("hello.sh");
        std::fs::write(&script, b"echo hello\n").expect("write");

        run_command(
            Commands::Format {
                image: image.clone(),
                capacity: 137,
                read_only: false,
                json: false,
            },
            None,
        )
        .expect("format");
        let flashed = run_command(
            Commands::Flash {
                image: image.clone(),
                script,
                json: true,
            },
            Some(&dir.path().join("missing.yaml")),
        )
        .expect("flash")
        .expect("json");
        assert_eq!(flashed["script"]["bytes"], json!(11));

        let read = run_command(Commands::Read { image, json: true }, None)
            .expect("read")
            .expect("json");
        assert_eq!(read["blank"], json!(false));
        assert_eq!(read["script_base64"], json!(STANDARD.encode(b"echo hello\n")));
    }
}
