//! User settings consumed by the session controller.
//!
//! Settings come from a YAML document with camelCase keys. Numeric values
//! may be written as numbers or strings; a blank or unparsable value falls
//! back to its default and every parsed value is floored at 1.

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_WAKELOCK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BUFFER_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("read settings {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse settings {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Wipe the working directory before each run.
    pub auto_clean: bool,
    /// Show the script instead of running it.
    pub view_only: bool,
    pub hold_wakelock: bool,
    pub wakelock_timeout_secs: u64,
    /// Lines of output kept in the rolling buffer.
    pub buffer_size: usize,
    // Presentation only; none of these change what runs.
    /// Clear the output view before each run.
    pub auto_clear: bool,
    /// Keep the newest line in view. A terminal always does.
    pub auto_scroll: bool,
    /// Echo script output while it runs.
    pub show_output: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_clean: true,
            view_only: false,
            hold_wakelock: true,
            wakelock_timeout_secs: DEFAULT_WAKELOCK_TIMEOUT_SECS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            auto_clear: true,
            auto_scroll: true,
            show_output: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    auto_clean: Option<bool>,
    view_only: Option<bool>,
    hold_wakelock: Option<bool>,
    wakelock_timeout: Option<RawNumber>,
    buffer_size: Option<RawNumber>,
    auto_clear: Option<bool>,
    auto_scroll: Option<bool>,
    show_output: Option<bool>,
}

impl Settings {
    /// Parse a settings document. An empty document yields the defaults.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let raw: Option<RawSettings> = serde_yaml::from_str(text)?;
        Ok(Self::from_raw(raw.unwrap_or_default()))
    }

    /// Load `path`; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_yaml(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `TAGSH_SETTINGS`, else `$XDG_CONFIG_HOME/tagsh/settings.yaml`, else
    /// `~/.config/tagsh/settings.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os("TAGSH_SETTINGS").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(path));
        }
        let config = std::env::var_os("XDG_CONFIG_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(config.join("tagsh").join("settings.yaml"))
    }

    fn from_raw(raw: RawSettings) -> Self {
        let defaults = Self::default();
        Self {
            auto_clean: raw.auto_clean.unwrap_or(defaults.auto_clean),
            view_only: raw.view_only.unwrap_or(defaults.view_only),
            hold_wakelock: raw.hold_wakelock.unwrap_or(defaults.hold_wakelock),
            wakelock_timeout_secs: parse_floored(
                raw.wakelock_timeout.as_ref(),
                defaults.wakelock_timeout_secs,
            ),
            buffer_size: parse_floored(raw.buffer_size.as_ref(), defaults.buffer_size as u64)
                as usize,
            auto_clear: raw.auto_clear.unwrap_or(defaults.auto_clear),
            auto_scroll: raw.auto_scroll.unwrap_or(defaults.auto_scroll),
            show_output: raw.show_output.unwrap_or(defaults.show_output),
        }
    }
}

fn parse_floored(raw: Option<&RawNumber>, default: u64) -> u64 {
    let parsed = match raw {
        None => None,
        Some(RawNumber::Int(n)) => Some(*n),
        Some(RawNumber::Float(f)) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
        Some(RawNumber::Float(_)) => None,
        Some(RawNumber::Text(text)) => text.trim().parse::<i64>().ok(),
    };
    match parsed {
        Some(n) => n.max(1) as u64,
        None => default,
    }
}
