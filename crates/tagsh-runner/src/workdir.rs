use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Candidate working directories, best first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    pub external_files: Option<PathBuf>,
    pub external_cache: Option<PathBuf>,
    pub internal_files: PathBuf,
}

impl AppDirs {
    /// `TAGSH_WORKDIR` pins the directory. Otherwise:
    /// `$XDG_DATA_HOME/tagsh/files`, `$XDG_CACHE_HOME/tagsh`,
    /// `$HOME/.tagsh/files` (or the temp dir without a home).
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        if let Some(pinned) = var("TAGSH_WORKDIR") {
            return Self::pinned(pinned);
        }
        let internal_files = var("HOME")
            .map(|home| home.join(".tagsh").join("files"))
            .unwrap_or_else(|| std::env::temp_dir().join("tagsh").join("files"));
        Self {
            external_files: var("XDG_DATA_HOME").map(|d| d.join("tagsh").join("files")),
            external_cache: var("XDG_CACHE_HOME").map(|d| d.join("tagsh")),
            internal_files,
        }
    }

    pub fn pinned(dir: impl Into<PathBuf>) -> Self {
        Self {
            external_files: None,
            external_cache: None,
            internal_files: dir.into(),
        }
    }

    pub fn best(&self) -> &Path {
        self.external_files
            .as_deref()
            .or(self.external_cache.as_deref())
            .unwrap_or(&self.internal_files)
    }

    /// Resolve the working directory, wiping it first when `wipe` is set.
    /// Must not be called while a run is using the directory.
    pub fn prepare(&self, wipe: bool) -> Result<PathBuf> {
        let dir = self.best().to_path_buf();
        if dir.parent().is_none() {
            return Err(anyhow!("refusing to use {} as a working directory", dir.display()));
        }
        if wipe {
            match fs::remove_dir_all(&dir) {
                Ok(()) => tracing::debug!(dir = %dir.display(), "wiped working directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("wipe working directory {}", dir.display()))
                }
            }
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("create working directory {}", dir.display()))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_files_then_cache_then_internal() {
        let mut dirs = AppDirs {
            external_files: Some(PathBuf::from("/ext/files")),
            external_cache: Some(PathBuf::from("/ext/cache")),
            internal_files: PathBuf::from("/int/files"),
        };
        assert_eq!(dirs.best(), Path::new("/ext/files"));
        dirs.external_files = None;
        assert_eq!(dirs.best(), Path::new("/ext/cache"));
        dirs.external_cache = None;
        assert_eq!(dirs.best(), Path::new("/int/files"));
    }

    #[test]
    fn prepare_wipes_only_on_request() {
        let root = tempfile::tempdir().expect("tempdir");
        let dirs = AppDirs::pinned(root.path().join("work"));

        let dir = dirs.prepare(false).expect("prepare");
        fs::write(dir.join("left.txt"), b"x").expect("write");

        let again = dirs.prepare(false).expect("prepare");
        assert!(again.join("left.txt").exists());

        let wiped = dirs.prepare(true).expect("prepare");
        assert!(wiped.is_dir());
        assert_eq!(fs::read_dir(&wiped).expect("read_dir").count(), 0);
    }

    #[test]
    fn filesystem_root_is_refused() {
        assert!(AppDirs::pinned("/").prepare(true).is_err());
    }
}
