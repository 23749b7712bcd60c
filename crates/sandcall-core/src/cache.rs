//! On-disk cache of compiled guest code.
//!
//! A [`CompilationCache`] owns one uniquely named directory under a
//! configured base directory. Wasmtime writes its compiled artifacts below
//! that directory, so loading the same bytecode twice into engines that share
//! the cache skips recompilation.
//!
//! The directory lives exactly as long as the cache: [`CompilationCache::close`]
//! removes it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sandcall_common::RuntimeError;

/// File name of the wasmtime cache configuration inside the cache directory.
const CONFIG_FILE_NAME: &str = "wasmtime-cache.toml";

/// Subdirectory holding compiled artifacts.
const ARTIFACTS_DIR_NAME: &str = "artifacts";

/// A compiled-code cache rooted in its own directory.
#[derive(Debug)]
pub struct CompilationCache {
    directory: PathBuf,
    config_path: PathBuf,
}

#[derive(Serialize)]
struct CacheConfigFile<'a> {
    cache: CacheSection<'a>,
}

#[derive(Serialize)]
struct CacheSection<'a> {
    enabled: bool,
    directory: &'a Path,
}

impl CompilationCache {
    /// Create a fresh cache directory under `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::EmptyCacheDirectory`] if `base_dir` is empty,
    /// or an I/O error if the directory tree cannot be created.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let base_dir = base_dir.as_ref();
        if base_dir.as_os_str().is_empty() {
            return Err(RuntimeError::EmptyCacheDirectory);
        }

        fs::create_dir_all(base_dir)?;
        // Wasmtime only accepts absolute cache directories.
        let base_dir = fs::canonicalize(base_dir)?;

        let directory = base_dir.join(format!("sandcall-{}", Uuid::new_v4()));
        let artifacts = directory.join(ARTIFACTS_DIR_NAME);
        fs::create_dir_all(&artifacts)?;

        let config_path = directory.join(CONFIG_FILE_NAME);
        let config = CacheConfigFile {
            cache: CacheSection {
                enabled: true,
                directory: &artifacts,
            },
        };
        let contents = toml::to_string(&config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to encode cache configuration: {e}"))
        })?;

        if let Err(e) = fs::write(&config_path, contents) {
            // Don't leave a half-built directory behind.
            let _ = fs::remove_dir_all(&directory);
            return Err(e.into());
        }

        info!(directory = %directory.display(), "Compilation cache opened");

        Ok(Self {
            directory,
            config_path,
        })
    }

    /// Directory owned by this cache.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the wasmtime cache configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Release the cache handle and remove the cache directory.
    ///
    /// Both steps are always attempted. Failures are joined into a single
    /// [`RuntimeError::Cleanup`].
    pub fn close(self) -> Result<(), RuntimeError> {
        let mut failures = Vec::new();

        match fs::remove_file(&self.config_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.config_path.display(), error = %e, "Failed to close cache handle");
                failures.push(RuntimeError::Io(e));
            }
        }

        match fs::remove_dir_all(&self.directory) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(directory = %self.directory.display(), error = %e, "Failed to remove cache directory");
                failures.push(RuntimeError::Io(e));
            }
        }

        debug!(directory = %self.directory.display(), "Compilation cache closed");

        match RuntimeError::join(failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_empty_directory() {
        let result = CompilationCache::open("");
        assert!(matches!(result, Err(RuntimeError::EmptyCacheDirectory)));
    }

    #[test]
    fn test_open_creates_unique_directory() {
        let base = tempfile::tempdir().unwrap();
        let nested = base.path().join("a").join("b");

        let first = CompilationCache::open(&nested).unwrap();
        let second = CompilationCache::open(&nested).unwrap();

        assert_ne!(first.directory(), second.directory());
        assert!(first.directory().is_dir());
        assert!(first.directory().is_absolute());
        assert!(first.config_path().is_file());

        let config = fs::read_to_string(first.config_path()).unwrap();
        assert!(config.contains("enabled = true"));
        assert!(config.contains(ARTIFACTS_DIR_NAME));

        first.close().unwrap();
        second.close().unwrap();
    }

    #[test]
    fn test_close_removes_directory() {
        let base = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(base.path()).unwrap();
        let directory = cache.directory().to_path_buf();

        cache.close().unwrap();

        assert!(!directory.exists());
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_close_tolerates_missing_directory() {
        let base = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(base.path()).unwrap();

        fs::remove_dir_all(cache.directory()).unwrap();

        assert!(cache.close().is_ok());
    }
}
