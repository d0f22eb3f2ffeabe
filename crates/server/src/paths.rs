//! Central path resolution for workflowdock data files.
//!
//! Resolved once at startup from: CLI `--data-dir` (or `WORKFLOWDOCK_DATA_DIR`,
//! handled by clap) > `~/.workflowdock`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME directory not found"))?
            .join(".workflowdock"),
    };

    let mut guard = DATA_DIR
        .write()
        .map_err(|_| io::Error::other("DATA_DIR lock poisoned"))?;
    *guard = Some(dir.clone());
    Ok(dir)
}

/// Return the current data directory, falling back to the default when
/// `init_data_dir` has not run.
pub fn data_dir() -> PathBuf {
    let configured = DATA_DIR.read().ok().and_then(|guard| guard.clone());
    configured.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".workflowdock")
    })
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn log_file_name() -> &'static str {
    "workflowdock.log"
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

/// Reset data dir, for test isolation only.
#[cfg(test)]
pub fn reset_data_dir() {
    if let Ok(mut guard) = DATA_DIR.write() {
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins_and_dirs_are_created() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("wd");

        let resolved = init_data_dir(Some(&base)).expect("init");
        assert_eq!(resolved, base);
        assert_eq!(data_dir(), base);
        assert_eq!(log_dir(), base.join("logs"));

        ensure_dirs().expect("ensure");
        assert!(base.join("logs").is_dir());

        reset_data_dir();
    }
}
