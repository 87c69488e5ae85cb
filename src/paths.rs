//! Centralized path resolution for conmux
//!
//! Single source of truth for all conmux directory and file paths.
//! Respects CONMUX_DIR env var for testing/dev, falls back to ~/.conmux.

use std::path::{Path, PathBuf};

use crate::config::Config;

/// Get the conmux base directory.
///
/// Uses centralized Config (CONMUX_DIR env var or ~/.conmux fallback).
pub fn base_dir() -> PathBuf {
    Config::get().base_dir
}

/// Get the log file path (base_dir/logs/conmux.log)
pub fn log_path() -> PathBuf {
    base_dir().join("logs").join("conmux.log")
}

/// Get a container's state directory (base/<name>)
pub fn container_dir(base: &Path, name: &str) -> PathBuf {
    base.join(name)
}

/// Get a container's command socket path (base/<name>/command.sock)
///
/// The supervisor listens here; attach clients connect to request a
/// console or to deliver a window-change hint.
pub fn command_socket(base: &Path, name: &str) -> PathBuf {
    container_dir(base, name).join("command.sock")
}

/// Default console log path for a container (base/<name>/console.log)
pub fn console_log(base: &Path, name: &str) -> PathBuf {
    container_dir(base, name).join("console.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_socket_under_container_dir() {
        let p = command_socket(Path::new("/var/lib/conmux"), "web1");
        assert_eq!(p, PathBuf::from("/var/lib/conmux/web1/command.sock"));
    }

    #[test]
    fn console_log_under_container_dir() {
        let p = console_log(Path::new("/tmp/x"), "db");
        assert_eq!(p, PathBuf::from("/tmp/x/db/console.log"));
    }
}
