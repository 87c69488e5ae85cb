//! Configuration loaded from environment variables at startup.
//!
//! Centralizes all CONMUX_* env var access into a single Config struct,
//! providing a single source of truth for path resolution and logging.

use std::path::PathBuf;
use std::sync::Mutex;

/// Global configuration instance, lazily initialized and resettable for tests.
static CONFIG: Mutex<Option<Config>> = Mutex::new(None);

/// Configuration loaded from CONMUX_* environment variables.
///
/// All environment variable access should go through this struct
/// rather than calling env::var directly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base state directory (CONMUX_DIR or ~/.conmux)
    pub base_dir: PathBuf,
    /// Container name for log context (CONMUX_CONTAINER)
    pub container: Option<String>,
    /// Debug logging flag (CONMUX_DEBUG=1)
    pub debug: bool,
}

impl Config {
    /// Initialize global config from environment variables (call once at startup).
    /// Can be called multiple times - subsequent calls are no-ops.
    pub fn init() {
        let mut config = CONFIG.lock().unwrap();
        if config.is_none() {
            *config = Some(Self::from_env());
        }
    }

    /// Get a copy of the global config, initializing from the environment
    /// on first use.
    pub fn get() -> Config {
        let mut config = CONFIG.lock().unwrap();
        config.get_or_insert_with(Self::from_env).clone()
    }

    /// Reset global config (test-only).
    /// Allows tests to reinitialize config with different env vars.
    #[cfg(test)]
    pub fn reset() {
        *CONFIG.lock().unwrap() = None;
    }

    /// Load configuration from environment variables
    fn from_env() -> Self {
        use std::env;

        // CONMUX_DIR: custom directory or ~/.conmux
        let base_dir = if let Ok(dir) = env::var("CONMUX_DIR") {
            PathBuf::from(dir)
        } else if let Ok(home) = env::var("HOME") {
            PathBuf::from(home).join(".conmux")
        } else {
            PathBuf::from(".conmux")
        };

        // CONMUX_CONTAINER: optional container name for log context
        let container = env::var("CONMUX_CONTAINER").ok().filter(|s| !s.is_empty());

        // CONMUX_DEBUG: boolean flag (true if "1")
        let debug = env::var("CONMUX_DEBUG").map(|v| v == "1").unwrap_or(false);

        Self {
            base_dir,
            container,
            debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to set env var for test scope
    fn with_env<F>(key: &str, value: &str, f: F)
    where
        F: FnOnce(),
    {
        // SAFETY: Tests use serial_test to run single-threaded.
        // No data races possible when tests run serially.
        unsafe {
            env::set_var(key, value);
        }
        f();
        unsafe {
            env::remove_var(key);
        }
    }

    /// Helper to clear multiple env vars for test scope
    fn without_env<F>(keys: &[&str], f: F)
    where
        F: FnOnce(),
    {
        let saved: Vec<_> = keys.iter().map(|k| (k, env::var(k).ok())).collect();

        // SAFETY: Tests use serial_test to run single-threaded.
        // No data races possible when tests run serially.
        for key in keys {
            unsafe {
                env::remove_var(key);
            }
        }

        f();

        for (key, val) in saved {
            if let Some(v) = val {
                unsafe {
                    env::set_var(key, v);
                }
            }
        }
    }

    #[test]
    #[serial]
    fn default_base_dir_uses_home_conmux() {
        Config::reset();
        without_env(&["CONMUX_DIR"], || {
            let config = Config::get();

            // Should use ~/.conmux when CONMUX_DIR not set
            let expected = env::var("HOME")
                .map(|h| PathBuf::from(h).join(".conmux"))
                .unwrap();
            assert_eq!(config.base_dir, expected);
        });
    }

    #[test]
    #[serial]
    fn conmux_dir_overrides_home() {
        Config::reset();
        with_env("CONMUX_DIR", "/custom/conmux", || {
            let config = Config::get();
            assert_eq!(config.base_dir, PathBuf::from("/custom/conmux"));
        });
    }

    #[test]
    #[serial]
    fn container_some_when_set() {
        Config::reset();
        with_env("CONMUX_CONTAINER", "web1", || {
            let config = Config::get();
            assert_eq!(config.container, Some("web1".to_string()));
        });
    }

    #[test]
    #[serial]
    fn container_none_when_unset() {
        Config::reset();
        without_env(&["CONMUX_CONTAINER"], || {
            let config = Config::get();
            assert_eq!(config.container, None);
        });
    }

    #[test]
    #[serial]
    fn debug_true_when_1() {
        Config::reset();
        with_env("CONMUX_DEBUG", "1", || {
            let config = Config::get();
            assert!(config.debug);
        });
    }

    #[test]
    #[serial]
    fn debug_false_when_not_1() {
        Config::reset();
        with_env("CONMUX_DEBUG", "0", || {
            let config = Config::get();
            assert!(!config.debug);
        });
    }

    #[test]
    #[serial]
    fn reset_allows_reinit() {
        Config::reset();
        with_env("CONMUX_CONTAINER", "first", || {
            assert_eq!(Config::get().container, Some("first".to_string()));
        });

        Config::reset();
        with_env("CONMUX_CONTAINER", "second", || {
            assert_eq!(Config::get().container, Some("second".to_string()));
        });
    }
}
