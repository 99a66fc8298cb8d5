use std::path::PathBuf;
use std::time::Duration;

use crate::sync::backoff::Backoff;
use crate::sync::paths::PathCase;

const DEFAULT_MAX_CONCURRENT_ACTIONS: u64 = 4;
const DEFAULT_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 120;
const DEFAULT_WORKER_POLL_MS: u64 = 1_000;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Directory holding one sub-directory per bookmark.
    pub vault_root: PathBuf,
    pub max_concurrent_actions: usize,
    /// Attempts a transiently failing record gets before it needs attention.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: bool,
    pub action_timeout: Duration,
    pub worker_poll_interval: Duration,
    pub drain_timeout: Duration,
    pub case_sensitive_paths: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            vault_root: default_vault_root(),
            max_concurrent_actions: DEFAULT_MAX_CONCURRENT_ACTIONS as usize,
            max_attempts: DEFAULT_MAX_ATTEMPTS as u32,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            backoff_jitter: true,
            action_timeout: Duration::from_secs(DEFAULT_ACTION_TIMEOUT_SECS),
            worker_poll_interval: Duration::from_millis(DEFAULT_WORKER_POLL_MS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            case_sensitive_paths: true,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let vault_root = std::env::var("CLOUDMIRROR_VAULT_ROOT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_vault_root);
        Self {
            vault_root,
            max_concurrent_actions: read_u64_env(
                "CLOUDMIRROR_MAX_CONCURRENT_ACTIONS",
                DEFAULT_MAX_CONCURRENT_ACTIONS,
            ) as usize,
            max_attempts: read_u64_env("CLOUDMIRROR_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)
                .min(u64::from(u32::MAX)) as u32,
            backoff_base: Duration::from_millis(read_u64_env(
                "CLOUDMIRROR_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )),
            backoff_max: Duration::from_millis(read_u64_env(
                "CLOUDMIRROR_BACKOFF_MAX_MS",
                DEFAULT_BACKOFF_MAX_MS,
            )),
            backoff_jitter: read_bool_env("CLOUDMIRROR_BACKOFF_JITTER", true),
            action_timeout: Duration::from_secs(read_u64_env(
                "CLOUDMIRROR_ACTION_TIMEOUT_SECS",
                DEFAULT_ACTION_TIMEOUT_SECS,
            )),
            worker_poll_interval: Duration::from_millis(read_u64_env(
                "CLOUDMIRROR_WORKER_POLL_MS",
                DEFAULT_WORKER_POLL_MS,
            )),
            drain_timeout: Duration::from_secs(read_u64_env(
                "CLOUDMIRROR_DRAIN_TIMEOUT_SECS",
                DEFAULT_DRAIN_TIMEOUT_SECS,
            )),
            case_sensitive_paths: read_bool_env("CLOUDMIRROR_CASE_SENSITIVE_PATHS", true),
        }
    }

    pub fn path_case(&self) -> PathCase {
        if self.case_sensitive_paths {
            PathCase::Sensitive
        } else {
            PathCase::Insensitive
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max, self.backoff_jitter)
    }
}

pub fn default_vault_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloudmirror")
        .join("vaults")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CoreConfig::default();
        assert_eq!(config.max_concurrent_actions, 4);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.path_case(), PathCase::Sensitive);
        assert!(config.vault_root.ends_with("cloudmirror/vaults"));
    }

    #[test]
    fn u64_env_ignores_zero_and_garbage() {
        // SAFETY: the variable names are unique to this test.
        unsafe {
            std::env::set_var("CLOUDMIRROR_TEST_U64_ZERO", "0");
            std::env::set_var("CLOUDMIRROR_TEST_U64_BAD", "ten");
            std::env::set_var("CLOUDMIRROR_TEST_U64_OK", " 42 ");
        }
        assert_eq!(read_u64_env("CLOUDMIRROR_TEST_U64_ZERO", 7), 7);
        assert_eq!(read_u64_env("CLOUDMIRROR_TEST_U64_BAD", 7), 7);
        assert_eq!(read_u64_env("CLOUDMIRROR_TEST_U64_OK", 7), 42);
        assert_eq!(read_u64_env("CLOUDMIRROR_TEST_U64_MISSING", 7), 7);
    }

    #[test]
    fn bool_env_accepts_common_spellings() {
        // SAFETY: the variable names are unique to this test.
        unsafe {
            std::env::set_var("CLOUDMIRROR_TEST_BOOL_YES", "Yes");
            std::env::set_var("CLOUDMIRROR_TEST_BOOL_OFF", "off");
        }
        assert!(read_bool_env("CLOUDMIRROR_TEST_BOOL_YES", false));
        assert!(!read_bool_env("CLOUDMIRROR_TEST_BOOL_OFF", true));
        assert!(read_bool_env("CLOUDMIRROR_TEST_BOOL_MISSING", true));
    }

    #[test]
    fn case_insensitive_paths_from_flag() {
        let config = CoreConfig {
            case_sensitive_paths: false,
            ..CoreConfig::default()
        };
        assert_eq!(config.path_case(), PathCase::Insensitive);
    }
}
