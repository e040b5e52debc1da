//! Configuration management for snapdisk.
//!
//! Reads configuration from environment variables. The binary merges an
//! optional `.env` file into the environment first (via dotenvy), so
//! variables already set in the environment take precedence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::RetryPolicy;

/// Environment override for the staging parent directory.
pub const TMPDIR_VAR: &str = "TMPDIR";
/// Number of attempts for busy detach/remove calls.
pub const RETRY_ATTEMPTS_VAR: &str = "SNAPDISK_RETRY_ATTEMPTS";
/// Initial backoff for busy detach/remove calls, in milliseconds.
pub const RETRY_DELAY_VAR: &str = "SNAPDISK_RETRY_DELAY_MS";

/// Snapdisk configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Staging parent from `TMPDIR`, if set.
    pub tmpdir: Option<PathBuf>,
    /// Retry policy for detach/remove.
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build configuration from explicit key/value pairs.
    ///
    /// Malformed numbers fall back to the defaults with a warning.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let defaults = RetryPolicy::default();

        let tmpdir = vars
            .get(TMPDIR_VAR)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let attempts = parse_var(&vars, RETRY_ATTEMPTS_VAR)
            .filter(|&n: &u32| n > 0)
            .unwrap_or(defaults.attempts);

        let initial_delay = parse_var(&vars, RETRY_DELAY_VAR)
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_delay);

        Self {
            tmpdir,
            retry: RetryPolicy {
                attempts,
                initial_delay,
            },
        }
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        match &self.tmpdir {
            Some(dir) => println!("  {}: {}", TMPDIR_VAR, dir.display()),
            None => println!("  {}: (unset, probing /var/tmp and /tmp)", TMPDIR_VAR),
        }
        println!("  {}: {}", RETRY_ATTEMPTS_VAR, self.retry.attempts);
        println!(
            "  {}: {}",
            RETRY_DELAY_VAR,
            self.retry.initial_delay.as_millis()
        );
    }
}

fn parse_var<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = vars.get(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed configuration value");
            None
        }
    }
}
