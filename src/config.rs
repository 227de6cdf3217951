//! Engine Configuration
//!
//! Defaults can be overridden per process through environment variables:
//!
//! - `BLOCKRUNNER_MAX_CONCURRENCY`: blocks in flight at once
//! - `BLOCKRUNNER_MAX_ITERATIONS`: cap on a single group's iterations
//! - `BLOCKRUNNER_CHECKPOINT_DIR`: where the CLI keeps paused runs

use std::path::PathBuf;

use log::warn;
use once_cell::sync::Lazy;

pub const DEFAULT_MAX_ITERATIONS: usize = 1000;
pub const DEFAULT_CHECKPOINT_DIR: &str = ".blockrunner/checkpoints";

const ENV_MAX_CONCURRENCY: &str = "BLOCKRUNNER_MAX_CONCURRENCY";
const ENV_MAX_ITERATIONS: &str = "BLOCKRUNNER_MAX_ITERATIONS";
const ENV_CHECKPOINT_DIR: &str = "BLOCKRUNNER_CHECKPOINT_DIR";

/// Environment-derived configuration, read once per process.
static FROM_ENV: Lazy<EngineConfig> =
    Lazy::new(|| EngineConfig::default().with_overrides(|name| std::env::var(name).ok()));

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub max_iterations: usize,
    pub checkpoint_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(1),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
        }
    }
}

fn parse_positive(name: &str, raw: &str) -> Option<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!("Ignoring {}={:?}: expected a positive integer", name, raw);
            None
        }
    }
}

impl EngineConfig {
    /// Defaults with the process environment applied.
    pub fn from_env() -> Self {
        FROM_ENV.clone()
    }

    /// Applies overrides from `lookup` (an environment accessor).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = lookup(ENV_MAX_CONCURRENCY).and_then(|v| parse_positive(ENV_MAX_CONCURRENCY, &v)) {
            self.max_concurrency = n;
        }
        if let Some(n) = lookup(ENV_MAX_ITERATIONS).and_then(|v| parse_positive(ENV_MAX_ITERATIONS, &v)) {
            self.max_iterations = n;
        }
        if let Some(dir) = lookup(ENV_CHECKPOINT_DIR).filter(|v| !v.trim().is_empty()) {
            self.checkpoint_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.max_concurrency >= 1);
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.checkpoint_dir, PathBuf::from(DEFAULT_CHECKPOINT_DIR));
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::default().with_overrides(lookup(&[
            ("BLOCKRUNNER_MAX_CONCURRENCY", "3"),
            ("BLOCKRUNNER_MAX_ITERATIONS", "50"),
            ("BLOCKRUNNER_CHECKPOINT_DIR", "/tmp/cp"),
        ]));
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.checkpoint_dir, PathBuf::from("/tmp/cp"));
    }

    #[test]
    fn test_invalid_overrides_are_ignored() {
        let base = EngineConfig::default();
        let config = base.clone().with_overrides(lookup(&[
            ("BLOCKRUNNER_MAX_CONCURRENCY", "0"),
            ("BLOCKRUNNER_MAX_ITERATIONS", "lots"),
        ]));
        assert_eq!(config, base);
    }

    #[test]
    fn test_concurrency_floor() {
        assert_eq!(EngineConfig::default().with_max_concurrency(0).max_concurrency, 1);
    }
}
