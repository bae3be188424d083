use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Callback invoked around a whole test run.
#[derive(Clone)]
pub struct RunCallback(Rc<dyn Fn()>);

impl RunCallback {
    pub fn new(func: impl Fn() + 'static) -> Self {
        Self(Rc::new(func))
    }

    pub(crate) fn invoke(&self) {
        (self.0)()
    }
}

impl fmt::Debug for RunCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunCallback(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Ticks an async test may wait before it fails.
    pub default_timeout: u64,
    pub default_ticks_between_tests: u32,
    /// Simulation speed applied while the run is active.
    pub game_speed: f64,
    pub show_progress_gui: bool,
    pub log_to_tracing: bool,
    pub log_to_game: bool,
    pub log_passed_tests: bool,
    pub log_skipped_tests: bool,
    /// Regular expression matched against each test path.
    pub test_pattern: Option<String>,
    /// When non-empty, a test runs only if it carries one of these tags.
    pub tag_whitelist: Vec<String>,
    pub tag_blacklist: Vec<String>,
    pub sound_effects: bool,
    /// Append a trimmed backtrace to errors raised by panicking test code.
    pub capture_backtraces: bool,
    #[serde(skip)]
    pub before_test_run: Option<RunCallback>,
    #[serde(skip)]
    pub after_test_run: Option<RunCallback>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: 60 * 60,
            default_ticks_between_tests: 1,
            game_speed: 1000.0,
            show_progress_gui: true,
            log_to_tracing: true,
            log_to_game: false,
            log_passed_tests: true,
            log_skipped_tests: false,
            test_pattern: None,
            tag_whitelist: Vec::new(),
            tag_blacklist: Vec::new(),
            sound_effects: false,
            capture_backtraces: false,
            before_test_run: None,
            after_test_run: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config at `{path}`: {message}")]
    Parse { path: String, message: String },
    #[error("invalid test_pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("default_timeout must be at least 1 tick")]
    ZeroTimeout,
    #[error("game_speed must be a positive number, got {0}")]
    InvalidGameSpeed(f64),
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let mut deserializer = serde_json::Deserializer::from_str(text);
        let config: Config =
            serde_path_to_error::deserialize(&mut deserializer).map_err(|error| {
                ConfigError::Parse {
                    path: error.path().to_string(),
                    message: error.inner().to_string(),
                }
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if !(self.game_speed.is_finite() && self.game_speed > 0.0) {
            return Err(ConfigError::InvalidGameSpeed(self.game_speed));
        }
        Ok(())
    }

    pub fn with_before_test_run(mut self, func: impl Fn() + 'static) -> Self {
        self.before_test_run = Some(RunCallback::new(func));
        self
    }

    pub fn with_after_test_run(mut self, func: impl Fn() + 'static) -> Self {
        self.after_test_run = Some(RunCallback::new(func));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.default_timeout, 3600);
        assert_eq!(config.default_ticks_between_tests, 1);
        assert_eq!(config.game_speed, 1000.0);
        assert!(config.log_passed_tests);
        assert!(!config.log_skipped_tests);
        assert!(!config.sound_effects);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = Config::from_json_str(r#"{"game_speed": 60, "tag_blacklist": ["slow"]}"#)
            .expect("parse");
        assert_eq!(config.game_speed, 60.0);
        assert_eq!(config.tag_blacklist, vec!["slow".to_string()]);
        assert_eq!(config.default_timeout, 3600);
    }

    #[test]
    fn parse_error_reports_field_path() {
        let error = Config::from_json_str(r#"{"default_timeout": "soon"}"#).expect_err("bad type");
        match error {
            ConfigError::Parse { path, .. } => assert_eq!(path, "default_timeout"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::from_json_str(r#"{"gmae_speed": 2}"#),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(matches!(
            Config::from_json_str(r#"{"default_timeout": 0}"#),
            Err(ConfigError::ZeroTimeout)
        ));
    }
}
