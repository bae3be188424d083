use std::num::ParseIntError;
use std::path::PathBuf;

use thiserror::Error;
use ticktest::{Config, ConfigError, MemoryStore, CONFIG_ENV_VAR, STATE_DIR_ENV_VAR};
use tracing::info;
use tracing_subscriber::EnvFilter;

use super::sim_loop::StoreSource;

const MAX_TICKS_ENV_VAR: &str = "TICKTEST_MAX_TICKS";
const DEFAULT_MAX_TICKS: u64 = 100_000;

#[derive(Debug, Error)]
pub(crate) enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid {var} value `{raw}`: {source}")]
    MaxTicks {
        var: &'static str,
        raw: String,
        #[source]
        source: ParseIntError,
    },
}

pub(crate) struct SimWiring {
    pub(crate) config: Config,
    pub(crate) store: StoreSource,
    pub(crate) max_ticks: u64,
}

pub(crate) fn build_sim() -> Result<SimWiring, BootstrapError> {
    init_tracing();
    info!("=== ticktest sim startup ===");

    let config = match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) => Config::from_json_file(&PathBuf::from(path))?,
        None => Config::default(),
    };
    let config = config
        .with_before_test_run(|| info!("before_test_run"))
        .with_after_test_run(|| info!("after_test_run"));

    let store = match std::env::var_os(STATE_DIR_ENV_VAR) {
        Some(dir) => StoreSource::Dir(PathBuf::from(dir)),
        None => StoreSource::Memory(MemoryStore::new()),
    };
    let max_ticks = parse_max_ticks(std::env::var(MAX_TICKS_ENV_VAR).ok())?;
    info!(?store, max_ticks, "sim_wiring_ready");

    Ok(SimWiring {
        config,
        store,
        max_ticks,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

fn parse_max_ticks(raw: Option<String>) -> Result<u64, BootstrapError> {
    let Some(raw) = raw.map(|value| value.trim().to_string()) else {
        return Ok(DEFAULT_MAX_TICKS);
    };
    if raw.is_empty() {
        return Ok(DEFAULT_MAX_TICKS);
    }
    raw.parse().map_err(|source| BootstrapError::MaxTicks {
        var: MAX_TICKS_ENV_VAR,
        raw,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_ticks_defaults_when_unset_or_blank() {
        assert_eq!(parse_max_ticks(None).expect("unset"), DEFAULT_MAX_TICKS);
        assert_eq!(
            parse_max_ticks(Some("  ".to_string())).expect("blank"),
            DEFAULT_MAX_TICKS
        );
        assert_eq!(parse_max_ticks(Some(" 250 ".to_string())).expect("set"), 250);
    }

    #[test]
    fn max_ticks_rejects_garbage() {
        let err = parse_max_ticks(Some("lots".to_string())).expect_err("garbage");
        assert!(err.to_string().starts_with("invalid TICKTEST_MAX_TICKS value `lots`"));
    }
}
