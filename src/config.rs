//! Runtime configuration for the peer and download subsystems: pipeline
//! depth, socket timeouts, and per-piece retry budget (spec §4.4/§5,
//! left as implementer discretion by spec §9's Open Question).
//!
//! There's no config *file* format here — just environment-variable
//! overrides over sensible defaults, matching the scale of the rest of
//! this client's CLI-plus-env approach.
use std::env;
use std::time::Duration;

const DEFAULT_PIPELINE_DEPTH: usize = 5;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BLOCK_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Max concurrent in-flight block requests per peer.
    pub pipeline_depth: usize,
    /// Max idle time on a single socket read/write.
    pub idle_timeout: Duration,
    /// Max total time to fetch one block end-to-end.
    pub block_timeout: Duration,
    /// How many peers may fail a piece before it's abandoned. `None`
    /// means "every known peer gets one attempt" (spec §4.5).
    pub piece_retry_budget: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            block_timeout: Duration::from_secs(DEFAULT_BLOCK_TIMEOUT_SECS),
            piece_retry_budget: None,
        }
    }
}

impl Config {
    /// Reads overrides from the environment, falling back to defaults
    /// when a variable is unset or fails to parse.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            pipeline_depth: env_parse("RSTORRENT_PIPELINE_DEPTH").unwrap_or(defaults.pipeline_depth),
            idle_timeout: env_parse("RSTORRENT_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            block_timeout: env_parse("RSTORRENT_BLOCK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.block_timeout),
            piece_retry_budget: env_parse("RSTORRENT_PIECE_RETRIES"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
