use std::path::PathBuf;
use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_backend() -> String {
    "threads".to_owned()
}

fn default_num_pes() -> usize {
    1
}

fn default_keep_archives() -> bool {
    false
}

fn default_pop_retry_limit() -> usize {
    16
}

fn default_progress_poll_us() -> u64 {
    100
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds for progress waits (barrier, broadcast, get, wait_all)
    /// after which a potential deadlock warning is printed, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// The lamellae backend to use
    /// threads -- multi pe execution, one OS thread per pe, default
    /// local -- single pe execution
    #[serde(default = "default_backend")]
    pub backend: String, //threads,local

    /// Number of pes launched by the threads backend when the builder does not set one, default: 1
    #[serde(default = "default_num_pes")]
    pub num_pes: usize,

    /// Directory holding localize/publish archive files, default: the system temp dir
    pub archive_dir: Option<PathBuf>,

    /// Keep archive files after they have been read back, default: false
    #[serde(default = "default_keep_archives")]
    pub keep_archives: bool,

    /// Number of times the queue owner rescans its backlog when a key vanishes mid pop, default: 16
    #[serde(default = "default_pop_retry_limit")]
    pub pop_retry_limit: usize,

    /// How long (in microseconds) an idle progress wait blocks on the inbox before re-checking, default: 100
    #[serde(default = "default_progress_poll_us")]
    pub progress_poll_us: u64,

    /// flag used to print warnings when a blocking get or wait_all exceeds the deadlock timeout. Default: true
    pub blocking_wait_warning: Option<bool>,
}

impl Config {
    pub(crate) fn archive_dir(&self) -> PathBuf {
        match &self.archive_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir(),
        }
    }
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("REGIONQ_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
