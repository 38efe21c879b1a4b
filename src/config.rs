use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Looked up next to the executable unless `--config` is given
pub const CONFIG_FILE_NAME: &str = "jobs_done.toml";
const ENV_PREFIX: &str = "JOBS_DONE";

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct Settings {
    pub user: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub color: Option<bool>,
}

impl Settings {
    /// Read `path` (if present) and `JOBS_DONE_*` environment variables
    pub fn new(path: &Path) -> Result<Self, ConfigError> {
        Self::from_sources(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn from_sources(path: &Path, env: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(env)
            .build()?
            .try_deserialize()
    }
}
