//! Client configuration

use std::{
    env,
    path::{Path, PathBuf},
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use strudel_base::RelayUrl;

/// Environment variable overriding [`Config::data_dir`].
pub const DATA_DIR_ENV: &str = "STRUDEL_DATA_DIR";

/// File name of the database inside the data directory.
pub const DATABASE_FILE_NAME: &str = "strudel-1.db";

/// Client configuration
///
/// The config is usually loaded from a TOML file with [`Self::load`].  Missing fields take
/// their default values.
///
/// The struct also implements [`Default`] which creates a config suitable for local
/// development and testing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relays used for accounts which have no relay list of their own.
    pub default_relays: Vec<RelayUrl>,
    /// Where to keep the database.
    pub storage: StorageConfig,
    /// Whether accepted replaceable records are written to the database.
    pub persist_records: bool,
    /// Whether settings requests stay open to receive updates.
    pub live_settings: bool,
}

/// Where the client keeps its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Nothing survives the process.
    Memory,
    /// A database file in the data directory, see [`Config::data_dir`].
    DataDir,
    /// A database file at the given path.
    Path(PathBuf),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_relays: Vec::new(),
            storage: StorageConfig::DataDir,
            persist_records: true,
            live_settings: true,
        }
    }
}

/// Errors when loading the configuration.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("config file {} must be valid toml", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("operating environment provides no directory for application data"))]
    NoDataDir {},
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        toml::from_str(&s).context(ParseSnafu { path })
    }

    /// Get the data directory.
    ///
    /// This is `$STRUDEL_DATA_DIR` if set, otherwise `strudel` in the platform's data
    /// directory.
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        let dir = if let Some(val) = env::var_os(DATA_DIR_ENV) {
            PathBuf::from(val)
        } else {
            dirs_next::data_dir().context(NoDataDirSnafu)?.join("strudel")
        };
        Ok(dir)
    }

    /// Get the path to the database file, `None` for in-memory storage.
    pub fn database_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        match &self.storage {
            StorageConfig::Memory => Ok(None),
            StorageConfig::DataDir => Ok(Some(Self::data_dir()?.join(DATABASE_FILE_NAME))),
            StorageConfig::Path(path) => Ok(Some(path.clone())),
        }
    }
}
