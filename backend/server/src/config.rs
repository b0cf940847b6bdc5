use std::{
    env,
    fmt::Display,
    fs::read_to_string,
    io::{self, ErrorKind},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use codec::{CodecError, Pepper};
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_SECRETS_DIR: &str = "/run/secrets";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Failed to read secret {name}: {source}")]
    Secret { name: String, source: io::Error },

    #[error("Secret {name} unusable: {source}")]
    Pepper { name: String, source: CodecError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("expected redis or memory, got {other:?}")),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub store: StoreBackend,
    pub store_timeout: Duration,
    pub public_base_url: String,
    pub pepper: Pepper,
    pub retired_peppers: Vec<Pepper>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let secrets = SecretsDir::from_env();

        Ok(Self {
            port: try_load("RUST_PORT", "1111")?,
            redis_url: try_load("REDIS_URL", "redis://127.0.0.1:6379")?,
            store: try_load("CSL_STORE", "redis")?,
            store_timeout: Duration::from_millis(try_load("STORE_TIMEOUT_MS", "500")?),
            public_base_url: try_load("PUBLIC_BASE_URL", "http://localhost:1111")?,
            pepper: secrets.pepper("CSL_PEPPER")?,
            retired_peppers: secrets.retired_peppers("CSL_PEPPER_RETIRED")?,
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
        }
    })
}

struct SecretsDir(PathBuf);

impl SecretsDir {
    fn from_env() -> Self {
        Self(PathBuf::from(
            var("SECRETS_DIR").unwrap_or_else(|| DEFAULT_SECRETS_DIR.to_string()),
        ))
    }

    fn read(&self, secret_name: &str) -> Result<Option<String>, ConfigError> {
        let path = self.0.join(secret_name);

        match read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!("Failed to read {secret_name} from file: {e}");
                Err(ConfigError::Secret {
                    name: secret_name.to_string(),
                    source: e,
                })
            }
        }
    }

    fn pepper(&self, secret_name: &str) -> Result<Pepper, ConfigError> {
        let contents = self.read(secret_name)?.ok_or_else(|| ConfigError::Secret {
            name: secret_name.to_string(),
            source: io::Error::new(ErrorKind::NotFound, "secret file missing"),
        })?;

        Pepper::new(contents.trim()).map_err(|source| ConfigError::Pepper {
            name: secret_name.to_string(),
            source,
        })
    }

    /// One pepper per line, blank lines skipped. A missing file means no retired peppers.
    fn retired_peppers(&self, secret_name: &str) -> Result<Vec<Pepper>, ConfigError> {
        let Some(contents) = self.read(secret_name)? else {
            return Ok(Vec::new());
        };

        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                Pepper::new(line).map_err(|source| ConfigError::Pepper {
                    name: secret_name.to_string(),
                    source,
                })
            })
            .collect()
    }
}
