//! Configuration
//!
//! Everything is read from the environment (after `.env` is loaded by the
//! binaries). Tinybird credentials fall back to a `.tinyb` JSON file for
//! local development. Backend credentials are only demanded by the commands
//! that need them.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_GRAMMAR_PATH: &str = "grammar/clickhouse_sql.lark";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const TINYB_FILE: &str = ".tinyb";
/// Sampling temperature for both backends unless `OPENAI_TEMPERATURE` says
/// otherwise. `OPENAI_TEMPERATURE=none` omits the field for models that
/// reject it.
pub const DEFAULT_TEMPERATURE: f32 = 0.1;

/// Which generation backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Responses API with the grammar as a custom tool format
    Constrained,
    /// Chat completions, no grammar constraint
    Freeform,
}

impl BackendKind {
    fn default_model(self) -> &'static str {
        match self {
            BackendKind::Constrained => "gpt-5.1",
            BackendKind::Freeform => "gpt-4o-mini",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constrained" => Ok(BackendKind::Constrained),
            "freeform" => Ok(BackendKind::Freeform),
            other => Err(ConfigError::Invalid {
                key: "GENERATION_MODE".to_string(),
                message: format!("expected 'constrained' or 'freeform', got '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub kind: BackendKind,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TinybirdConfig {
    pub host: String,
    pub token: String,
    pub timeout: Duration,
}

fn default_execution_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub grammar_path: PathBuf,
    pub grammar_root: String,
    pub schema_path: Option<PathBuf>,
    pub server_addr: String,
    pub query_log_path: Option<PathBuf>,
    pub log_level: String,
    generation: Result<GenerationConfig, String>,
    tinybird: Result<TinybirdConfig, String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), Path::new(TINYB_FILE))
    }

    /// Build configuration from an arbitrary variable source. Missing backend
    /// credentials are recorded and only reported when the backend is asked for.
    pub fn from_lookup<F>(lookup: F, tinyb_path: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let generation = match get("OPENAI_API_KEY") {
            Some(api_key) => {
                let kind: BackendKind = get("GENERATION_MODE")
                    .map(|m| m.parse())
                    .transpose()?
                    .unwrap_or(BackendKind::Constrained);
                let temperature = match get("OPENAI_TEMPERATURE") {
                    Some(t) if t.trim().eq_ignore_ascii_case("none") => None,
                    Some(t) => Some(parse_value::<f32>("OPENAI_TEMPERATURE", &t)?),
                    None => Some(DEFAULT_TEMPERATURE),
                };
                Ok(GenerationConfig {
                    kind,
                    api_key,
                    base_url: get("OPENAI_BASE_URL")
                        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                    model: get("OPENAI_MODEL").unwrap_or_else(|| kind.default_model().to_string()),
                    temperature,
                    timeout: seconds(&get, "GENERATION_TIMEOUT_SECS", 120)?,
                })
            }
            None => Err("OPENAI_API_KEY is not set".to_string()),
        };

        let execution_timeout = seconds(&get, "EXECUTION_TIMEOUT_SECS", 30)?;
        let tinybird = load_tinybird(get("TINYBIRD_HOST"), get("TINYBIRD_TOKEN"), tinyb_path)?
            .map(|mut t| {
                t.timeout = execution_timeout;
                t
            })
            .ok_or_else(|| {
                format!(
                    "Tinybird configuration not found. Set TINYBIRD_HOST and TINYBIRD_TOKEN, or provide {}",
                    tinyb_path.display()
                )
            });

        Ok(Self {
            grammar_path: get("GRAMMAR_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_GRAMMAR_PATH)),
            grammar_root: get("GRAMMAR_ROOT").unwrap_or_else(|| "start".to_string()),
            schema_path: get("SCHEMA_PATH").map(PathBuf::from),
            server_addr: get("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            query_log_path: get("QUERY_LOG_PATH").map(PathBuf::from),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            generation,
            tinybird,
        })
    }

    pub fn generation(&self) -> Result<&GenerationConfig, ConfigError> {
        self.generation
            .as_ref()
            .map_err(|e| ConfigError::Missing(e.clone()))
    }

    pub fn tinybird(&self) -> Result<&TinybirdConfig, ConfigError> {
        self.tinybird
            .as_ref()
            .map_err(|e| ConfigError::Missing(e.clone()))
    }
}

/// Environment values win; the `.tinyb` file fills whatever is missing.
fn load_tinybird(
    host: Option<String>,
    token: Option<String>,
    tinyb_path: &Path,
) -> Result<Option<TinybirdConfig>, ConfigError> {
    let (host, token) = match (host, token) {
        (Some(host), Some(token)) => (Some(host), Some(token)),
        (host, token) => match std::fs::read_to_string(tinyb_path) {
            Ok(content) => {
                let file: TinybFile =
                    serde_json::from_str(&content).map_err(|e| ConfigError::File {
                        path: tinyb_path.display().to_string(),
                        message: e.to_string(),
                    })?;
                (host.or(file.host), token.or(file.token))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (host, token),
            Err(e) => {
                return Err(ConfigError::File {
                    path: tinyb_path.display().to_string(),
                    message: e.to_string(),
                })
            }
        },
    };

    Ok(match (host, token) {
        (Some(host), Some(token)) => Some(TinybirdConfig {
            host: host.trim_end_matches('/').to_string(),
            token,
            timeout: default_execution_timeout(),
        }),
        _ => None,
    })
}

#[derive(Deserialize)]
struct TinybFile {
    host: Option<String>,
    token: Option<String>,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn seconds<F>(get: &F, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_secs(
        get(key)
            .map(|v| parse_value::<u64>(key, &v))
            .transpose()?
            .unwrap_or(default),
    ))
}
