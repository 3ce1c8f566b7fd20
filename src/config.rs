use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_DB_PATH: &str = "roof-dynamics.sqlite";
const DEFAULT_ARTIFACT_DIR: &str = "reports";
const DEFAULT_BUCKET: &str = "reports";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is not a valid URL: {value}")]
    InvalidUrl { key: &'static str, value: String },
    #[error("{key} has an unsupported value: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} is required when {when}")]
    Missing {
        key: &'static str,
        when: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceMode {
    OpenAi,
    Mock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceConfig {
    pub mode: InferenceMode,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactConfig {
    Fs {
        dir: PathBuf,
        public_base_url: String,
    },
    Http {
        storage_url: String,
        bucket: String,
        service_key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageTransportConfig {
    InProcess,
    Http {
        base_url: String,
        service_key: Option<String>,
    },
}

/// Process-wide settings, read once at startup and handed to each component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub log_json: bool,
    pub history_limit: usize,
    /// Bearer token the stage endpoints require, and the one sent to remote stages.
    pub service_key: Option<String>,
    pub inference: InferenceConfig,
    pub artifacts: ArtifactConfig,
    pub stages: StageTransportConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    #[cfg(test)]
    pub fn from_map(values: &std::collections::HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr = get("ROOF_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let db_path = PathBuf::from(get("ROOF_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()));
        let log_json = parse_bool("ROOF_LOG_JSON", get("ROOF_LOG_JSON"), false)?;
        let history_limit = parse_number(
            "ROOF_HISTORY_LIMIT",
            get("ROOF_HISTORY_LIMIT"),
            DEFAULT_HISTORY_LIMIT,
        )?;

        let mode = match get("ROOF_INFERENCE_MODE").as_deref() {
            None | Some("openai") => InferenceMode::OpenAi,
            Some("mock") => InferenceMode::Mock,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "ROOF_INFERENCE_MODE",
                    value: other.to_string(),
                })
            }
        };
        let timeout_secs = parse_number(
            "ROOF_INFERENCE_TIMEOUT_SECS",
            get("ROOF_INFERENCE_TIMEOUT_SECS"),
            DEFAULT_INFERENCE_TIMEOUT_SECS,
        )?;
        let inference = InferenceConfig {
            mode,
            // A missing key is reported by the analysis stage, not at startup.
            api_key: get("OPENAI_API_KEY"),
            base_url: parse_url(
                "ROOF_OPENAI_BASE_URL",
                get("ROOF_OPENAI_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            )?,
            model: get("ROOF_OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
        };

        let artifacts = match get("ROOF_ARTIFACT_BACKEND").as_deref() {
            None | Some("fs") => ArtifactConfig::Fs {
                dir: PathBuf::from(
                    get("ROOF_ARTIFACT_DIR").unwrap_or_else(|| DEFAULT_ARTIFACT_DIR.to_string()),
                ),
                public_base_url: parse_url(
                    "ROOF_PUBLIC_BASE_URL",
                    get("ROOF_PUBLIC_BASE_URL").unwrap_or_else(|| format!("http://{bind_addr}")),
                )?,
            },
            Some("http") => ArtifactConfig::Http {
                storage_url: parse_url(
                    "ROOF_STORAGE_URL",
                    get("ROOF_STORAGE_URL").ok_or(ConfigError::Missing {
                        key: "ROOF_STORAGE_URL",
                        when: "ROOF_ARTIFACT_BACKEND=http",
                    })?,
                )?,
                bucket: get("ROOF_STORAGE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
                service_key: get("ROOF_STORAGE_KEY").ok_or(ConfigError::Missing {
                    key: "ROOF_STORAGE_KEY",
                    when: "ROOF_ARTIFACT_BACKEND=http",
                })?,
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "ROOF_ARTIFACT_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let service_key = get("ROOF_SERVICE_KEY");
        let stages = match get("ROOF_STAGE_TRANSPORT").as_deref() {
            None | Some("in_process") => StageTransportConfig::InProcess,
            Some("http") => StageTransportConfig::Http {
                base_url: parse_url(
                    "ROOF_STAGE_BASE_URL",
                    get("ROOF_STAGE_BASE_URL").ok_or(ConfigError::Missing {
                        key: "ROOF_STAGE_BASE_URL",
                        when: "ROOF_STAGE_TRANSPORT=http",
                    })?,
                )?,
                service_key: service_key.clone(),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "ROOF_STAGE_TRANSPORT",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            bind_addr,
            db_path,
            log_json,
            history_limit,
            service_key,
            inference,
            artifacts,
            stages,
        })
    }
}

fn parse_url(key: &'static str, value: String) -> Result<String, ConfigError> {
    match Url::parse(&value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            Ok(value.trim_end_matches('/').to_string())
        }
        _ => Err(ConfigError::InvalidUrl { key, value }),
    }
}

fn parse_bool(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref() {
        None => Ok(default),
        Some("1" | "true" | "TRUE" | "yes" | "YES") => Ok(true),
        Some("0" | "false" | "FALSE" | "no" | "NO") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key,
            value: other.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}
