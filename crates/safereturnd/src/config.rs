use safereturn_core::types::ThresholdError;
use safereturn_core::Threshold;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("SAFE_RETURN_CONFIDENCE_THRESHOLD: {0}")]
    Threshold(#[from] ThresholdError),
}

/// Daemon configuration, read once from environment variables at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of reference photos (default: $XDG_DATA_HOME/safe-return/data).
    pub gallery_dir: PathBuf,
    /// CSV or spreadsheet with identifier and name columns.
    pub identity_table: PathBuf,
    /// Minimum confidence for an accept.
    pub threshold: Threshold,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Number of engine threads, each holding its own model instance.
    pub workers: usize,
    /// Representation cache file; `None` when caching is disabled.
    pub cache_path: Option<PathBuf>,
    /// Register on the session bus instead of the system bus (development).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `SAFE_RETURN_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("safe-return");

        let gallery_dir = get("SAFE_RETURN_GALLERY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("data"));

        let identity_table = get("SAFE_RETURN_IDENTITY_TABLE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sheet.xlsx"));

        let model_dir = get("SAFE_RETURN_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(safereturn_core::default_model_dir);

        let threshold = Threshold::new(parse_or(
            &get,
            "SAFE_RETURN_CONFIDENCE_THRESHOLD",
            Threshold::default().value(),
        )?)?;

        let workers: usize = parse_or(&get, "SAFE_RETURN_WORKERS", 1)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                key: "SAFE_RETURN_WORKERS",
                value: "0".into(),
                reason: "at least one worker is required".into(),
            });
        }

        let cache_path = if flag_or(&get, "SAFE_RETURN_CACHE_ENABLED", true)? {
            Some(
                get("SAFE_RETURN_CACHE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| gallery_dir.join(".representations.json")),
            )
        } else {
            None
        };

        Ok(Self {
            gallery_dir,
            identity_table,
            threshold,
            model_dir,
            workers,
            cache_path,
            session_bus: flag_or(&get, "SAFE_RETURN_SESSION_BUS", false)?,
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn flag_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "yes") => Ok(true),
        Some("0" | "false" | "no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
            reason: "expected 0/1".into(),
        }),
    }
}
