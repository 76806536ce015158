use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::AppError;
use crate::sync::DEFAULT_BATCH_SIZE;

pub const HOME_ENV: &str = "TALLYSYNC_HOME";
pub const API_URL_ENV: &str = "TALLYSYNC_API_URL";
pub const TIMEOUT_ENV: &str = "TALLYSYNC_TIMEOUT_SECS";
pub const LOG_ENV: &str = "TALLYSYNC_LOG";

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DIR_NAME: &str = ".tallysync";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub api_url: Url,
    pub timeout: Duration,
    pub batch_size: u64,
}

/// Values given on the command line; each one wins over its environment variable.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub api_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Config {
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self, AppError> {
        Self::resolve_with(overrides, |key| std::env::var(key).ok())
    }

    pub fn resolve_with<F>(overrides: ConfigOverrides, env: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |key: &str| {
            env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let data_dir = match overrides.data_dir {
            Some(dir) => dir,
            None => match env_value(HOME_ENV) {
                Some(dir) => PathBuf::from(dir),
                None => {
                    let home = env_value("HOME").ok_or_else(|| {
                        AppError::InvalidInput(format!(
                            "unable to resolve data directory; set {HOME_ENV} or --data-dir"
                        ))
                    })?;
                    PathBuf::from(home).join(DEFAULT_DIR_NAME)
                }
            },
        };

        let raw_url = overrides
            .api_url
            .or_else(|| env_value(API_URL_ENV))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_url = parse_api_url(&raw_url)?;

        let timeout_secs = match overrides.timeout_secs {
            Some(secs) => secs,
            None => match env_value(TIMEOUT_ENV) {
                Some(raw) => raw.parse::<u64>().map_err(|_| {
                    AppError::InvalidInput(format!(
                        "{TIMEOUT_ENV} must be a whole number of seconds"
                    ))
                })?,
                None => DEFAULT_TIMEOUT_SECS,
            },
        };
        if timeout_secs == 0 {
            return Err(AppError::InvalidInput(
                "timeout must be at least one second".to_string(),
            ));
        }

        Ok(Self {
            data_dir,
            api_url,
            timeout: Duration::from_secs(timeout_secs),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }
}

fn parse_api_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| AppError::InvalidInput(format!("invalid api url '{raw}': {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AppError::InvalidInput(format!(
            "unsupported api url scheme '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_flags_or_env() {
        let config =
            Config::resolve_with(ConfigOverrides::default(), env_of(&[("HOME", "/home/crew")]))
                .expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/home/crew/.tallysync"));
        assert_eq!(config.api_url.as_str(), "http://localhost:8000/");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.batch_size, 20);
    }

    #[test]
    fn env_overrides_defaults_and_flags_override_env() {
        let env = env_of(&[
            ("HOME", "/home/crew"),
            (HOME_ENV, "/data/tallies"),
            (API_URL_ENV, "https://sync.example.org/api"),
            (TIMEOUT_ENV, "12"),
        ]);
        let config = Config::resolve_with(ConfigOverrides::default(), &env).expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/data/tallies"));
        assert_eq!(config.api_url.as_str(), "https://sync.example.org/api");
        assert_eq!(config.timeout, Duration::from_secs(12));

        let config = Config::resolve_with(
            ConfigOverrides {
                data_dir: Some(PathBuf::from("/tmp/override")),
                api_url: Some("http://10.0.0.2:9000".to_string()),
                timeout_secs: Some(5),
            },
            &env,
        )
        .expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/override"));
        assert_eq!(config.api_url.host_str(), Some("10.0.0.2"));
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let env = env_of(&[("HOME", "/home/crew")]);
        let bad_url = Config::resolve_with(
            ConfigOverrides {
                api_url: Some("not a url".to_string()),
                ..Default::default()
            },
            &env,
        );
        assert!(matches!(bad_url, Err(AppError::InvalidInput(_))));

        let ftp = Config::resolve_with(
            ConfigOverrides {
                api_url: Some("ftp://files.example.org".to_string()),
                ..Default::default()
            },
            &env,
        );
        assert!(matches!(ftp, Err(AppError::InvalidInput(_))));

        let zero = Config::resolve_with(
            ConfigOverrides {
                timeout_secs: Some(0),
                ..Default::default()
            },
            &env,
        );
        assert!(matches!(zero, Err(AppError::InvalidInput(_))));

        let words = Config::resolve_with(
            ConfigOverrides::default(),
            env_of(&[("HOME", "/home/crew"), (TIMEOUT_ENV, "soon")]),
        );
        assert!(matches!(words, Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn missing_home_is_reported() {
        let err = Config::resolve_with(ConfigOverrides::default(), env_of(&[])).unwrap_err();
        assert!(err.to_string().contains(HOME_ENV));
    }
}
