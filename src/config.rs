use crate::communicate::CommunicateConfig;
use crate::drm::{TokenGenerator, TRUSTED_CLIENT_TOKEN};
use crate::retry::RetryPolicy;
use crate::subtitle::SubtitleConfig;
use crate::transport::{DEFAULT_ENDPOINT, SEC_MS_GEC_VERSION};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const ENV_ENDPOINT: &str = "EDGE_TTS_ENDPOINT";
pub const ENV_TRUSTED_CLIENT_TOKEN: &str = "EDGE_TTS_TRUSTED_CLIENT_TOKEN";
pub const ENV_GEC_VERSION: &str = "EDGE_TTS_GEC_VERSION";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "EDGE_TTS_CONNECT_TIMEOUT_MS";
pub const ENV_RECEIVE_TIMEOUT_MS: &str = "EDGE_TTS_RECEIVE_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "EDGE_TTS_MAX_RETRIES";
pub const ENV_WORDS_PER_CUE: &str = "EDGE_TTS_WORDS_PER_CUE";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

/// Client settings read from the environment
#[derive(Debug)]
pub struct TtsSettings {
    pub endpoint: Url,
    pub trusted_client_token: SecretString,
    pub gec_version: String,
    pub connect_timeout: Duration,
    pub receive_timeout: Option<Duration>,
    pub max_retries: u32,
    /// `None` disables subtitle collection.
    pub words_per_cue: Option<usize>,
}

impl Default for TtsSettings {
    fn default() -> Self {
        let defaults = CommunicateConfig::default();
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint parses"),
            trusted_client_token: SecretString::from(TRUSTED_CLIENT_TOKEN.to_string()),
            gec_version: SEC_MS_GEC_VERSION.to_string(),
            connect_timeout: defaults.connect_timeout,
            receive_timeout: defaults.receive_timeout,
            max_retries: defaults.retry.max_retries,
            words_per_cue: None,
        }
    }
}

impl TtsSettings {
    /// Load settings from environment variables, falling back to defaults
    pub fn load() -> Result<Self, SettingsError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            let url = Url::parse(endpoint.trim())?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SettingsError::InvalidValue {
                    var: ENV_ENDPOINT.to_string(),
                    reason: format!("expected a ws:// or wss:// URL, got {}", url.scheme()),
                });
            }
            settings.endpoint = url;
        }

        if let Some(token) = lookup(ENV_TRUSTED_CLIENT_TOKEN) {
            settings.trusted_client_token = SecretString::from(token.trim().to_string());
        }

        if let Some(version) = lookup(ENV_GEC_VERSION) {
            settings.gec_version = version.trim().to_string();
        }

        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            if ms == 0 {
                return Err(SettingsError::InvalidValue {
                    var: ENV_CONNECT_TIMEOUT_MS.to_string(),
                    reason: "timeout must be greater than zero".to_string(),
                });
            }
            settings.connect_timeout = Duration::from_millis(ms);
        }

        // 0 disables the receive timeout
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_RECEIVE_TIMEOUT_MS)? {
            settings.receive_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(retries) = parse_var::<u32>(&lookup, ENV_MAX_RETRIES)? {
            settings.max_retries = retries;
        }

        if let Some(words) = parse_var::<usize>(&lookup, ENV_WORDS_PER_CUE)? {
            if words == 0 {
                return Err(SettingsError::InvalidValue {
                    var: ENV_WORDS_PER_CUE.to_string(),
                    reason: "words per cue must be at least 1".to_string(),
                });
            }
            settings.words_per_cue = Some(words);
        }

        Ok(settings)
    }

    pub fn token_generator(&self) -> TokenGenerator {
        TokenGenerator::new(SecretString::from(
            self.trusted_client_token.expose_secret().to_string(),
        ))
    }

    pub fn communicate_config(&self) -> CommunicateConfig {
        CommunicateConfig {
            connect_timeout: self.connect_timeout,
            receive_timeout: self.receive_timeout,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
            subtitle: self
                .words_per_cue
                .map(|words_per_cue| SubtitleConfig { words_per_cue }),
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| SettingsError::InvalidValue {
                    var: var.to_string(),
                    reason: format!("{:?}: {}", raw, e),
                })
        })
        .transpose()
}

/// Load settings, logging what went wrong
pub fn load_settings() -> Result<TtsSettings, SettingsError> {
    match TtsSettings::load() {
        Ok(settings) => {
            log::info!(
                "⚙️ Loaded TTS settings (endpoint: {}, retries: {})",
                settings.endpoint,
                settings.max_retries
            );
            Ok(settings)
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn settings_from(vars: &[(&str, &str)]) -> Result<TtsSettings, SettingsError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TtsSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings.endpoint.as_str(), DEFAULT_ENDPOINT);
        assert_eq!(settings.trusted_client_token.expose_secret(), TRUSTED_CLIENT_TOKEN);
        assert_eq!(settings.gec_version, SEC_MS_GEC_VERSION);
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.receive_timeout, None);
        assert_eq!(settings.max_retries, 3);
        assert!(settings.communicate_config().subtitle.is_none());
    }

    #[test]
    fn test_overrides() {
        let settings = settings_from(&[
            (ENV_ENDPOINT, "ws://127.0.0.1:9000/tts"),
            (ENV_TRUSTED_CLIENT_TOKEN, "ABC123"),
            (ENV_GEC_VERSION, "1-140.0.0.0"),
            (ENV_CONNECT_TIMEOUT_MS, "2500"),
            (ENV_RECEIVE_TIMEOUT_MS, "30000"),
            (ENV_MAX_RETRIES, "0"),
            (ENV_WORDS_PER_CUE, "4"),
        ])
        .unwrap();

        assert_eq!(settings.endpoint.as_str(), "ws://127.0.0.1:9000/tts");
        assert_eq!(settings.token_generator().trusted_client_token(), "ABC123");
        assert_eq!(settings.gec_version, "1-140.0.0.0");

        let config = settings.communicate_config();
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.receive_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(1000));
        assert_eq!(config.subtitle.map(|s| s.words_per_cue), Some(4));
    }

    #[test]
    fn test_zero_receive_timeout_disables_it() {
        let settings = settings_from(&[(ENV_RECEIVE_TIMEOUT_MS, "0")]).unwrap();
        assert_eq!(settings.receive_timeout, None);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            settings_from(&[(ENV_MAX_RETRIES, "many")]),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings_from(&[(ENV_CONNECT_TIMEOUT_MS, "0")]),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings_from(&[(ENV_WORDS_PER_CUE, "0")]),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings_from(&[(ENV_ENDPOINT, "not a url")]),
            Err(SettingsError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            settings_from(&[(ENV_ENDPOINT, "https://example.com")]),
            Err(SettingsError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let settings = settings_from(&[(ENV_MAX_RETRIES, "  "), (ENV_GEC_VERSION, "")]).unwrap();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.gec_version, SEC_MS_GEC_VERSION);
    }

    #[test]
    #[serial]
    fn test_load_reads_process_environment() {
        env::set_var(ENV_MAX_RETRIES, "7");
        env::set_var(ENV_WORDS_PER_CUE, "3");
        let result = TtsSettings::load();
        env::remove_var(ENV_MAX_RETRIES);
        env::remove_var(ENV_WORDS_PER_CUE);

        let settings = result.unwrap();
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.words_per_cue, Some(3));
    }

    #[test]
    #[serial]
    fn test_load_rejects_bad_environment() {
        env::set_var(ENV_CONNECT_TIMEOUT_MS, "soon");
        let result = load_settings();
        env::remove_var(ENV_CONNECT_TIMEOUT_MS);
        assert!(matches!(result, Err(SettingsError::InvalidValue { .. })));
    }
}
