//! Configuration types, read from `UBOT_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::devices::DeviceRegistry;
use crate::error::ConfigError;

pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_TMP_FILES_PATH: &str = "/files/";
pub const DEFAULT_CONVERTER: &str = "ebook-convert";
pub const DEFAULT_CONVERT_TIMEOUT: Duration = Duration::from_secs(300);

/// Bot configuration.
#[derive(Debug)]
pub struct BotConfig {
    /// Telegram Bot API token.
    pub token: SecretString,
    /// Sender address; also the SMTP username.
    pub email_from: String,
    /// Single-device fallback destination.
    pub email_to: Option<String>,
    /// Labeled destinations for the device picker.
    pub devices: DeviceRegistry,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub password: SecretString,
    /// Skip TLS certificate verification when talking to the SMTP server.
    pub smtp_insecure: bool,
    /// Root directory for staged uploads.
    pub tmp_files_path: PathBuf,
    /// Telegram usernames or numeric ids allowed to use the bot (`*` = everyone).
    pub allowed_users: Vec<String>,
    /// Converter executable, invoked as `<converter> <input> <output>`.
    pub converter: String,
    pub convert_timeout: Duration,
    /// Age after which an unanswered device choice is discarded. `None` keeps
    /// pending sessions until they are consumed or superseded.
    pub session_ttl: Option<Duration>,
    /// Directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl BotConfig {
    /// Read and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read and validate configuration from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let smtp_port = match get("UBOT_SMTP_PORT") {
            Some(raw) => Some(parse_port("UBOT_SMTP_PORT", &raw)?),
            None => None,
        };
        let convert_timeout = match get("UBOT_CONVERT_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_secs("UBOT_CONVERT_TIMEOUT_SECS", &raw)?),
            None => DEFAULT_CONVERT_TIMEOUT,
        };
        let session_ttl = match get("UBOT_SESSION_TTL_SECS") {
            Some(raw) => {
                let secs = parse_secs("UBOT_SESSION_TTL_SECS", &raw)?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };

        let (smtp_host, smtp_port) =
            split_host_port(get("UBOT_SMTP_HOST").unwrap_or_default(), smtp_port)?;

        let allowed_users = get("UBOT_ALLOWED_USERS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            token: SecretString::from(get("UBOT_TELEGRAM_TOKEN").unwrap_or_default()),
            email_from: get("UBOT_EMAIL_FROM").unwrap_or_default(),
            email_to: get("UBOT_EMAIL_TO"),
            devices: DeviceRegistry::parse(&get("UBOT_KINDLE_DEVICES").unwrap_or_default()),
            smtp_host,
            smtp_port,
            password: SecretString::from(get("UBOT_PASSWORD").unwrap_or_default()),
            smtp_insecure: get("UBOT_SMTP_INSECURE").is_some_and(|v| is_truthy(&v)),
            tmp_files_path: get("UBOT_TMP_FILES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TMP_FILES_PATH)),
            allowed_users,
            converter: get("UBOT_CONVERTER").unwrap_or_else(|| DEFAULT_CONVERTER.to_string()),
            convert_timeout,
            session_ttl,
            log_dir: get("UBOT_LOG_DIR").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that everything the pipeline needs is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        use secrecy::ExposeSecret;

        if self.token.expose_secret().is_empty() {
            return Err(missing("UBOT_TELEGRAM_TOKEN", "Token for telegram bot not set"));
        }
        if self.password.expose_secret().is_empty() {
            return Err(missing("UBOT_PASSWORD", "Password for email not set"));
        }
        if self.email_from.is_empty() {
            return Err(missing("UBOT_EMAIL_FROM", "Sender address not set"));
        }
        if self.email_to.is_none() && self.devices.is_empty() {
            return Err(missing(
                "UBOT_EMAIL_TO",
                "Set UBOT_EMAIL_TO or UBOT_KINDLE_DEVICES with at least one device",
            ));
        }
        if self.smtp_host.is_empty() {
            return Err(missing("UBOT_SMTP_HOST", "SMTP host not set"));
        }
        Ok(())
    }
}

fn missing(key: &str, hint: &str) -> ConfigError {
    ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    }
}

fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn parse_port(key: &str, raw: &str) -> Result<u16, ConfigError> {
    raw.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?} is not a port: {e}"),
    })
}

fn parse_secs(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?} is not a number of seconds: {e}"),
    })
}

/// Strip an embedded `:port` from the host.
///
/// The embedded port is used unless an explicit, non-default port was set.
fn split_host_port(host: String, port: Option<u16>) -> Result<(String, u16), ConfigError> {
    match host.split_once(':') {
        Some((name, embedded)) => {
            let port = match port {
                Some(p) if p != DEFAULT_SMTP_PORT => p,
                _ => parse_port("UBOT_SMTP_HOST", embedded)?,
            };
            Ok((name.to_string(), port))
        }
        None => Ok((host, port.unwrap_or(DEFAULT_SMTP_PORT))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("UBOT_TELEGRAM_TOKEN", "hello"),
            ("UBOT_EMAIL_FROM", "from@example.com"),
            ("UBOT_EMAIL_TO", "to@kindle.com"),
            ("UBOT_SMTP_HOST", "smtp.example.com"),
            ("UBOT_SMTP_PORT", "587"),
            ("UBOT_PASSWORD", "pass"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<BotConfig, ConfigError> {
        BotConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    fn missing_key(err: ConfigError) -> String {
        match err {
            ConfigError::MissingRequired { key, .. } => key,
            other => panic!("expected MissingRequired, got {other:?}"),
        }
    }

    #[test]
    fn passes_with_all_required_fields() {
        let cfg = load(&base_env()).unwrap();
        assert_eq!(cfg.token.expose_secret(), "hello");
        assert_eq!(cfg.smtp_port, 587);
        assert_eq!(cfg.tmp_files_path, PathBuf::from(DEFAULT_TMP_FILES_PATH));
        assert_eq!(cfg.allowed_users, vec!["*"]);
        assert_eq!(cfg.converter, DEFAULT_CONVERTER);
        assert!(cfg.session_ttl.is_none());
        assert!(!cfg.smtp_insecure);
    }

    #[test]
    fn fails_without_token() {
        let mut env = base_env();
        env.remove("UBOT_TELEGRAM_TOKEN");
        assert_eq!(missing_key(load(&env).unwrap_err()), "UBOT_TELEGRAM_TOKEN");
    }

    #[test]
    fn fails_without_password() {
        let mut env = base_env();
        env.insert("UBOT_PASSWORD", "");
        assert_eq!(missing_key(load(&env).unwrap_err()), "UBOT_PASSWORD");
    }

    #[test]
    fn fails_without_email_from() {
        let mut env = base_env();
        env.remove("UBOT_EMAIL_FROM");
        assert_eq!(missing_key(load(&env).unwrap_err()), "UBOT_EMAIL_FROM");
    }

    #[test]
    fn fails_without_any_destination() {
        let mut env = base_env();
        env.remove("UBOT_EMAIL_TO");
        assert_eq!(missing_key(load(&env).unwrap_err()), "UBOT_EMAIL_TO");
    }

    #[test]
    fn device_registry_satisfies_destination_requirement() {
        let mut env = base_env();
        env.remove("UBOT_EMAIL_TO");
        env.insert("UBOT_KINDLE_DEVICES", "Oasis:b@kindle.com");
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.devices.get("Oasis"), Some("b@kindle.com"));
    }

    #[test]
    fn invalid_registry_entries_do_not_count_as_destinations() {
        let mut env = base_env();
        env.remove("UBOT_EMAIL_TO");
        env.insert("UBOT_KINDLE_DEVICES", "Oasis:not-an-email");
        assert_eq!(missing_key(load(&env).unwrap_err()), "UBOT_EMAIL_TO");
    }

    #[test]
    fn fails_without_smtp_host() {
        let mut env = base_env();
        env.remove("UBOT_SMTP_HOST");
        assert_eq!(missing_key(load(&env).unwrap_err()), "UBOT_SMTP_HOST");
    }

    #[test]
    fn default_smtp_port_when_not_provided() {
        let mut env = base_env();
        env.remove("UBOT_SMTP_PORT");
        assert_eq!(load(&env).unwrap().smtp_port, DEFAULT_SMTP_PORT);
    }

    #[test]
    fn port_embedded_in_host_is_used() {
        let mut env = base_env();
        env.remove("UBOT_SMTP_PORT");
        env.insert("UBOT_SMTP_HOST", "smtp.example.com:2525");
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.smtp_host, "smtp.example.com");
        assert_eq!(cfg.smtp_port, 2525);
    }

    #[test]
    fn explicit_port_wins_over_embedded_port() {
        let mut env = base_env();
        env.insert("UBOT_SMTP_HOST", "smtp.example.com:2525");
        env.insert("UBOT_SMTP_PORT", "465");
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.smtp_host, "smtp.example.com");
        assert_eq!(cfg.smtp_port, 465);
    }

    #[test]
    fn embedded_port_wins_over_default_explicit_port() {
        let mut env = base_env();
        env.insert("UBOT_SMTP_HOST", "smtp.example.com:465");
        env.insert("UBOT_SMTP_PORT", "587");
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.smtp_host, "smtp.example.com");
        assert_eq!(cfg.smtp_port, 465);
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut env = base_env();
        env.insert("UBOT_SMTP_PORT", "smtp");
        assert!(matches!(
            load(&env).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn insecure_flag_variants() {
        let cases = [
            ("true", true),
            ("TRUE", true),
            ("1", true),
            ("yes", false),
            ("0", false),
        ];
        for (raw, expected) in cases {
            let mut env = base_env();
            env.insert("UBOT_SMTP_INSECURE", raw);
            assert_eq!(load(&env).unwrap().smtp_insecure, expected, "{raw}");
        }
    }

    #[test]
    fn custom_tmp_path_and_allowed_users() {
        let mut env = base_env();
        env.insert("UBOT_TMP_FILES_PATH", "/custom/path");
        env.insert("UBOT_ALLOWED_USERS", "alice, 12345 ,");
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.tmp_files_path, PathBuf::from("/custom/path"));
        assert_eq!(cfg.allowed_users, vec!["alice", "12345"]);
    }

    #[test]
    fn session_ttl_zero_means_disabled() {
        let mut env = base_env();
        env.insert("UBOT_SESSION_TTL_SECS", "0");
        assert!(load(&env).unwrap().session_ttl.is_none());

        env.insert("UBOT_SESSION_TTL_SECS", "900");
        assert_eq!(load(&env).unwrap().session_ttl, Some(Duration::from_secs(900)));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = load(&base_env()).unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hello"));
        assert!(!dbg.contains("\"pass\""));
    }
}
