use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

use crate::auth::SessionConfig;
use crate::ledger::{AdminBootstrap, LedgerPolicyConfig};
use crate::retention::RetentionConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub service_name: String,
    pub build_sha: String,
    pub db_url: Option<String>,
    pub log_format: LogFormat,
    pub request_timeout_seconds: u64,
    pub session_signing_key: String,
    pub session_fallback_signing_keys: Vec<String>,
    pub session_issuer: String,
    pub session_audience: String,
    pub session_ttl_seconds: u64,
    pub ledger_policy: LedgerPolicyConfig,
    pub retention: RetentionConfig,
    pub admin_bootstrap: Option<AdminBootstrap>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid LEDGER_BIND_ADDR: {0}")]
    InvalidBindAddr(#[from] AddrParseError),
    #[error("invalid LEDGER_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
    #[error("invalid LEDGER_REQUEST_TIMEOUT_SECONDS: {0}")]
    InvalidRequestTimeoutSeconds(String),
    #[error("invalid LEDGER_SESSION_TTL_SECONDS: {0}")]
    InvalidSessionTtlSeconds(String),
    #[error("invalid ledger policy config: {0}")]
    InvalidLedgerPolicyConfig(String),
    #[error("invalid retention config: {0}")]
    InvalidRetentionConfig(String),
    #[error("invalid admin bootstrap config: {0}")]
    InvalidAdminBootstrap(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("LEDGER_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            env::var("LEDGER_SERVICE_NAME").unwrap_or_else(|_| "grabdesk-ledger".to_string());
        let build_sha = env::var("LEDGER_BUILD_SHA").unwrap_or_else(|_| "dev".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let log_format = parse_log_format(
            env::var("LEDGER_LOG_FORMAT")
                .unwrap_or_else(|_| "text".to_string())
                .as_str(),
        )?;
        let request_timeout_seconds = env::var("LEDGER_REQUEST_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRequestTimeoutSeconds(error.to_string()))?
            .max(1);

        let session_signing_key = env::var("LEDGER_SESSION_SIGNING_KEY")
            .unwrap_or_else(|_| "dev-ledger-session-key".to_string());
        let session_fallback_signing_keys = split_list(
            env::var("LEDGER_SESSION_FALLBACK_SIGNING_KEYS")
                .unwrap_or_default()
                .as_str(),
        );
        let session_issuer = env::var("LEDGER_SESSION_ISSUER")
            .unwrap_or_else(|_| "https://grabdesk.local".to_string());
        let session_audience = env::var("LEDGER_SESSION_AUDIENCE")
            .unwrap_or_else(|_| "grabdesk-ledger".to_string());
        let session_ttl_seconds = env::var("LEDGER_SESSION_TTL_SECONDS")
            .unwrap_or_else(|_| (7 * 24 * 60 * 60).to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidSessionTtlSeconds(error.to_string()))?
            .max(60);

        let lookup = |key: &str| env::var(key).ok();
        let ledger_policy = parse_ledger_policy_from_env(lookup)?;
        let retention = parse_retention_from_env(lookup)?;
        let admin_bootstrap = parse_admin_bootstrap_from_env(lookup)?;

        Ok(Self {
            bind_addr,
            service_name,
            build_sha,
            db_url,
            log_format,
            request_timeout_seconds,
            session_signing_key,
            session_fallback_signing_keys,
            session_issuer,
            session_audience,
            session_ttl_seconds,
            ledger_policy,
            retention,
            admin_bootstrap,
        })
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            signing_key: self.session_signing_key.clone(),
            fallback_signing_keys: self.session_fallback_signing_keys.clone(),
            issuer: self.session_issuer.clone(),
            audience: self.session_audience.clone(),
            ttl_seconds: self.session_ttl_seconds,
            clock_skew_leeway_seconds: 30,
        }
    }
}

fn parse_ledger_policy_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<LedgerPolicyConfig, ConfigError> {
    let defaults = LedgerPolicyConfig::default();

    let min_deposit_cents = parse_i64_env_lookup(
        &lookup,
        "LEDGER_MIN_DEPOSIT_CENTS",
        defaults.min_deposit_cents,
        1,
        i64::MAX,
        ConfigError::InvalidLedgerPolicyConfig,
    )?;
    let default_deposit_network = lookup("LEDGER_DEFAULT_DEPOSIT_NETWORK")
        .map(|raw| raw.trim().to_ascii_uppercase())
        .filter(|value| !value.is_empty())
        .unwrap_or(defaults.default_deposit_network);
    let withdraw_networks = match lookup("LEDGER_WITHDRAW_NETWORKS") {
        Some(raw) => {
            let networks = split_list(&raw)
                .into_iter()
                .map(|value| value.to_ascii_uppercase())
                .collect::<Vec<_>>();
            if networks.is_empty() {
                return Err(ConfigError::InvalidLedgerPolicyConfig(
                    "LEDGER_WITHDRAW_NETWORKS: at least one network is required".to_string(),
                ));
            }
            networks
        }
        None => defaults.withdraw_networks,
    };
    let max_combine_images = parse_u64_env_lookup(
        &lookup,
        "LEDGER_MAX_COMBINE_IMAGES",
        defaults.max_combine_images as u64,
        1,
        64,
        ConfigError::InvalidLedgerPolicyConfig,
    )? as usize;
    let public_base_url = lookup("LEDGER_PUBLIC_BASE_URL")
        .map(|raw| raw.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or(defaults.public_base_url);
    if !public_base_url.starts_with("http://") && !public_base_url.starts_with("https://") {
        return Err(ConfigError::InvalidLedgerPolicyConfig(format!(
            "LEDGER_PUBLIC_BASE_URL: expected http(s) url, got {public_base_url}"
        )));
    }

    let password_hash_cost = parse_u64_env_lookup(
        &lookup,
        "LEDGER_PASSWORD_HASH_COST",
        u64::from(defaults.password_hash_cost),
        4,
        31,
        ConfigError::InvalidLedgerPolicyConfig,
    )? as u32;

    Ok(LedgerPolicyConfig {
        min_deposit_cents,
        default_deposit_network,
        withdraw_networks,
        max_combine_images,
        public_base_url,
        password_hash_cost,
    })
}

fn parse_retention_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<RetentionConfig, ConfigError> {
    let defaults = RetentionConfig::default();
    let enabled = match lookup("LEDGER_RETENTION_ENABLED") {
        Some(raw) => parse_bool(&raw).map_err(|value| {
            ConfigError::InvalidRetentionConfig(format!("LEDGER_RETENTION_ENABLED: {value}"))
        })?,
        None => defaults.enabled,
    };
    let retention_days = parse_i64_env_lookup(
        &lookup,
        "LEDGER_RETENTION_DAYS",
        defaults.retention_days,
        1,
        3_650,
        ConfigError::InvalidRetentionConfig,
    )?;
    let run_hour_utc = parse_u64_env_lookup(
        &lookup,
        "LEDGER_RETENTION_HOUR_UTC",
        u64::from(defaults.run_hour_utc),
        0,
        23,
        ConfigError::InvalidRetentionConfig,
    )? as u32;
    Ok(RetentionConfig {
        enabled,
        retention_days,
        run_hour_utc,
    })
}

fn parse_admin_bootstrap_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<AdminBootstrap>, ConfigError> {
    let phone = lookup("LEDGER_ADMIN_PHONE")
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty());
    let Some(phone) = phone else {
        return Ok(None);
    };
    let password = lookup("LEDGER_ADMIN_PASSWORD")
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ConfigError::InvalidAdminBootstrap(
                "LEDGER_ADMIN_PASSWORD is required when LEDGER_ADMIN_PHONE is set".to_string(),
            )
        })?;
    Ok(Some(AdminBootstrap {
        nickname: lookup("LEDGER_ADMIN_NICKNAME").unwrap_or_else(|| "admin".to_string()),
        invitation_code: lookup("LEDGER_ADMIN_INVITATION_CODE")
            .unwrap_or_else(|| "ADMIN".to_string()),
        phone,
        password,
    }))
}

fn parse_u64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
    error: fn(String) -> ConfigError,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|parse_error| error(format!("{key}: {parse_error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_i64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
    error: fn(String) -> ConfigError,
) -> Result<i64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<i64>()
            .map_err(|parse_error| error(format!("{key}: {parse_error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "text" | "pretty" | "" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        ConfigError, LogFormat, parse_admin_bootstrap_from_env, parse_ledger_policy_from_env,
        parse_log_format, parse_retention_from_env,
    };

    #[test]
    fn ledger_policy_parser_applies_env_overrides() {
        let values = HashMap::from([
            ("LEDGER_MIN_DEPOSIT_CENTS", "5000"),
            ("LEDGER_DEFAULT_DEPOSIT_NETWORK", "bep20"),
            ("LEDGER_WITHDRAW_NETWORKS", "trc20, erc20"),
            ("LEDGER_MAX_COMBINE_IMAGES", "3"),
            ("LEDGER_PUBLIC_BASE_URL", "https://api.grabdesk.example/"),
            ("LEDGER_PASSWORD_HASH_COST", "2"),
        ]);
        let policy = parse_ledger_policy_from_env(|key| values.get(key).map(ToString::to_string))
            .expect("policy parse");
        assert_eq!(policy.min_deposit_cents, 5000);
        assert_eq!(policy.default_deposit_network, "BEP20");
        assert_eq!(policy.withdraw_networks, vec!["TRC20", "ERC20"]);
        assert_eq!(policy.max_combine_images, 3);
        assert_eq!(policy.public_base_url, "https://api.grabdesk.example");
        assert_eq!(policy.password_hash_cost, 4);
    }

    #[test]
    fn ledger_policy_parser_uses_defaults_when_unset() {
        let policy = parse_ledger_policy_from_env(|_| None).expect("policy parse");
        assert_eq!(policy.min_deposit_cents, 2_000);
        assert_eq!(policy.default_deposit_network, "TRC20");
        assert_eq!(policy.withdraw_networks, vec!["BEP20", "TRC20"]);
        assert_eq!(policy.max_combine_images, 5);
        assert_eq!(policy.password_hash_cost, 10);
    }

    #[test]
    fn ledger_policy_parser_rejects_invalid_env_values() {
        let values = HashMap::from([("LEDGER_MIN_DEPOSIT_CENTS", "twenty")]);
        let error = parse_ledger_policy_from_env(|key| values.get(key).map(ToString::to_string))
            .expect_err("invalid value should fail");
        match error {
            ConfigError::InvalidLedgerPolicyConfig(message) => {
                assert!(message.contains("LEDGER_MIN_DEPOSIT_CENTS"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let values = HashMap::from([("LEDGER_WITHDRAW_NETWORKS", " , ")]);
        assert!(
            parse_ledger_policy_from_env(|key| values.get(key).map(ToString::to_string)).is_err()
        );
    }

    #[test]
    fn retention_parser_clamps_hour_and_parses_flag() {
        let values = HashMap::from([
            ("LEDGER_RETENTION_ENABLED", "off"),
            ("LEDGER_RETENTION_DAYS", "0"),
            ("LEDGER_RETENTION_HOUR_UTC", "99"),
        ]);
        let retention = parse_retention_from_env(|key| values.get(key).map(ToString::to_string))
            .expect("retention parse");
        assert!(!retention.enabled);
        assert_eq!(retention.retention_days, 1);
        assert_eq!(retention.run_hour_utc, 23);

        let values = HashMap::from([("LEDGER_RETENTION_ENABLED", "maybe")]);
        let error = parse_retention_from_env(|key| values.get(key).map(ToString::to_string))
            .expect_err("invalid flag should fail");
        assert!(matches!(error, ConfigError::InvalidRetentionConfig(_)));
    }

    #[test]
    fn admin_bootstrap_requires_password() {
        assert!(
            parse_admin_bootstrap_from_env(|_| None)
                .expect("absent bootstrap parses")
                .is_none()
        );

        let values = HashMap::from([("LEDGER_ADMIN_PHONE", "000")]);
        let error =
            parse_admin_bootstrap_from_env(|key| values.get(key).map(ToString::to_string))
                .expect_err("missing password should fail");
        assert!(matches!(error, ConfigError::InvalidAdminBootstrap(_)));

        let values = HashMap::from([
            ("LEDGER_ADMIN_PHONE", "000"),
            ("LEDGER_ADMIN_PASSWORD", "secret"),
        ]);
        let bootstrap =
            parse_admin_bootstrap_from_env(|key| values.get(key).map(ToString::to_string))
                .expect("bootstrap parse")
                .expect("bootstrap present");
        assert_eq!(bootstrap.nickname, "admin");
        assert_eq!(bootstrap.invitation_code, "ADMIN");
    }

    #[test]
    fn log_format_accepts_text_and_json() {
        assert_eq!(parse_log_format("JSON").expect("json"), LogFormat::Json);
        assert_eq!(parse_log_format("text").expect("text"), LogFormat::Text);
        assert!(parse_log_format("xml").is_err());
    }
}
