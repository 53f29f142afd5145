// Secret resolution: environment variable, then system keyring, then plaintext.

use secrecy::SecretString;
use strum::{Display, EnumString};

use crate::{Config, ConfigError};

const KEYRING_SERVICE: &str = "direktive";

/// The secrets the bridge needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum SecretKind {
    ApiKey,
    EncryptionKey,
    HassToken,
}

impl SecretKind {
    fn describe(self) -> &'static str {
        match self {
            Self::ApiKey => "Direktive.ai API key",
            Self::EncryptionKey => "payload encryption key",
            Self::HassToken => "Home Assistant access token",
        }
    }

    fn env_name(self, cfg: &Config) -> Option<&str> {
        match self {
            Self::ApiKey => cfg.cloud.api_key_env.as_deref(),
            Self::EncryptionKey => cfg.cloud.encryption_key_env.as_deref(),
            Self::HassToken => cfg.home_assistant.token_env.as_deref(),
        }
    }

    fn plaintext(self, cfg: &Config) -> Option<&str> {
        match self {
            Self::ApiKey => cfg.cloud.api_key.as_deref(),
            Self::EncryptionKey => cfg.cloud.encryption_key.as_deref(),
            Self::HassToken => cfg.home_assistant.token.as_deref(),
        }
    }
}

fn entry(kind: SecretKind) -> Result<keyring::Entry, ConfigError> {
    Ok(keyring::Entry::new(KEYRING_SERVICE, &kind.to_string())?)
}

pub(crate) fn resolve_optional(
    cfg: &Config,
    kind: SecretKind,
) -> Result<Option<SecretString>, ConfigError> {
    // 1. Env var named by the config
    if let Some(env_name) = kind.env_name(cfg) {
        if let Ok(val) = std::env::var(env_name) {
            if !val.trim().is_empty() {
                return Ok(Some(SecretString::from(val)));
            }
        }
    }

    // 2. System keyring
    if let Ok(entry) = entry(kind) {
        if let Ok(secret) = entry.get_password() {
            return Ok(Some(SecretString::from(secret)));
        }
    }

    // 3. Plaintext in config
    Ok(kind
        .plaintext(cfg)
        .filter(|v| !v.trim().is_empty())
        .map(|v| SecretString::from(v.to_owned())))
}

/// Resolve a required secret.
pub fn resolve_secret(cfg: &Config, kind: SecretKind) -> Result<SecretString, ConfigError> {
    resolve_optional(cfg, kind)?.ok_or_else(|| ConfigError::MissingSecret {
        what: kind.describe(),
        env: kind.env_name(cfg).unwrap_or("an env var").to_owned(),
    })
}

/// Store a secret in the system keyring.
pub fn store_secret(kind: SecretKind, value: &str) -> Result<(), ConfigError> {
    entry(kind)?.set_password(value)?;
    Ok(())
}

/// Remove a secret from the system keyring. Missing entries are fine.
pub fn delete_secret(kind: SecretKind) -> Result<(), ConfigError> {
    match entry(kind)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn kinds_parse_from_cli_names() {
        assert_eq!("api-key".parse::<SecretKind>().unwrap(), SecretKind::ApiKey);
        assert_eq!(SecretKind::HassToken.to_string(), "hass-token");
    }

    #[test]
    fn blank_env_falls_through_to_plaintext() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TEST_DIREKTIVE_BLANK", "  ");
            let mut cfg = Config::default();
            cfg.cloud.encryption_key_env = Some("TEST_DIREKTIVE_BLANK".into());
            cfg.cloud.encryption_key = Some("from-file".into());
            let key = resolve_optional(&cfg, SecretKind::EncryptionKey).unwrap();
            assert_eq!(key.unwrap().expose_secret(), "from-file");
            Ok(())
        });
    }

    #[test]
    fn missing_required_secret_names_the_env_var() {
        figment::Jail::expect_with(|_| {
            let mut cfg = Config::default();
            cfg.home_assistant.token_env = Some("TEST_DIREKTIVE_UNSET_TOKEN".into());
            let err = resolve_secret(&cfg, SecretKind::HassToken).unwrap_err();
            assert!(err.to_string().contains("TEST_DIREKTIVE_UNSET_TOKEN"));
            Ok(())
        });
    }
}
