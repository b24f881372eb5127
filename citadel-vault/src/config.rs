//! Process configuration, read from environment variables. Kept as one flat
//! struct with a `from_env` constructor, mirroring how the rest of the stack
//! threads explicit config rather than reaching for a global.

use std::env;
use std::time::Duration;

use crate::error::VaultError;
use crate::lease::LeaseServiceConfig;

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, VaultError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| VaultError::validation(format!("{name} is not a valid value: '{raw}'"))),
    }
}

/// Minimum accepted master key length. The key is the root of the HKDF
/// ladder every purpose-scoped KEK is derived from, so anything shorter
/// than a single AES-256 key is rejected outright at startup.
const MIN_MASTER_KEY_BYTES: usize = 32;

#[derive(Clone, Debug)]
pub struct VaultConfig {
    /// Hex- or base64-encoded master key, as given in `VAULT_MASTER_KEY`.
    pub master_key_raw: String,
    pub seal_auto_unseal: bool,
    pub seal_total_shares: u8,
    pub seal_threshold: u8,

    pub rotation_tick_interval: Duration,
    pub lease_expiry_tick_interval: Duration,

    pub lease_execute_sql: bool,
    pub lease_default_ttl_seconds: u64,
    pub lease_max_ttl_seconds: u64,
    pub lease_password_length: usize,
    pub lease_username_prefix: String,
}

impl VaultConfig {
    /// Reads configuration from environment variables, falling back to
    /// development-friendly defaults for everything except the master key.
    pub fn from_env() -> Result<Self, VaultError> {
        let master_key_raw = env_var("VAULT_MASTER_KEY")
            .ok_or_else(|| VaultError::validation("VAULT_MASTER_KEY must be set"))?;
        let seal_auto_unseal = env_var("VAULT_AUTO_UNSEAL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let seal_total_shares: u8 = parse_env("VAULT_SHARES", 5)?;
        let seal_threshold: u8 = parse_env("VAULT_THRESHOLD", 3)?;

        let rotation_tick_seconds: u64 = parse_env("VAULT_ROTATION_TICK_SECS", 60)?;
        let lease_expiry_tick_seconds: u64 = parse_env("VAULT_LEASE_EXPIRY_TICK_SECS", 30)?;

        let lease_execute_sql = env_var("VAULT_EXECUTE_SQL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let lease_default_ttl_seconds: u64 = parse_env("VAULT_DEFAULT_TTL_SECS", 3600)?;
        let lease_max_ttl_seconds: u64 = parse_env("VAULT_MAX_TTL_SECS", 86_400)?;
        let lease_password_length: usize = parse_env("VAULT_PASSWORD_LENGTH", 24)?;
        let lease_username_prefix =
            env_var("VAULT_USERNAME_PREFIX").unwrap_or_else(|| "citadel_".to_string());

        if seal_threshold < 2 {
            return Err(VaultError::validation("VAULT_THRESHOLD must be >= 2"));
        }
        if seal_threshold > seal_total_shares {
            return Err(VaultError::validation("VAULT_THRESHOLD cannot exceed VAULT_SHARES"));
        }
        if lease_max_ttl_seconds < lease_default_ttl_seconds {
            return Err(VaultError::validation(
                "VAULT_MAX_TTL_SECS cannot be smaller than VAULT_DEFAULT_TTL_SECS",
            ));
        }

        let config = Self {
            master_key_raw,
            seal_auto_unseal,
            seal_total_shares,
            seal_threshold,
            rotation_tick_interval: Duration::from_secs(rotation_tick_seconds),
            lease_expiry_tick_interval: Duration::from_secs(lease_expiry_tick_seconds),
            lease_execute_sql,
            lease_default_ttl_seconds,
            lease_max_ttl_seconds,
            lease_password_length,
            lease_username_prefix,
        };
        config.master_key_bytes()?;
        Ok(config)
    }

    /// Decodes `VAULT_MASTER_KEY`, accepting either hex or base64, and
    /// rejects anything shorter than [`MIN_MASTER_KEY_BYTES`].
    pub fn master_key_bytes(&self) -> Result<Vec<u8>, VaultError> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let decoded = if let Ok(bytes) = hex::decode(&self.master_key_raw) {
            bytes
        } else {
            BASE64
                .decode(&self.master_key_raw)
                .map_err(|e| VaultError::validation(format!("VAULT_MASTER_KEY is neither valid hex nor valid base64: {e}")))?
        };
        if decoded.len() < MIN_MASTER_KEY_BYTES {
            return Err(VaultError::validation(format!(
                "VAULT_MASTER_KEY must decode to at least {MIN_MASTER_KEY_BYTES} bytes, got {}",
                decoded.len()
            )));
        }
        Ok(decoded)
    }

    pub fn lease_service_config(&self) -> LeaseServiceConfig {
        LeaseServiceConfig {
            username_prefix: self.lease_username_prefix.clone(),
            password_length: self.lease_password_length,
            default_ttl_seconds: self.lease_default_ttl_seconds,
            max_ttl_seconds: self.lease_max_ttl_seconds,
            execute_sql: self.lease_execute_sql,
        }
    }
}
