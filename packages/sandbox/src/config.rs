// ABOUTME: Environment-driven configuration for the sandbox orchestrator
// ABOUTME: Splits settings into store, runtime, PKI and object storage sections

use crate::objects::S3Config;
use crate::pki::{PkiConfig, PkiError, TlsCryptKey};
use crate::runtime::RuntimeConfig;
use crate::store::StoreOptions;
use netlab_config::*;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("Invalid TLS crypt key: {0}")]
    TlsCryptKey(#[from] PkiError),
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub database_url: String,
    pub store: StoreOptions,
    pub runtime: RuntimeConfig,
    pub pki: PkiConfig,
    pub s3: S3Config,
}

/// Unset and empty variables both count as absent
fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let namespace = optional(NETLAB_NAMESPACE).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let max_connections = parsed(NETLAB_DB_MAX_CONNECTIONS, DEFAULT_DB_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: NETLAB_DB_MAX_CONNECTIONS,
                value: "0".to_string(),
            });
        }
        let busy_timeout = parsed(NETLAB_DB_BUSY_TIMEOUT_SECS, DEFAULT_DB_BUSY_TIMEOUT_SECS)?;

        let tls_crypt_key = TlsCryptKey::parse(&required(NETLAB_VPN_TLS_CRYPT_KEY)?)?;

        Ok(Self {
            database_url: optional(DATABASE_URL).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            store: StoreOptions {
                max_connections,
                busy_timeout: Duration::from_secs(busy_timeout),
            },
            runtime: RuntimeConfig {
                namespace: namespace.clone(),
                network_driver: optional(NETLAB_NETWORK_DRIVER)
                    .unwrap_or_else(|| DEFAULT_NETWORK_DRIVER.to_string()),
            },
            pki: PkiConfig {
                namespace,
                vpn_host: required(NETLAB_VPN_HOST)?,
                organization: optional(NETLAB_CA_ORGANIZATION)
                    .unwrap_or_else(|| DEFAULT_CA_ORGANIZATION.to_string()),
                country: optional(NETLAB_CA_COUNTRY),
                tls_crypt_key,
            },
            s3: S3Config {
                bucket: required(NETLAB_S3_BUCKET)?,
                region: optional(NETLAB_S3_REGION).unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                endpoint: optional(NETLAB_S3_ENDPOINT),
                access_key_id: optional(NETLAB_S3_ACCESS_KEY_ID),
                secret_access_key: optional(NETLAB_S3_SECRET_ACCESS_KEY),
            },
        })
    }
}
