// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across netlab

// Resource naming
pub const NETLAB_NAMESPACE: &str = "NETLAB_NAMESPACE";
pub const DEFAULT_NAMESPACE: &str = "netlab";

// Database
pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://netlab.db";
pub const NETLAB_DB_MAX_CONNECTIONS: &str = "NETLAB_DB_MAX_CONNECTIONS";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const NETLAB_DB_BUSY_TIMEOUT_SECS: &str = "NETLAB_DB_BUSY_TIMEOUT_SECS";
pub const DEFAULT_DB_BUSY_TIMEOUT_SECS: u64 = 30;

// Container engine
pub const NETLAB_NETWORK_DRIVER: &str = "NETLAB_NETWORK_DRIVER";
pub const DEFAULT_NETWORK_DRIVER: &str = "kathara/katharanp:amd64";

// VPN / PKI
pub const NETLAB_VPN_HOST: &str = "NETLAB_VPN_HOST";
pub const NETLAB_VPN_TLS_CRYPT_KEY: &str = "NETLAB_VPN_TLS_CRYPT_KEY";
pub const NETLAB_CA_ORGANIZATION: &str = "NETLAB_CA_ORGANIZATION";
pub const DEFAULT_CA_ORGANIZATION: &str = "netlab";
pub const NETLAB_CA_COUNTRY: &str = "NETLAB_CA_COUNTRY";

// Object storage
pub const NETLAB_S3_BUCKET: &str = "NETLAB_S3_BUCKET";
pub const NETLAB_S3_REGION: &str = "NETLAB_S3_REGION";
pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const NETLAB_S3_ENDPOINT: &str = "NETLAB_S3_ENDPOINT";
pub const NETLAB_S3_ACCESS_KEY_ID: &str = "NETLAB_S3_ACCESS_KEY_ID";
pub const NETLAB_S3_SECRET_ACCESS_KEY: &str = "NETLAB_S3_SECRET_ACCESS_KEY";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
