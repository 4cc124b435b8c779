// ABOUTME: Object storage boundary used to publish generated VPN client profiles
// ABOUTME: Defines the ObjectStore trait plus the S3 and in-memory implementations

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod s3;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use s3::{S3Config, S3Store};

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryObjectStore;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object storage configuration error: {0}")]
    Configuration(String),
    #[error("Object storage provider error: {0}")]
    Provider(String),
    #[error("Object not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

/// Key of a per-user object: `{folder}/{user_id}/{filename}`
pub fn object_key(folder: &str, user_id: i64, filename: &str) -> String {
    format!("{}/{}/{}", folder, user_id, filename)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `content` under `key`, replacing any previous object
    async fn upload_bytes(&self, key: &str, content: Vec<u8>) -> Result<()>;

    /// Time-limited download link for `key`
    async fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        assert_eq!(
            object_key("vpn", 42, "config-win.ovpn"),
            "vpn/42/config-win.ovpn"
        );
    }
}
