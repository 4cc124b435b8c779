// ABOUTME: Per-user lab sandbox orchestration: descriptors, record lock, runtime and PKI
// ABOUTME: Provisions isolated container networks plus a VPN gateway for each user

pub mod clock;
pub mod config;
pub mod descriptor;
pub mod objects;
pub mod orchestrator;
pub mod pki;
pub mod runtime;
pub mod state;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, SandboxConfig};
pub use descriptor::{
    derive_mac, ContainerSpec, Deployment, DescriptorError, NetworkAttachment, NetworkSpec,
};
pub use objects::{ObjectStore, ObjectStoreError, S3Config, S3Store};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use pki::{PkiConfig, PkiError, PkiIssuer, TlsCryptKey, VpnPlatform};
pub use runtime::{
    resource_name, ContainerEngine, DockerEngine, RuntimeConfig, RuntimeDriver, RuntimeError,
};
pub use state::{SandboxRecord, SandboxState, StateError, VpnMaterial};
pub use store::{SandboxStore, StoreError, StoreOptions};

#[cfg(any(test, feature = "test-utils"))]
pub use objects::MemoryObjectStore;

#[cfg(any(test, feature = "test-utils"))]
pub use runtime::MemoryEngine;
