// ABOUTME: Container runtime driver turning deployment descriptors into engine operations
// ABOUTME: Defines the ContainerEngine trait plus deterministic naming, wiring and teardown

use crate::descriptor::{ContainerSpec, NetworkSpec};
use crate::state::SandboxRecord;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod docker;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use docker::DockerEngine;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryEngine;

/// Port the VPN gateway listens on inside its container
pub const VPN_CONTAINER_PORT: &str = "1194/tcp";

/// Capabilities needed for routing experiments inside the sandbox
const CAPABILITIES: [&str; 2] = ["NET_ADMIN", "NET_RAW"];

pub const USER_LABEL: &str = "user_id";
pub const CHAPTER_LABEL: &str = "chapter";
pub const NAMESPACE_LABEL: &str = "namespace";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Engine resource not found: {0}")]
    NotFound(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Container {container} needs VPN material but user {user_id} has none")]
    MissingVpnMaterial { user_id: i64, container: String },

    #[error("Container {0} is not bridged and declares no network")]
    NoNetwork(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Build the engine-visible name of a user's resource.
///
/// User ids are plain decimals, so the `-` after the id keeps names from
/// different users apart even when logical names contain dashes themselves.
pub fn resource_name(namespace: &str, user_id: i64, logical_name: &str) -> String {
    format!("{}-{}-{}", namespace, user_id, logical_name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRequest {
    pub name: String,
    pub driver: String,
    pub labels: HashMap<String, String>,
}

/// Attachment of a container to a network, optionally with a fixed MAC
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRequest {
    pub network: String,
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortBindingRequest {
    pub container_port: String,
    pub host_port: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// `host:container` bind mounts
    pub binds: Vec<String>,
    /// `bridge`, or the name of the network attached at creation
    pub network_mode: String,
    /// Network attached at creation, when not bridged
    pub endpoint: Option<EndpointRequest>,
    pub port_bindings: Vec<PortBindingRequest>,
    pub memory: i64,
    pub cap_add: Vec<String>,
    pub sysctls: HashMap<String, String>,
}

/// Operations the driver needs from a container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check if the engine answers
    async fn is_available(&self) -> bool;

    /// Create a network and return its id
    async fn create_network(&self, request: &NetworkRequest) -> Result<String>;

    /// Ids of networks carrying every `key=value` label
    async fn list_networks(&self, labels: &[String]) -> Result<Vec<String>>;

    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Create (but do not start) a container and return its id
    async fn create_container(&self, request: &ContainerRequest) -> Result<String>;

    async fn connect_network(&self, container_id: &str, endpoint: &EndpointRequest) -> Result<()>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Ids of containers, running or not, carrying every `key=value` label
    async fn list_containers(&self, labels: &[String]) -> Result<Vec<String>>;

    /// Force-remove a container together with its anonymous volumes
    async fn remove_container(&self, container_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub namespace: String,
    /// Driver for per-user layer-2 networks
    pub network_driver: String,
}

pub struct RuntimeDriver {
    engine: Arc<dyn ContainerEngine>,
    config: RuntimeConfig,
}

impl RuntimeDriver {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: RuntimeConfig) -> Self {
        Self { engine, config }
    }

    pub fn resource_name(&self, user_id: i64, logical_name: &str) -> String {
        resource_name(&self.config.namespace, user_id, logical_name)
    }

    fn labels(&self, record: &SandboxRecord) -> HashMap<String, String> {
        HashMap::from([
            (USER_LABEL.to_string(), record.user_id.to_string()),
            (
                CHAPTER_LABEL.to_string(),
                record.chapter.clone().unwrap_or_default(),
            ),
            (NAMESPACE_LABEL.to_string(), self.config.namespace.clone()),
        ])
    }

    /// Label filters matching everything owned by one user
    pub fn user_filters(&self, user_id: i64) -> Vec<String> {
        vec![
            format!("{}={}", USER_LABEL, user_id),
            format!("{}={}", NAMESPACE_LABEL, self.config.namespace),
        ]
    }

    pub async fn create_network(&self, record: &SandboxRecord, spec: &NetworkSpec) -> Result<String> {
        let request = NetworkRequest {
            name: self.resource_name(record.user_id, &spec.name),
            driver: self.config.network_driver.clone(),
            labels: self.labels(record),
        };

        debug!("Creating network {} for user {}", request.name, record.user_id);
        self.engine.create_network(&request).await
    }

    /// Translate a container spec into the creation request plus the networks
    /// that have to be connected afterwards.
    ///
    /// Engines accept one network at creation time: bridged containers start
    /// on the host bridge and get every declared network later, the others
    /// start on their first declared network.
    pub fn container_request(
        &self,
        record: &SandboxRecord,
        spec: &ContainerSpec,
    ) -> Result<(ContainerRequest, Vec<EndpointRequest>)> {
        let mut environment = BTreeMap::new();
        environment.insert("USER_ID".to_string(), record.user_id.to_string());
        environment.extend(spec.environment.clone());

        let mut port_bindings = Vec::new();
        if spec.vpn {
            let vpn = record
                .vpn
                .as_ref()
                .ok_or_else(|| RuntimeError::MissingVpnMaterial {
                    user_id: record.user_id,
                    container: spec.name.clone(),
                })?;

            for (key, value) in vpn.env_vars() {
                environment.insert(key.to_string(), value.to_string());
            }
            port_bindings.push(PortBindingRequest {
                container_port: VPN_CONTAINER_PORT.to_string(),
                host_port: record.port,
            });
        }

        let mut endpoints: Vec<EndpointRequest> = spec
            .networks
            .iter()
            .map(|attachment| EndpointRequest {
                network: self.resource_name(record.user_id, &attachment.network),
                mac_address: attachment.mac_address.clone(),
            })
            .collect();

        let (network_mode, endpoint) = if spec.bridge {
            ("bridge".to_string(), None)
        } else {
            if endpoints.is_empty() {
                return Err(RuntimeError::NoNetwork(spec.name.clone()));
            }
            let first = endpoints.remove(0);
            (first.network.clone(), Some(first))
        };

        let mut sysctls = HashMap::from([(
            "net.ipv6.conf.all.disable_ipv6".to_string(),
            "0".to_string(),
        )]);
        sysctls.insert(
            "net.ipv6.conf.all.forwarding".to_string(),
            if spec.ipv6_forwarding { "1" } else { "0" }.to_string(),
        );

        let request = ContainerRequest {
            name: self.resource_name(record.user_id, &spec.name),
            image: spec.image.clone(),
            env: environment
                .into_iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect(),
            labels: self.labels(record),
            binds: spec
                .volumes
                .iter()
                .map(|(host, container)| format!("{}:{}", host, container))
                .collect(),
            network_mode,
            endpoint,
            port_bindings,
            memory: spec.memory_limit,
            cap_add: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            sysctls,
        };

        Ok((request, endpoints))
    }

    /// Create a container, wire up all of its networks, then start it.
    pub async fn run_container(&self, record: &SandboxRecord, spec: &ContainerSpec) -> Result<String> {
        let (request, deferred) = self.container_request(record, spec)?;

        debug!("Creating container {} for user {}", request.name, record.user_id);
        let container_id = self.engine.create_container(&request).await?;

        for endpoint in &deferred {
            debug!("Connecting {} to {}", request.name, endpoint.network);
            self.engine.connect_network(&container_id, endpoint).await?;
        }

        self.engine.start_container(&container_id).await?;
        Ok(container_id)
    }

    /// Remove every container and network owned by the user.
    ///
    /// Containers go first since networks with endpoints cannot be removed.
    /// Resources that vanish in between are skipped.
    pub async fn clean(&self, user_id: i64) -> Result<()> {
        let filters = self.user_filters(user_id);

        let containers = self.engine.list_containers(&filters).await?;
        for container_id in &containers {
            match self.engine.remove_container(container_id).await {
                Ok(()) => {}
                Err(RuntimeError::NotFound(_)) => {
                    warn!("Container {} already removed", container_id)
                }
                Err(e) => return Err(e),
            }
        }

        let networks = self.engine.list_networks(&filters).await?;
        for network_id in &networks {
            match self.engine.remove_network(network_id).await {
                Ok(()) => {}
                Err(RuntimeError::NotFound(_)) => warn!("Network {} already removed", network_id),
                Err(e) => return Err(e),
            }
        }

        if !containers.is_empty() || !networks.is_empty() {
            info!(
                "Cleaned {} containers and {} networks for user {}",
                containers.len(),
                networks.len(),
                user_id
            );
        }
        Ok(())
    }
}
