// ABOUTME: Docker engine implementation of the container runtime seam
// ABOUTME: Uses bollard to manage per-user networks and lab containers

use super::{
    ContainerEngine, ContainerRequest, EndpointRequest, NetworkRequest, Result, RuntimeError,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
        RemoveContainerOptions, StartContainerOptions,
    },
    models::{EndpointSettings, HostConfig, Ipam, PortBinding},
    network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions},
    Docker,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Driver option the katharanp network plugin reads the interface MAC from
const MAC_DRIVER_OPTION: &str = "org.kathara.katharanp.mac";

pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    fn label_filters(labels: &[String]) -> HashMap<String, Vec<String>> {
        HashMap::from([("label".to_string(), labels.to_vec())])
    }

    fn endpoint_settings(endpoint: &EndpointRequest) -> EndpointSettings {
        EndpointSettings {
            mac_address: endpoint.mac_address.clone(),
            driver_opts: endpoint.mac_address.as_ref().map(|mac| {
                HashMap::from([(MAC_DRIVER_OPTION.to_string(), mac.clone())])
            }),
            ..Default::default()
        }
    }

    fn to_bollard_config(request: &ContainerRequest) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for binding in &request.port_bindings {
            exposed_ports.insert(binding.container_port.clone(), HashMap::new());
            port_bindings.insert(
                binding.container_port.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(request.binds.clone()),
            network_mode: Some(request.network_mode.clone()),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            memory: Some(request.memory),
            cap_add: Some(request.cap_add.clone()),
            sysctls: Some(request.sysctls.clone()),
            ..Default::default()
        };

        let networking_config = request.endpoint.as_ref().map(|endpoint| NetworkingConfig {
            endpoints_config: HashMap::from([(
                endpoint.network.clone(),
                Self::endpoint_settings(endpoint),
            )]),
        });

        Config {
            image: Some(request.image.clone()),
            hostname: Some(request.name.clone()),
            env: Some(request.env.clone()),
            labels: Some(request.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        }
    }

    fn not_found(resource: &str, error: bollard::errors::Error) -> RuntimeError {
        match error {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound(resource.to_string()),
            e => RuntimeError::Docker(e),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    async fn create_network(&self, request: &NetworkRequest) -> Result<String> {
        info!("Creating network: {}", request.name);

        let options = CreateNetworkOptions {
            name: request.name.clone(),
            check_duplicate: true,
            driver: request.driver.clone(),
            ipam: Ipam {
                driver: Some("null".to_string()),
                ..Default::default()
            },
            labels: request.labels.clone(),
            ..Default::default()
        };

        self.client.create_network(options).await?;

        // Names are unique per user, and every later call accepts them
        Ok(request.name.clone())
    }

    async fn list_networks(&self, labels: &[String]) -> Result<Vec<String>> {
        let options = ListNetworksOptions {
            filters: Self::label_filters(labels),
        };

        let networks = self.client.list_networks(Some(options)).await?;
        Ok(networks.into_iter().filter_map(|n| n.id).collect())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        info!("Removing network: {}", id);

        self.client
            .remove_network(id)
            .await
            .map_err(|e| Self::not_found(id, e))
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<String> {
        info!("Creating container: {}", request.name);

        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(request))
            .await?;

        debug!("Created container: {}", container.id);
        Ok(container.id)
    }

    async fn connect_network(&self, container_id: &str, endpoint: &EndpointRequest) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: Self::endpoint_settings(endpoint),
        };

        self.client
            .connect_network(&endpoint.network, options)
            .await
            .map_err(|e| Self::not_found(&endpoint.network, e))
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(())
    }

    async fn list_containers(&self, labels: &[String]) -> Result<Vec<String>> {
        let options = ListContainersOptions {
            all: true,
            filters: Self::label_filters(labels),
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        info!("Removing container: {}", container_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| Self::not_found(container_id, e))
    }
}
