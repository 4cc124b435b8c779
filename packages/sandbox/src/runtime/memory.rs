// ABOUTME: In-memory container engine for tests without a Docker daemon
// ABOUTME: Records networks, containers and the order of every engine call

use super::{
    ContainerEngine, ContainerRequest, EndpointRequest, NetworkRequest, Result, RuntimeError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    pub request: NetworkRequest,
}

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub request: ContainerRequest,
    /// Every network the container is attached to, creation endpoint first
    pub endpoints: Vec<EndpointRequest>,
    pub started: bool,
}

#[derive(Default)]
struct EngineState {
    networks: BTreeMap<String, MemoryNetwork>,
    containers: BTreeMap<String, MemoryContainer>,
    events: Vec<String>,
    failing_images: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<RwLock<EngineState>>,
}

fn matches_labels(labels: &HashMap<String, String>, filters: &[String]) -> bool {
    filters.iter().all(|filter| match filter.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(filter.as_str()),
    })
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make container creation fail for an image
    pub async fn fail_image(&self, image: &str) {
        self.state.write().await.failing_images.insert(image.to_string());
    }

    pub async fn events(&self) -> Vec<String> {
        self.state.read().await.events.clone()
    }

    pub async fn networks(&self) -> Vec<MemoryNetwork> {
        self.state.read().await.networks.values().cloned().collect()
    }

    pub async fn containers(&self) -> Vec<MemoryContainer> {
        self.state.read().await.containers.values().cloned().collect()
    }

    pub async fn container(&self, name: &str) -> Option<MemoryContainer> {
        self.state.read().await.containers.get(name).cloned()
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn is_available(&self) -> bool {
        true
    }

    async fn create_network(&self, request: &NetworkRequest) -> Result<String> {
        let mut state = self.state.write().await;
        if state.networks.contains_key(&request.name) {
            return Err(RuntimeError::Engine(format!(
                "network with name {} already exists",
                request.name
            )));
        }

        state.events.push(format!("create_network {}", request.name));
        state.networks.insert(
            request.name.clone(),
            MemoryNetwork {
                request: request.clone(),
            },
        );
        Ok(request.name.clone())
    }

    async fn list_networks(&self, labels: &[String]) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .networks
            .values()
            .filter(|n| matches_labels(&n.request.labels, labels))
            .map(|n| n.request.name.clone())
            .collect())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let in_use = state
            .containers
            .values()
            .any(|c| c.endpoints.iter().any(|e| e.network == id));
        if in_use {
            return Err(RuntimeError::Engine(format!(
                "network {} has active endpoints",
                id
            )));
        }

        state
            .networks
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.events.push(format!("remove_network {}", id));
        Ok(())
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<String> {
        let mut state = self.state.write().await;
        if state.failing_images.contains(&request.image) {
            return Err(RuntimeError::Engine(format!(
                "unable to create container from image {}",
                request.image
            )));
        }
        if state.containers.contains_key(&request.name) {
            return Err(RuntimeError::Engine(format!(
                "container name {} is already in use",
                request.name
            )));
        }

        let mut endpoints = Vec::new();
        if let Some(endpoint) = &request.endpoint {
            if !state.networks.contains_key(&endpoint.network) {
                return Err(RuntimeError::NotFound(endpoint.network.clone()));
            }
            endpoints.push(endpoint.clone());
        }

        state.events.push(format!("create_container {}", request.name));
        state.containers.insert(
            request.name.clone(),
            MemoryContainer {
                request: request.clone(),
                endpoints,
                started: false,
            },
        );
        Ok(request.name.clone())
    }

    async fn connect_network(&self, container_id: &str, endpoint: &EndpointRequest) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.networks.contains_key(&endpoint.network) {
            return Err(RuntimeError::NotFound(endpoint.network.clone()));
        }

        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.endpoints.push(endpoint.clone());
        state
            .events
            .push(format!("connect {} {}", container_id, endpoint.network));
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.started = true;
        state.events.push(format!("start {}", container_id));
        Ok(())
    }

    async fn list_containers(&self, labels: &[String]) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .containers
            .values()
            .filter(|c| matches_labels(&c.request.labels, labels))
            .map(|c| c.request.name.clone())
            .collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .containers
            .remove(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        state.events.push(format!("remove_container {}", container_id));
        Ok(())
    }
}
