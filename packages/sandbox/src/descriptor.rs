// ABOUTME: Declarative lab topology supplied by lab modules, one per chapter
// ABOUTME: Networks and containers to instantiate, plus the VPN gateway builder

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Default memory ceiling for a lab container (64 MiB)
pub const DEFAULT_MEMORY_LIMIT: i64 = 64 * 1024 * 1024;

/// First octet of every derived MAC address: locally administered, unicast
const MAC_PREFIX: u8 = 0x06;

/// Largest user id that fits into the four MAC bytes derived from it
pub const MAX_MAC_USER_ID: i64 = 99_999_999;

#[derive(Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("User id {0} cannot be encoded into a MAC address")]
    UserIdOutOfRange(i64),
    #[error("Too many networks for MAC derivation: {0}")]
    TooManyNetworks(usize),
    #[error("Container {container} references undeclared network {network}")]
    UnknownNetwork { container: String, network: String },
    #[error("Container {0} is not bridged and declares no network")]
    NoNetwork(String),
    #[error("Duplicate name in deployment: {0}")]
    DuplicateName(String),
    #[error("More than one container is marked as the VPN gateway")]
    MultipleGateways,
}

pub type Result<T> = std::result::Result<T, DescriptorError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
}

impl NetworkSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One interface of a container: a logical network, optionally pinned to a MAC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

impl NetworkAttachment {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            mac_address: None,
        }
    }

    pub fn with_mac(network: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            mac_address: Some(mac_address.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Attachment order matters: the first one is used at creation time
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    /// Attach to the host bridge instead of an isolated network
    #[serde(default)]
    pub bridge: bool,
    /// Marks the VPN gateway: receives the CA material and the published port
    #[serde(default)]
    pub vpn: bool,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64,
    /// Forwarding off lets router advertisements reach this container
    #[serde(default = "default_ipv6_forwarding")]
    pub ipv6_forwarding: bool,
    /// Host path to container path
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_memory_limit() -> i64 {
    DEFAULT_MEMORY_LIMIT
}

fn default_ipv6_forwarding() -> bool {
    true
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            networks: Vec::new(),
            bridge: false,
            vpn: false,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            ipv6_forwarding: true,
            volumes: BTreeMap::new(),
            environment: BTreeMap::new(),
        }
    }

    pub fn network(mut self, attachment: NetworkAttachment) -> Self {
        self.networks.push(attachment);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn volume(mut self, host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        self.volumes.insert(host_path.into(), container_path.into());
        self
    }

    /// Build the VPN gateway container for a user.
    ///
    /// The gateway is bridged to the host and joins every listed network with a
    /// MAC derived from the user id, so addresses inside the sandbox stay
    /// predictable across redeployments. `NETWORKS` lists the attached networks
    /// in order and `DEFAULT_NETWORK` names the first one.
    pub fn vpn_gateway(
        name: impl Into<String>,
        image: impl Into<String>,
        user_id: i64,
        networks: &[&str],
    ) -> Result<Self> {
        let mut spec = Self::new(name, image);
        spec.bridge = true;
        spec.vpn = true;

        for (index, network) in networks.iter().enumerate() {
            let mac = derive_mac(user_id, index)?;
            spec.networks.push(NetworkAttachment::with_mac(*network, mac));
        }

        spec.environment
            .insert("NETWORKS".to_string(), networks.join(","));
        if let Some(default) = networks.first() {
            spec.environment
                .insert("DEFAULT_NETWORK".to_string(), (*default).to_string());
        }

        Ok(spec)
    }
}

/// Derive the MAC address of a user's interface on the `index`-th network.
///
/// The user id is zero-padded to eight decimal digits and split into four byte
/// pairs, so user 305 on network 1 becomes `06:00:00:03:05:01`.
pub fn derive_mac(user_id: i64, index: usize) -> Result<String> {
    if !(0..=MAX_MAC_USER_ID).contains(&user_id) {
        return Err(DescriptorError::UserIdOutOfRange(user_id));
    }
    if index > u8::MAX as usize {
        return Err(DescriptorError::TooManyNetworks(index + 1));
    }

    let digits = format!("{:08}", user_id);
    let pairs: Vec<&str> = (0..4).map(|i| &digits[i * 2..i * 2 + 2]).collect();

    Ok(format!(
        "{:02x}:{}:{:02x}",
        MAC_PREFIX,
        pairs.join(":"),
        index
    ))
}

/// Everything a chapter needs: networks first, then containers, both in order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

impl Deployment {
    pub fn new(networks: Vec<NetworkSpec>, containers: Vec<ContainerSpec>) -> Self {
        Self {
            networks,
            containers,
        }
    }

    /// Structural checks a lab module can run on its descriptor before handing it over
    pub fn validate(&self) -> Result<()> {
        let mut network_names = HashSet::new();
        for network in &self.networks {
            if !network_names.insert(network.name.as_str()) {
                return Err(DescriptorError::DuplicateName(network.name.clone()));
            }
        }

        let mut container_names = HashSet::new();
        let mut gateways = 0;
        for container in &self.containers {
            if !container_names.insert(container.name.as_str()) {
                return Err(DescriptorError::DuplicateName(container.name.clone()));
            }
            if !container.bridge && container.networks.is_empty() {
                return Err(DescriptorError::NoNetwork(container.name.clone()));
            }
            for attachment in &container.networks {
                if !network_names.contains(attachment.network.as_str()) {
                    return Err(DescriptorError::UnknownNetwork {
                        container: container.name.clone(),
                        network: attachment.network.clone(),
                    });
                }
            }
            if container.vpn {
                gateways += 1;
            }
        }

        if gateways > 1 {
            return Err(DescriptorError::MultipleGateways);
        }

        Ok(())
    }
}
