// ABOUTME: Orchestration engine composing store, runtime driver and PKI issuer
// ABOUTME: Implements launch, stop and stop_all on top of the per-user record lock

use crate::descriptor::Deployment;
use crate::objects::ObjectStoreError;
use crate::pki::{profile_key, PkiError, PkiIssuer, VpnPlatform};
use crate::runtime::{RuntimeDriver, RuntimeError};
use crate::state::{SandboxRecord, SandboxState, StateError};
use crate::store::{SandboxStore, StoreError};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Lifetime of presigned profile download links
pub const PROFILE_URL_TTL: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Objects(#[from] ObjectStoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Sandbox for user {user_id} is not locked (state: {state})")]
    NotLocked { user_id: i64, state: SandboxState },

    #[error("No sandbox for user {0}")]
    NotFound(i64),

    #[error("No VPN material issued for user {0}")]
    NoVpnMaterial(i64),
}

impl OrchestratorError {
    /// Another operation holds the sandbox; the caller may try again later
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict { .. }))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

pub struct Orchestrator {
    store: SandboxStore,
    runtime: RuntimeDriver,
    pki: PkiIssuer,
}

impl Orchestrator {
    pub fn new(store: SandboxStore, runtime: RuntimeDriver, pki: PkiIssuer) -> Self {
        Self {
            store,
            runtime,
            pki,
        }
    }

    pub async fn acquire(
        &self,
        user_id: i64,
        chapter: Option<&str>,
        assert_chapter: bool,
    ) -> Result<SandboxRecord> {
        Ok(self.store.acquire(user_id, chapter, assert_chapter).await?)
    }

    /// Provision the deployment for a record the caller has locked.
    ///
    /// Leftovers from earlier runs are removed first. VPN material is issued
    /// only if the record has none. Any failure leaves the record
    /// `InProgress` along with whatever was already created.
    pub async fn launch(&self, record: &mut SandboxRecord, deployment: &Deployment) -> Result<()> {
        if !record.is_locked() {
            return Err(OrchestratorError::NotLocked {
                user_id: record.user_id,
                state: record.state,
            });
        }

        info!(
            "Launching sandbox for user {} (chapter: {:?})",
            record.user_id, record.chapter
        );

        self.runtime.clean(record.user_id).await?;

        if record.vpn.is_none() {
            let material = self.pki.issue(record.user_id, record.port).await?;
            self.store.save_vpn(record, material).await?;
        }

        for network in &deployment.networks {
            self.runtime.create_network(record, network).await?;
        }
        for container in &deployment.containers {
            self.runtime.run_container(record, container).await?;
        }

        self.store.commit_state(record, SandboxState::Ready).await?;

        info!(
            "Sandbox for user {} is ready on port {}",
            record.user_id, record.port
        );
        Ok(())
    }

    /// Lock the user's sandbox for `chapter` and launch the deployment
    pub async fn start(
        &self,
        user_id: i64,
        chapter: &str,
        deployment: &Deployment,
    ) -> Result<SandboxRecord> {
        let mut record = self.acquire(user_id, Some(chapter), false).await?;
        self.launch(&mut record, deployment).await?;
        Ok(record)
    }

    pub async fn stop(&self, user_id: i64) -> Result<SandboxRecord> {
        let mut record = self.acquire(user_id, None, false).await?;

        self.runtime.clean(user_id).await?;
        self.store
            .commit_state(&mut record, SandboxState::Disabled)
            .await?;

        info!("Stopped sandbox for user {}", user_id);
        Ok(record)
    }

    /// Stop every ready sandbox, optionally only those on `chapter`.
    ///
    /// Sandboxes busy with another operation are skipped. Any other error
    /// ends the sweep. Returns how many sandboxes were stopped.
    pub async fn stop_all(&self, chapter: Option<&str>) -> Result<usize> {
        let records = self.store.list_ready(chapter).await?;
        let mut stopped = 0;

        for record in records {
            match self.stop(record.user_id).await {
                Ok(_) => stopped += 1,
                Err(e) if e.is_conflict() => {
                    warn!("Skipping sandbox for user {}: {}", record.user_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        info!("Stopped {} sandboxes", stopped);
        Ok(stopped)
    }

    pub async fn status(&self, user_id: i64) -> Result<Option<SandboxRecord>> {
        Ok(self.store.get(user_id).await?)
    }

    /// Presigned download link for one of the user's client profiles
    pub async fn profile_url(&self, user_id: i64, platform: VpnPlatform) -> Result<String> {
        let record = self
            .status(user_id)
            .await?
            .ok_or(OrchestratorError::NotFound(user_id))?;
        if record.vpn.is_none() {
            return Err(OrchestratorError::NoVpnMaterial(user_id));
        }

        Ok(self
            .pki
            .objects()
            .presigned_url(&profile_key(user_id, platform), PROFILE_URL_TTL)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::descriptor::{ContainerSpec, NetworkAttachment, NetworkSpec};
    use crate::objects::MemoryObjectStore;
    use crate::pki::{PkiConfig, TlsCryptKey};
    use crate::runtime::{MemoryEngine, RuntimeConfig};
    use crate::store::StoreOptions;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup() -> (Orchestrator, Arc<MemoryEngine>, Arc<MemoryObjectStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("netlab.db").display());
        let store = SandboxStore::connect(&url, &StoreOptions::default())
            .await
            .unwrap();
        store.migrate().await.unwrap();

        let engine = Arc::new(MemoryEngine::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let runtime = RuntimeDriver::new(
            engine.clone(),
            RuntimeConfig {
                namespace: "netlab".to_string(),
                network_driver: "bridge".to_string(),
            },
        );
        let pki = PkiIssuer::new(
            PkiConfig {
                namespace: "netlab".to_string(),
                vpn_host: "labs.example.org".to_string(),
                organization: "netlab".to_string(),
                country: None,
                tls_crypt_key: TlsCryptKey::parse(&"ab".repeat(256)).unwrap(),
            },
            objects.clone(),
            Arc::new(SystemClock),
        );

        (Orchestrator::new(store, runtime, pki), engine, objects, dir)
    }

    fn deployment() -> Deployment {
        Deployment::new(
            vec![NetworkSpec::new("lan")],
            vec![ContainerSpec::new("worker", "alpine").network(NetworkAttachment::new("lan"))],
        )
    }

    #[tokio::test]
    async fn test_launch_requires_lock() {
        let (orchestrator, engine, _objects, _dir) = setup().await;

        let mut record = orchestrator.start(1, "intro", &deployment()).await.unwrap();
        assert_eq!(record.state, SandboxState::Ready);

        let err = orchestrator
            .launch(&mut record, &deployment())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NotLocked {
                user_id: 1,
                state: SandboxState::Ready
            }
        ));
        assert_eq!(engine.containers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_launch_stays_in_progress() {
        let (orchestrator, engine, _objects, _dir) = setup().await;
        engine.fail_image("alpine").await;

        let err = orchestrator
            .start(2, "intro", &deployment())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Runtime(_)));

        let record = orchestrator.status(2).await.unwrap().unwrap();
        assert_eq!(record.state, SandboxState::InProgress);
        assert!(record.vpn.is_some());
        assert_eq!(engine.networks().await.len(), 1);

        let retry = orchestrator.stop(2).await.unwrap_err();
        assert!(retry.is_conflict());
    }

    #[tokio::test]
    async fn test_profile_url() {
        let (orchestrator, _engine, objects, _dir) = setup().await;

        let missing = orchestrator
            .profile_url(3, VpnPlatform::Linux)
            .await
            .unwrap_err();
        assert!(matches!(missing, OrchestratorError::NotFound(3)));

        orchestrator.stop(3).await.unwrap();
        let no_vpn = orchestrator
            .profile_url(3, VpnPlatform::Linux)
            .await
            .unwrap_err();
        assert!(matches!(no_vpn, OrchestratorError::NoVpnMaterial(3)));

        orchestrator.start(3, "intro", &deployment()).await.unwrap();
        let url = orchestrator
            .profile_url(3, VpnPlatform::Windows)
            .await
            .unwrap();
        assert_eq!(url, "memory://vpn/3/config-win.ovpn?expires=3600");
        assert_eq!(objects.len().await, 2);
    }
}
