// ABOUTME: Integration tests for the sandbox lifecycle against in-memory engine and object store
// ABOUTME: Covers launch, stop, relaunch, lock conflicts and the stop_all sweep

use async_trait::async_trait;
use netlab_sandbox::runtime::{ContainerRequest, EndpointRequest, NetworkRequest};
use netlab_sandbox::{
    ContainerEngine, ContainerSpec, Deployment, MemoryEngine, MemoryObjectStore,
    NetworkAttachment, NetworkSpec, Orchestrator, OrchestratorError, PkiConfig, PkiIssuer,
    RuntimeConfig, RuntimeDriver, RuntimeError, SandboxState, SandboxStore, StoreOptions,
    SystemClock, TlsCryptKey,
};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const NAMESPACE: &str = "netlab";

/// Everything a test needs to poke at besides the orchestrator itself
struct Harness {
    orchestrator: Arc<Orchestrator>,
    engine: Arc<MemoryEngine>,
    objects: Arc<MemoryObjectStore>,
    store: SandboxStore,
    _dir: TempDir,
}

async fn setup_with_engine(
    engine: Arc<MemoryEngine>,
    wrap: impl FnOnce(SandboxStore) -> Arc<dyn ContainerEngine>,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("netlab.db").display());
    let store = SandboxStore::connect(&url, &StoreOptions::default())
        .await
        .unwrap();
    store.migrate().await.unwrap();

    let objects = Arc::new(MemoryObjectStore::new());
    let runtime = RuntimeDriver::new(
        wrap(store.clone()),
        RuntimeConfig {
            namespace: NAMESPACE.to_string(),
            network_driver: "bridge".to_string(),
        },
    );
    let pki = PkiIssuer::new(
        PkiConfig {
            namespace: NAMESPACE.to_string(),
            vpn_host: "labs.example.org".to_string(),
            organization: "netlab".to_string(),
            country: None,
            tls_crypt_key: TlsCryptKey::parse(&"5c".repeat(256)).unwrap(),
        },
        objects.clone(),
        Arc::new(SystemClock),
    );

    Harness {
        orchestrator: Arc::new(Orchestrator::new(store.clone(), runtime, pki)),
        engine,
        objects,
        store,
        _dir: dir,
    }
}

async fn setup() -> Harness {
    let engine = Arc::new(MemoryEngine::new());
    let runtime_engine = engine.clone();
    setup_with_engine(engine, move |_| runtime_engine as Arc<dyn ContainerEngine>).await
}

/// One bridged VPN gateway and one worker on an isolated network
fn intro_deployment(user_id: i64) -> Deployment {
    Deployment::new(
        vec![NetworkSpec::new("lan")],
        vec![
            ContainerSpec::vpn_gateway("vpn", "netlab/openvpn", user_id, &["lan"]).unwrap(),
            ContainerSpec::new("worker", "netlab/host").network(NetworkAttachment::new("lan")),
        ],
    )
}

fn user_filters(user_id: i64) -> Vec<String> {
    vec![
        format!("user_id={}", user_id),
        format!("namespace={}", NAMESPACE),
    ]
}

async fn resource_counts(engine: &MemoryEngine, user_id: i64) -> (usize, usize) {
    let filters = user_filters(user_id);
    (
        engine.list_containers(&filters).await.unwrap().len(),
        engine.list_networks(&filters).await.unwrap().len(),
    )
}

#[tokio::test]
async fn test_launch_and_stop_end_to_end() {
    let harness = setup().await;

    let record = harness
        .orchestrator
        .start(7, "intro", &intro_deployment(7))
        .await
        .expect("Failed to launch sandbox");

    assert_eq!(record.state, SandboxState::Ready);
    assert_eq!(record.chapter.as_deref(), Some("intro"));
    assert_eq!(resource_counts(&harness.engine, 7).await, (2, 1));

    let gateway = harness.engine.container("netlab-7-vpn").await.unwrap();
    assert!(gateway.started);
    assert_eq!(gateway.request.network_mode, "bridge");
    assert_eq!(gateway.endpoints.len(), 1);
    assert_eq!(
        gateway.endpoints[0].mac_address.as_deref(),
        Some("06:00:00:00:07:00")
    );
    assert_eq!(gateway.request.port_bindings[0].host_port, record.port);

    let worker = harness.engine.container("netlab-7-worker").await.unwrap();
    assert!(worker.started);
    assert_eq!(worker.request.network_mode, "netlab-7-lan");
    assert!(!worker.request.env.iter().any(|e| e.starts_with("KEY=")));

    let stopped = harness.orchestrator.stop(7).await.expect("Failed to stop");

    assert_eq!(stopped.state, SandboxState::Disabled);
    assert_eq!(resource_counts(&harness.engine, 7).await, (0, 0));

    let stored = harness.orchestrator.status(7).await.unwrap().unwrap();
    assert_eq!(stored.state, SandboxState::Disabled);
}

#[tokio::test]
async fn test_relaunch_reuses_port_and_vpn_material() {
    let harness = setup().await;

    let first = harness
        .orchestrator
        .start(7, "intro", &intro_deployment(7))
        .await
        .unwrap();
    let profile = harness
        .objects
        .get("vpn/7/config-linux.ovpn")
        .await
        .unwrap();

    harness.orchestrator.stop(7).await.unwrap();

    let second = harness
        .orchestrator
        .start(7, "intro", &intro_deployment(7))
        .await
        .unwrap();

    assert_eq!(first.port, second.port);
    assert_eq!(first.vpn, second.vpn);
    assert!(first.vpn.is_some());
    assert_eq!(harness.objects.len().await, 2);
    assert_eq!(
        harness.objects.get("vpn/7/config-linux.ovpn").await.unwrap(),
        profile
    );
    assert_eq!(resource_counts(&harness.engine, 7).await, (2, 1));
}

#[tokio::test]
async fn test_relaunch_cleans_leftovers() {
    let harness = setup().await;

    harness
        .orchestrator
        .start(7, "intro", &intro_deployment(7))
        .await
        .unwrap();

    // A ready sandbox relaunched on a new chapter replaces its topology
    let mut record = harness
        .orchestrator
        .acquire(7, Some("routing"), false)
        .await
        .unwrap();
    let routing = Deployment::new(
        vec![NetworkSpec::new("lan"), NetworkSpec::new("wan")],
        vec![ContainerSpec::new("router", "netlab/router")
            .network(NetworkAttachment::new("lan"))
            .network(NetworkAttachment::new("wan"))],
    );
    harness
        .orchestrator
        .launch(&mut record, &routing)
        .await
        .unwrap();

    assert_eq!(record.state, SandboxState::Ready);
    assert_eq!(record.chapter.as_deref(), Some("routing"));
    assert_eq!(resource_counts(&harness.engine, 7).await, (1, 2));
    assert!(harness.engine.container("netlab-7-worker").await.is_none());
}

#[tokio::test]
async fn test_ports_are_distinct_per_user() {
    let harness = setup().await;

    let a = harness
        .orchestrator
        .start(20, "intro", &intro_deployment(20))
        .await
        .unwrap();
    let b = harness
        .orchestrator
        .start(21, "intro", &intro_deployment(21))
        .await
        .unwrap();

    assert_ne!(a.port, b.port);
    assert_eq!(resource_counts(&harness.engine, 20).await, (2, 1));
    assert_eq!(resource_counts(&harness.engine, 21).await, (2, 1));
}

#[tokio::test]
async fn test_concurrent_operations_have_single_winner() {
    let harness = setup().await;
    harness
        .orchestrator
        .start(9, "intro", &intro_deployment(9))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = harness.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.acquire(9, Some("routing"), false).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(record) => {
                winners += 1;
                assert_eq!(record.state, SandboxState::InProgress);
            }
            Err(e) if e.is_conflict() => conflicts += 1,
            Err(e) => panic!("Unexpected error: {}", e),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);

    let stored = harness.orchestrator.status(9).await.unwrap().unwrap();
    assert_eq!(stored.state, SandboxState::InProgress);
    assert_eq!(stored.chapter.as_deref(), Some("routing"));

    let err = harness.orchestrator.stop(9).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(resource_counts(&harness.engine, 9).await, (2, 1));
}

#[tokio::test]
async fn test_assert_chapter_guards_stale_requests() {
    let harness = setup().await;
    harness
        .orchestrator
        .start(5, "intro", &intro_deployment(5))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .acquire(5, Some("routing"), true)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let record = harness
        .orchestrator
        .acquire(5, Some("intro"), true)
        .await
        .unwrap();
    assert_eq!(record.state, SandboxState::InProgress);
}

/// Engine that performs one extra action when a given user's sandbox is cleaned
struct SweepEngine {
    inner: Arc<MemoryEngine>,
    store: SandboxStore,
    action: Mutex<Option<SweepAction>>,
}

enum SweepAction {
    /// Lock `victim` as if another process got there first
    Lock { trigger: i64, victim: i64 },
    /// Fail cleaning `trigger` with an engine error
    Fail { trigger: i64 },
}

impl SweepEngine {
    fn arm(&self, action: SweepAction) {
        *self.action.lock().unwrap() = Some(action);
    }

    fn take_for(&self, labels: &[String]) -> Option<SweepAction> {
        let mut action = self.action.lock().unwrap();
        let trigger = match action.as_ref()? {
            SweepAction::Lock { trigger, .. } | SweepAction::Fail { trigger } => *trigger,
        };
        if labels.contains(&format!("user_id={}", trigger)) {
            action.take()
        } else {
            None
        }
    }
}

#[async_trait]
impl ContainerEngine for SweepEngine {
    async fn is_available(&self) -> bool {
        true
    }

    async fn create_network(&self, request: &NetworkRequest) -> Result<String, RuntimeError> {
        self.inner.create_network(request).await
    }

    async fn list_networks(&self, labels: &[String]) -> Result<Vec<String>, RuntimeError> {
        self.inner.list_networks(labels).await
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.inner.remove_network(id).await
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<String, RuntimeError> {
        self.inner.create_container(request).await
    }

    async fn connect_network(
        &self,
        container_id: &str,
        endpoint: &EndpointRequest,
    ) -> Result<(), RuntimeError> {
        self.inner.connect_network(container_id, endpoint).await
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.inner.start_container(container_id).await
    }

    async fn list_containers(&self, labels: &[String]) -> Result<Vec<String>, RuntimeError> {
        match self.take_for(labels) {
            Some(SweepAction::Lock { victim, .. }) => {
                self.store.acquire(victim, None, false).await.unwrap();
            }
            Some(SweepAction::Fail { trigger }) => {
                return Err(RuntimeError::Engine(format!(
                    "engine unavailable while cleaning user {}",
                    trigger
                )));
            }
            None => {}
        }
        self.inner.list_containers(labels).await
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.inner.remove_container(container_id).await
    }
}

async fn setup_sweep() -> (Harness, Arc<SweepEngine>) {
    let engine = Arc::new(MemoryEngine::new());
    let inner = engine.clone();
    let sweep = Arc::new(Mutex::new(None));
    let sweep_handle = sweep.clone();

    let harness = setup_with_engine(engine, move |store| {
        let sweep_engine = Arc::new(SweepEngine {
            inner,
            store,
            action: Mutex::new(None),
        });
        *sweep_handle.lock().unwrap() = Some(sweep_engine.clone());
        sweep_engine as Arc<dyn ContainerEngine>
    })
    .await;

    let sweep_engine = sweep.lock().unwrap().take().unwrap();
    (harness, sweep_engine)
}

#[tokio::test]
async fn test_stop_all_filters_by_chapter() {
    let (harness, _sweep) = setup_sweep().await;
    for user_id in [10, 11] {
        harness
            .orchestrator
            .start(user_id, "intro", &intro_deployment(user_id))
            .await
            .unwrap();
    }
    harness
        .orchestrator
        .start(12, "routing", &intro_deployment(12))
        .await
        .unwrap();

    let stopped = harness.orchestrator.stop_all(Some("intro")).await.unwrap();

    assert_eq!(stopped, 2);
    assert_eq!(resource_counts(&harness.engine, 10).await, (0, 0));
    assert_eq!(resource_counts(&harness.engine, 11).await, (0, 0));
    assert_eq!(resource_counts(&harness.engine, 12).await, (2, 1));

    let stopped = harness.orchestrator.stop_all(None).await.unwrap();
    assert_eq!(stopped, 1);
    assert_eq!(harness.store.list_ready(None).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_stop_all_skips_conflicts() {
    let (harness, sweep) = setup_sweep().await;
    for user_id in [10, 11, 12] {
        harness
            .orchestrator
            .start(user_id, "intro", &intro_deployment(user_id))
            .await
            .unwrap();
    }

    // While user 10 is being stopped, another process takes user 11
    sweep.arm(SweepAction::Lock {
        trigger: 10,
        victim: 11,
    });

    let stopped = harness.orchestrator.stop_all(None).await.unwrap();

    assert_eq!(stopped, 2);
    let states: Vec<SandboxState> = states_of(&harness, &[10, 11, 12]).await;
    assert_eq!(
        states,
        vec![
            SandboxState::Disabled,
            SandboxState::InProgress,
            SandboxState::Disabled
        ]
    );
    assert_eq!(resource_counts(&harness.engine, 11).await, (2, 1));
}

#[tokio::test]
async fn test_stop_all_aborts_on_engine_error() {
    let (harness, sweep) = setup_sweep().await;
    for user_id in [10, 11, 12] {
        harness
            .orchestrator
            .start(user_id, "intro", &intro_deployment(user_id))
            .await
            .unwrap();
    }

    sweep.arm(SweepAction::Fail { trigger: 11 });

    let err = harness.orchestrator.stop_all(None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Runtime(RuntimeError::Engine(_))));

    let states = states_of(&harness, &[10, 11, 12]).await;
    assert_eq!(
        states,
        vec![
            SandboxState::Disabled,
            SandboxState::InProgress,
            SandboxState::Ready
        ]
    );
}

async fn states_of(harness: &Harness, users: &[i64]) -> Vec<SandboxState> {
    let mut states = Vec::new();
    for user_id in users {
        let record = harness.orchestrator.status(*user_id).await.unwrap().unwrap();
        states.push(record.state);
    }
    states
}
