//! Session service routing, status transitions and failure cleanup.

#![cfg(unix)]

mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use virserver::adapters::{Qemu, RegisterScope};
use virserver::board::{
    BoardConfig, InterconnectConfig, IrqRoute, MmioMapping, ResourceConfig, SharedMemoryConfig,
};
use virserver::session::{BoardTemplate, Session, SessionStatus, SessionStore};
use virserver::{
    build_adapters, BackendAdapter, BackendType, Caller, CreateSessionRequest, ErrorKind,
    MemoryStore, OpContext, PortAllocator, PowerAction, QemuAdapter, Result, SessionService,
    SimError,
};

struct Harness {
    service: Arc<SessionService>,
    store: Arc<MemoryStore>,
    ports: Arc<PortAllocator>,
    adapters: Vec<Arc<dyn BackendAdapter>>,
}

impl Harness {
    async fn new(root: &Path, script: &str) -> Self {
        let store = Arc::new(MemoryStore::seeded());
        Self::with_store(root, script, store.clone(), store).await
    }

    async fn with_store(
        root: &Path,
        script: &str,
        store: Arc<MemoryStore>,
        backing: Arc<dyn SessionStore>,
    ) -> Self {
        let config = broker(root, script);
        let ports = port_pool(300);
        let service = Arc::new(SessionService::new(backing, BackendType::Qemu));
        let adapters = build_adapters(&config, ports.clone());
        for adapter in &adapters {
            service.register_adapter(adapter.clone()).await;
        }
        Self {
            service,
            store,
            ports,
            adapters,
        }
    }

    /// Serve the engine sockets of a session's instance.
    async fn fake_target(&self, caller: &Caller, session_id: &str) -> FakeTarget {
        let Ok((adapter, instance_id)) = self.service.get_adapter(caller, session_id).await else {
            panic!("session {session_id} has no route");
        };
        fake_target(&*adapter, &instance_id).await
    }

    async fn live_instances(&self) -> usize {
        let mut total = 0;
        for adapter in &self.adapters {
            total += adapter.list_instances().await.len();
        }
        total
    }
}

fn request(name: &str, backend: BackendType) -> CreateSessionRequest {
    CreateSessionRequest {
        name: name.to_string(),
        backend: Some(backend),
        board_config: Some(board_json(backend)),
        board_template: None,
        resources: ResourceConfig::default(),
    }
}

/// Store whose session writes always fail.
struct FailingStore {
    inner: MemoryStore,
}

#[async_trait]
impl SessionStore for FailingStore {
    async fn insert_session(&self, _session: &Session) -> Result<()> {
        Err(SimError::Internal("disk full".to_string()))
    }

    async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.inner.get_session(session_id).await
    }

    async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        self.inner.update_status(session_id, status).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.inner.delete_session(session_id).await
    }

    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        self.inner.list_sessions(user_id).await
    }

    async fn get_template(&self, template_id: &str) -> Result<String> {
        self.inner.get_template(template_id).await
    }

    async fn put_template(&self, template: BoardTemplate) -> Result<()> {
        self.inner.put_template(template).await
    }
}

#[tokio::test]
async fn create_power_cycle_and_delete() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let ctx = OpContext::background();
    let alice = Caller::new("alice");

    let session = h
        .service
        .create_session(&ctx, &alice, request("board-a", BackendType::Qemu))
        .await
        .expect("create");
    assert_eq!(session.status, SessionStatus::Created);
    assert_eq!(session.instance_id, format!("qemu-{}", session.id));
    assert_eq!(h.ports.allocated_count(), 3);
    let _target = h.fake_target(&alice, &session.id).await;

    let on = h
        .service
        .power_control(&ctx, &alice, &session.id, PowerAction::On)
        .await
        .expect("power on");
    assert_eq!(on.status, SessionStatus::Running);

    let err = h
        .service
        .power_control(&ctx, &alice, &session.id, PowerAction::On)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

    let paused = h
        .service
        .power_control(&ctx, &alice, &session.id, PowerAction::Pause)
        .await
        .expect("pause");
    assert_eq!(paused.status, SessionStatus::Paused);
    let resumed = h
        .service
        .power_control(&ctx, &alice, &session.id, PowerAction::Resume)
        .await
        .expect("resume");
    assert_eq!(resumed.status, SessionStatus::Running);

    let off = h
        .service
        .power_control(&ctx, &alice, &session.id, PowerAction::Off)
        .await
        .expect("power off");
    assert_eq!(off.status, SessionStatus::Stopped);

    h.service
        .delete_session(&ctx, &alice, &session.id)
        .await
        .expect("delete");
    assert_eq!(
        h.service
            .get_session(&alice, &session.id)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    // The routed adapter has no Debug, so compare the error kinds only.
    assert_eq!(
        h.service
            .get_adapter(&alice, &session.id)
            .await
            .err()
            .map(|e| e.kind()),
        Some(ErrorKind::NotFound)
    );
    assert_eq!(h.service.runtime_count().await, 0);
    assert_eq!(h.ports.allocated_count(), 0);
}

#[tokio::test]
async fn invalid_transitions_do_not_reach_the_adapter() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let ctx = OpContext::background();
    let caller = Caller::anonymous();

    let session = h
        .service
        .create_session(&ctx, &caller, request("idle", BackendType::Renode))
        .await
        .expect("create");
    for action in [PowerAction::Off, PowerAction::Pause, PowerAction::Resume, PowerAction::Reset] {
        let err = h
            .service
            .power_control(&ctx, &caller, &session.id, action)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState, "{action}");
    }
    let stored = h
        .service
        .get_session(&caller, &session.id)
        .await
        .expect("get");
    assert_eq!(stored.status, SessionStatus::Created);
    assert!(!h.adapters[1]
        .instance_info(&session.instance_id)
        .await
        .expect("info")
        .running);
}

#[tokio::test]
async fn request_validation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let ctx = OpContext::background();
    let caller = Caller::anonymous();

    let err = h
        .service
        .create_session(&ctx, &caller, request("  ", BackendType::Qemu))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut neither = request("x", BackendType::Qemu);
    neither.board_config = None;
    let err = h
        .service
        .create_session(&ctx, &caller, neither)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut broken = request("x", BackendType::Qemu);
    broken.board_config = Some("{not json".to_string());
    let err = h
        .service
        .create_session(&ctx, &caller, broken)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    assert_eq!(h.live_instances().await, 0);
    assert_eq!(h.ports.allocated_count(), 0);
}

#[tokio::test]
async fn missing_template_creates_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let ctx = OpContext::background();
    let caller = Caller::anonymous();

    let err = h
        .service
        .create_session(
            &ctx,
            &caller,
            CreateSessionRequest {
                name: "from-template".to_string(),
                board_template: Some("no-such-board".to_string()),
                ..CreateSessionRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.live_instances().await, 0);
    assert_eq!(h.service.runtime_count().await, 0);
    assert!(h
        .service
        .list_sessions(&caller)
        .await
        .expect("list")
        .is_empty());
}

/// Two cores sharing a mailbox, with a doorbell interrupt each way.
fn dual_core_board() -> BoardConfig {
    let mut board = board(BackendType::SkyEye);
    board.system_id = "lab-dual".to_string();
    board.name = "Lab Dual Core".to_string();
    let mut dsp = board.nodes[0].clone();
    dsp.id = "dsp".to_string();
    dsp.backend = BackendType::Qemu;
    board.nodes.push(dsp);
    board.interconnect = Some(InterconnectConfig {
        shared_memory: vec![SharedMemoryConfig {
            id: "mailbox".to_string(),
            address: 0x3000_0000,
            size: 0x1000,
            nodes: vec!["mcu".to_string(), "dsp".to_string()],
        }],
        mmio_map: vec![MmioMapping {
            source_node: "mcu".to_string(),
            target_node: "dsp".to_string(),
            address: 0x5000_0000,
            size: 0x100,
        }],
        irq_routes: vec![
            IrqRoute {
                source_node: "mcu".to_string(),
                source_irq: 3,
                target_node: "dsp".to_string(),
                target_irq: 7,
                latency: 10,
            },
            IrqRoute {
                source_node: "dsp".to_string(),
                source_irq: 7,
                target_node: "mcu".to_string(),
                target_irq: 3,
                latency: 0,
            },
        ],
    });
    board
}

#[tokio::test]
async fn templates_resolve_to_boards() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let ctx = OpContext::background();
    let caller = Caller::anonymous();

    let stock = h
        .service
        .create_session(
            &ctx,
            &caller,
            CreateSessionRequest {
                name: "disco".to_string(),
                board_template: Some("stm32f4-disco".to_string()),
                ..CreateSessionRequest::default()
            },
        )
        .await
        .expect("stock template");
    assert_eq!(stock.backend, BackendType::Qemu);
    assert!(stock.board_config.contains("stm32f4-disco"));

    let board = dual_core_board();
    h.store
        .put_template(BoardTemplate {
            id: "lab-dual".to_string(),
            name: "Lab Dual Core".to_string(),
            description: String::new(),
            backend: BackendType::SkyEye,
            config: board.to_json().expect("board json"),
            tags: vec!["multicore".to_string()],
        })
        .await
        .expect("put template");

    // The stored text decodes to the same board, interconnect included.
    let stored = h.store.get_template("lab-dual").await.expect("get template");
    assert_eq!(BoardConfig::from_json(&stored).expect("template parses"), board);

    let custom = h
        .service
        .create_session(
            &ctx,
            &caller,
            CreateSessionRequest {
                name: "lab".to_string(),
                backend: Some(BackendType::SkyEye),
                board_template: Some("lab-dual".to_string()),
                ..CreateSessionRequest::default()
            },
        )
        .await
        .expect("custom template");
    assert_eq!(custom.instance_id, format!("skyeye-{}", custom.id));
    assert_eq!(
        BoardConfig::from_json(&custom.board_config).expect("session board"),
        board
    );
}

#[tokio::test]
async fn failed_persistence_rolls_back_the_instance() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::seeded());
    let failing = Arc::new(FailingStore {
        inner: MemoryStore::seeded(),
    });
    let h = Harness::with_store(tmp.path(), IDLE_ENGINE, store, failing).await;
    let ctx = OpContext::background();

    let err = h
        .service
        .create_session(&ctx, &Caller::anonymous(), request("doomed", BackendType::Qemu))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(h.live_instances().await, 0);
    assert_eq!(h.service.runtime_count().await, 0);
    assert_eq!(h.ports.allocated_count(), 0);
}

#[tokio::test]
async fn unregistered_backend_is_unsupported() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = broker(tmp.path(), IDLE_ENGINE);
    let ports = port_pool(10);
    let service = SessionService::new(Arc::new(MemoryStore::new()), BackendType::Qemu);
    service
        .register_adapter(Arc::new(QemuAdapter::new(Qemu, &config, ports.clone())))
        .await;

    let err = service
        .create_session(
            &OpContext::background(),
            &Caller::anonymous(),
            request("renode", BackendType::Renode),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(ports.allocated_count(), 0);
}

#[tokio::test]
async fn sessions_are_private_to_their_owner() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let ctx = OpContext::background();
    let alice = Caller::new("alice");
    let bob = Caller::new("bob");

    let session = h
        .service
        .create_session(&ctx, &alice, request("mine", BackendType::Qemu))
        .await
        .expect("create");
    h.service
        .create_session(&ctx, &alice, request("also mine", BackendType::Renode))
        .await
        .expect("create");

    assert_eq!(
        h.service
            .get_session(&bob, &session.id)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        h.service
            .get_adapter(&bob, &session.id)
            .await
            .err()
            .map(|e| e.kind()),
        Some(ErrorKind::NotFound)
    );
    assert_eq!(
        h.service
            .delete_session(&ctx, &bob, &session.id)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    assert_eq!(h.service.list_sessions(&alice).await.expect("list").len(), 2);
    assert!(h.service.list_sessions(&bob).await.expect("list").is_empty());

    let (adapter, instance_id) = h
        .service
        .get_adapter(&alice, &session.id)
        .await
        .expect("route");
    assert_eq!(adapter.backend_type(), BackendType::Qemu);
    assert_eq!(instance_id, session.instance_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_get_distinct_ids_and_ports() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;

    let mut tasks = Vec::new();
    for n in 0..16 {
        let service = h.service.clone();
        let backend = BackendType::ALL[n % 3];
        tasks.push(tokio::spawn(async move {
            service
                .create_session(
                    &OpContext::background(),
                    &Caller::anonymous(),
                    request(&format!("s{n}"), backend),
                )
                .await
        }));
    }

    let mut instance_ids = HashSet::new();
    for task in tasks {
        let session = task.await.expect("join").expect("create");
        assert!(instance_ids.insert(session.instance_id));
    }
    assert_eq!(h.service.runtime_count().await, 16);

    let mut ports = HashSet::new();
    for adapter in &h.adapters {
        for info in adapter.list_instances().await {
            for port in info.ports.all() {
                assert!(ports.insert(port), "port {port} handed out twice");
            }
        }
    }
    assert_eq!(ports.len(), h.ports.allocated_count());

    h.service.shutdown_all(&OpContext::background()).await;
    assert_eq!(h.ports.allocated_count(), 0);
}

#[tokio::test]
async fn engine_crash_moves_session_to_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), CRASHING_ENGINE).await;
    let ctx = OpContext::background();
    let caller = Caller::anonymous();

    let session = h
        .service
        .create_session(&ctx, &caller, request("crashy", BackendType::Qemu))
        .await
        .expect("create");
    let _target = h.fake_target(&caller, &session.id).await;
    h.service
        .power_control(&ctx, &caller, &session.id, PowerAction::On)
        .await
        .expect("power on");

    let (adapter, instance_id) = h
        .service
        .get_adapter(&caller, &session.id)
        .await
        .expect("route");
    let (a, c, i) = (&adapter, &ctx, instance_id.as_str());
    let err = eventually(Duration::from_secs(5), move || async move {
        a.read_registers(c, i, RegisterScope::All).await.err()
    })
    .await
    .expect("crash is observed");
    h.service.observe(&session.id, &Err::<(), _>(err)).await;

    let stored = h
        .service
        .get_session(&caller, &session.id)
        .await
        .expect("get");
    assert_eq!(stored.status, SessionStatus::Error);

    // Only deletion is left.
    let err = h
        .service
        .power_control(&ctx, &caller, &session.id, PowerAction::On)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    h.service
        .delete_session(&ctx, &caller, &session.id)
        .await
        .expect("delete");
    assert_eq!(h.ports.allocated_count(), 0);
}

#[tokio::test]
async fn observe_ignores_caller_errors() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let ctx = OpContext::background();
    let caller = Caller::anonymous();
    let session = h
        .service
        .create_session(&ctx, &caller, request("s", BackendType::Qemu))
        .await
        .expect("create");

    let (adapter, instance_id) = h
        .service
        .get_adapter(&caller, &session.id)
        .await
        .expect("route");
    let result = adapter
        .read_memory(&ctx, &instance_id, RAM_BASE, 4)
        .await;
    assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::InvalidState);
    h.service.observe(&session.id, &result).await;

    let stored = h
        .service
        .get_session(&caller, &session.id)
        .await
        .expect("get");
    assert_eq!(stored.status, SessionStatus::Created);
}

#[tokio::test]
async fn reconcile_marks_orphaned_sessions() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::seeded());
    let h = Harness::with_store(tmp.path(), IDLE_ENGINE, store.clone(), store.clone()).await;

    let now = Utc::now();
    for (id, status) in [
        ("orphan-running", SessionStatus::Running),
        ("orphan-stopped", SessionStatus::Stopped),
        ("gone", SessionStatus::Destroyed),
    ] {
        store
            .insert_session(&Session {
                id: id.to_string(),
                name: id.to_string(),
                backend: BackendType::Qemu,
                status,
                board_config: board_json(BackendType::Qemu),
                instance_id: format!("qemu-{id}"),
                user_id: "anonymous".to_string(),
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("insert");
    }
    let live = h
        .service
        .create_session(
            &OpContext::background(),
            &Caller::anonymous(),
            request("live", BackendType::Qemu),
        )
        .await
        .expect("create");

    assert_eq!(h.service.reconcile().await.expect("reconcile"), 2);

    let status = |id: &str| {
        let store = store.clone();
        let id = id.to_string();
        async move { store.get_session(&id).await.expect("get").status }
    };
    assert_eq!(status("orphan-running").await, SessionStatus::Error);
    assert_eq!(status("orphan-stopped").await, SessionStatus::Error);
    assert_eq!(status("gone").await, SessionStatus::Destroyed);
    assert_eq!(status(&live.id).await, SessionStatus::Created);
}

#[tokio::test]
async fn capability_matrix_spans_backends() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let matrix = h.service.capabilities().await;

    assert_eq!(matrix.backends.len(), 3);
    assert_eq!(
        matrix.processors["ARM Cortex-M3"],
        vec![BackendType::Qemu, BackendType::Renode, BackendType::SkyEye]
    );
    assert_eq!(matrix.buses["AMBA"], vec![BackendType::SkyEye]);
    assert!(matrix.backends[&BackendType::Qemu].features.coverage);
    assert!(!matrix.backends[&BackendType::SkyEye].features.snapshot);
}

#[tokio::test]
async fn shutdown_all_destroys_every_instance() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), IDLE_ENGINE).await;
    let ctx = OpContext::background();
    let caller = Caller::anonymous();

    let first = h
        .service
        .create_session(&ctx, &caller, request("one", BackendType::Qemu))
        .await
        .expect("create");
    h.service
        .create_session(&ctx, &caller, request("two", BackendType::SkyEye))
        .await
        .expect("create");
    let _target = h.fake_target(&caller, &first.id).await;
    h.service
        .power_control(&ctx, &caller, &first.id, PowerAction::On)
        .await
        .expect("power on");

    h.service.shutdown_all(&ctx).await;
    assert_eq!(h.service.runtime_count().await, 0);
    assert_eq!(h.live_instances().await, 0);
    assert_eq!(h.ports.allocated_count(), 0);
    for session in h.service.list_sessions(&caller).await.expect("list") {
        assert_eq!(session.status, SessionStatus::Destroyed);
    }
}
