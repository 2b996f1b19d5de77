//! Registry behavior against scripted and real hosts.

use async_trait::async_trait;
use isohost_core::{
    ActivationHostDescription, ActivationHostRegistry, Component, ComponentCatalog,
    ComponentError, HostBackend, HostError, HostFactory, HostId, IsolationLevel,
    IsolationMetadata, ObjectId, ObjectReference, RegistryConfig, RemoteActivator,
    RuntimeArgument,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

// ============================================================================
// Scripted hosts
// ============================================================================

/// Shared counters and per-host reachability switches.
#[derive(Default)]
struct Script {
    unreachable_by_default: AtomicBool,
    dead_groups: Mutex<Vec<String>>,
    heartbeats: AtomicUsize,
    stops: AtomicUsize,
    switches: Mutex<Vec<(HostId, Arc<AtomicBool>)>>,
}

impl Script {
    fn set_reachable(&self, host: HostId, reachable: bool) {
        let switches = self.switches.lock().unwrap();
        let (_, switch) = switches.iter().find(|(id, _)| *id == host).unwrap();
        switch.store(reachable, Ordering::SeqCst);
    }
}

struct ScriptedFactory(Arc<Script>);

impl HostFactory for ScriptedFactory {
    fn create(
        &self,
        id: HostId,
        description: &ActivationHostDescription,
    ) -> isohost_core::Result<Box<dyn HostBackend>> {
        let dead = self
            .0
            .dead_groups
            .lock()
            .unwrap()
            .iter()
            .any(|group| group == description.group());
        let reachable = Arc::new(AtomicBool::new(
            !dead && !self.0.unreachable_by_default.load(Ordering::SeqCst),
        ));
        self.0
            .switches
            .lock()
            .unwrap()
            .push((id, Arc::clone(&reachable)));
        Ok(Box::new(ScriptedBackend {
            id,
            reachable,
            script: Arc::clone(&self.0),
        }))
    }
}

struct ScriptedBackend {
    id: HostId,
    reachable: Arc<AtomicBool>,
    script: Arc<Script>,
}

#[async_trait]
impl HostBackend for ScriptedBackend {
    async fn start(&self) -> isohost_core::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> isohost_core::Result<()> {
        self.script.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn activator(&self) -> isohost_core::Result<Box<dyn RemoteActivator>> {
        Ok(Box::new(ScriptedActivator {
            id: self.id,
            reachable: Arc::clone(&self.reachable),
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedActivator {
    id: HostId,
    reachable: Arc<AtomicBool>,
    script: Arc<Script>,
}

impl ScriptedActivator {
    fn check(&self) -> isohost_core::Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HostError::Unreachable("scripted host is down".into()))
        }
    }
}

#[async_trait]
impl RemoteActivator for ScriptedActivator {
    async fn heartbeat(&mut self) -> isohost_core::Result<()> {
        self.script.heartbeats.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn activate_instance(
        &mut self,
        description: &ActivationHostDescription,
        _module: &str,
        type_name: &str,
    ) -> isohost_core::Result<ObjectReference> {
        self.check()?;
        Ok(ObjectReference::new(
            ObjectId::new(),
            self.id,
            description.clone(),
            type_name,
        ))
    }

    async fn invoke_member(
        &mut self,
        _reference: &ObjectReference,
        member: &str,
        _arguments: Vec<RuntimeArgument>,
    ) -> isohost_core::Result<Value> {
        self.check()?;
        match member {
            "fail" => Err(HostError::Invocation {
                member: member.to_string(),
                message: "scripted failure".into(),
            }),
            _ => Ok(json!("ok")),
        }
    }

    async fn deactivate_instance(&mut self, _reference: &ObjectReference) -> isohost_core::Result<()> {
        self.check()
    }
}

fn scripted_registry() -> (ActivationHostRegistry, Arc<Script>) {
    let script = Arc::new(Script::default());
    let registry = ActivationHostRegistry::with_factory(
        RegistryConfig::default(),
        Arc::new(ScriptedFactory(Arc::clone(&script))),
    )
    .expect("valid config");
    (registry, script)
}

fn metadata(isolation: IsolationLevel, group: &str) -> IsolationMetadata {
    IsolationMetadata::new(isolation).group(group)
}

// ============================================================================
// Selection
// ============================================================================

#[tokio::test]
async fn test_same_description_reuses_host() {
    let (registry, _script) = scripted_registry();
    let metadata = metadata(IsolationLevel::SandboxedInProcess, "shared");

    let first = registry.get_host("A", &metadata).await.expect("first");
    let second = registry.get_host("B", &metadata).await.expect("second");

    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.is_started());
    assert!(first.has_activated("A"));
    assert!(first.has_activated("B"));
    assert_eq!(registry.host_count().await, 1);
}

#[tokio::test]
async fn test_groups_and_levels_get_distinct_hosts() {
    let (registry, _script) = scripted_registry();

    let a = registry
        .get_host("T", &metadata(IsolationLevel::None, "one"))
        .await
        .expect("a");
    let b = registry
        .get_host("T", &metadata(IsolationLevel::None, "two"))
        .await
        .expect("b");
    let c = registry
        .get_host("T", &metadata(IsolationLevel::SeparateProcess, "one"))
        .await
        .expect("c");

    assert_ne!(a.id(), b.id());
    assert_ne!(a.id(), c.id());
    assert_eq!(registry.host_count().await, 3);
}

#[tokio::test]
async fn test_host_per_instance_never_repeats_a_type() {
    let (registry, _script) = scripted_registry();
    let metadata = metadata(IsolationLevel::SeparateProcess, "workers").host_per_instance(true);

    let first = registry.get_host("Worker", &metadata).await.expect("first");
    let second = registry.get_host("Worker", &metadata).await.expect("second");

    assert_ne!(first.id(), second.id());
    assert_eq!(first.activated_types().len(), 1);
    assert_eq!(second.activated_types().len(), 1);

    // A different type may share an existing host.
    let third = registry.get_host("Other", &metadata).await.expect("third");
    assert!(Arc::ptr_eq(&first, &third));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_host_creates_one_host() {
    let (registry, _script) = scripted_registry();
    let metadata = metadata(IsolationLevel::None, "busy");

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let registry = registry.clone();
            let metadata = metadata.clone();
            tokio::spawn(async move { registry.get_host(&format!("T{i}"), &metadata).await })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().expect("host").id());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(registry.host_count().await, 1);
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_exhausts_handshake() {
    let (registry, script) = scripted_registry();
    script.unreachable_by_default.store(true, Ordering::SeqCst);
    let mut faults = registry.subscribe();

    let began = tokio::time::Instant::now();
    let result = registry
        .get_host("T", &metadata(IsolationLevel::SeparateProcess, "dead"))
        .await;
    let elapsed = began.elapsed();

    assert!(matches!(
        result,
        Err(HostError::HandshakeExhausted { attempts: 4, .. })
    ));
    assert_eq!(script.heartbeats.load(Ordering::SeqCst), 4);
    assert!(elapsed >= Duration::from_millis(1500), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1600), "elapsed {elapsed:?}");

    let hosts = registry.hosts().await;
    assert_eq!(hosts.len(), 1);
    assert!(hosts[0].is_faulted());
    assert!(!hosts[0].is_started());

    let event = faults.try_recv().expect("fault event");
    assert_eq!(event.host, hosts[0].id());
    assert!(matches!(event.cause, HostError::HandshakeExhausted { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_dead_group_does_not_block_other_groups() {
    let (registry, script) = scripted_registry();
    script.dead_groups.lock().unwrap().push("dead".into());

    let doomed = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .get_host("T", &metadata(IsolationLevel::SeparateProcess, "dead"))
                .await
        })
    };
    // Let the doomed handshake take its creation guard and start backing off.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let began = tokio::time::Instant::now();
    let healthy = registry
        .get_host("T", &metadata(IsolationLevel::SeparateProcess, "healthy"))
        .await
        .expect("healthy host");
    assert!(
        began.elapsed() < Duration::from_millis(100),
        "waited {:?}",
        began.elapsed()
    );
    assert!(!healthy.is_faulted());

    assert!(matches!(
        doomed.await.unwrap(),
        Err(HostError::HandshakeExhausted { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_failed_host_is_replaced_on_next_request() {
    let (registry, script) = scripted_registry();
    let metadata = metadata(IsolationLevel::None, "flaky");

    script.unreachable_by_default.store(true, Ordering::SeqCst);
    assert!(registry.get_host("T", &metadata).await.is_err());

    script.unreachable_by_default.store(false, Ordering::SeqCst);
    let host = registry.get_host("T", &metadata).await.expect("replacement");
    assert!(!host.is_faulted());
    assert_eq!(registry.host_count().await, 2);
}

// ============================================================================
// Fault handling
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mark_faulted_notifies_once() {
    let (registry, _script) = scripted_registry();
    let host = registry
        .get_host("T", &metadata(IsolationLevel::None, "race"))
        .await
        .expect("host");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    registry.on_faulted(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut faults = registry.subscribe();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            let host = Arc::clone(&host);
            tokio::spawn(async move {
                registry.mark_faulted(&host, HostError::Unreachable("race".into()))
            })
        })
        .collect();

    let mut transitions = 0;
    for task in tasks {
        if task.await.unwrap() {
            transitions += 1;
        }
    }

    assert_eq!(transitions, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(faults.try_recv().is_ok());
    assert!(matches!(faults.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let (registry, _script) = scripted_registry();
    let host = registry
        .get_host("T", &metadata(IsolationLevel::None, "handlers"))
        .await
        .expect("host");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    registry.on_faulted(|_| panic!("handler failure"));
    registry.on_faulted(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(registry.mark_faulted(&host, HostError::Unreachable("down".into())));
    assert!(host.is_faulted());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sweep_faults_silent_host() {
    let (registry, script) = scripted_registry();
    let metadata = metadata(IsolationLevel::SandboxedInProcess, "sweep");
    let host = registry.get_host("T", &metadata).await.expect("host");

    assert_eq!(registry.sweep_once().await, 0);
    assert!(!host.is_faulted());

    script.set_reachable(host.id(), false);
    assert_eq!(registry.sweep_once().await, 1);
    assert!(host.is_faulted());

    // Faulted hosts are neither swept again nor selected.
    assert_eq!(registry.sweep_once().await, 0);
    let replacement = registry.get_host("T", &metadata).await.expect("replacement");
    assert_ne!(replacement.id(), host.id());
}

#[tokio::test]
async fn test_lookup_prefers_healthy_host() {
    let (registry, _script) = scripted_registry();
    let metadata = metadata(IsolationLevel::None, "lookup");
    let description = metadata.description();

    assert!(matches!(
        registry.lookup_by_description(&description).await,
        Err(HostError::NotFound(_))
    ));

    let first = registry.get_host("T", &metadata).await.expect("first");
    registry.mark_faulted(&first, HostError::Unreachable("down".into()));

    let found = registry.lookup_by_description(&description).await.expect("faulted match");
    assert_eq!(found.id(), first.id());

    let second = registry.get_host("T", &metadata).await.expect("second");
    let found = registry.lookup_by_description(&description).await.expect("healthy match");
    assert_eq!(found.id(), second.id());
}

#[tokio::test]
async fn test_reachable_host_keeps_reference_clean() {
    let (registry, _script) = scripted_registry();
    let metadata = metadata(IsolationLevel::None, "transient");
    let mut reference = registry.activate(&metadata, "m", "T").await.expect("activate");

    let result = registry.invoke(&mut reference, "fail", Vec::new()).await;
    assert!(matches!(result, Err(HostError::Invocation { .. })));
    assert!(!reference.is_faulted());

    let faulted = registry
        .mark_faulted_if_given_error(
            reference.description(),
            Some(HostError::Unreachable("spurious".into())),
            None,
        )
        .await
        .expect("lookup");
    assert!(!faulted);

    let host = registry.lookup_by_object_reference(&reference).await.expect("host");
    assert!(!host.is_faulted());
    assert_eq!(
        registry.invoke(&mut reference, "ping", Vec::new()).await.expect("invoke"),
        json!("ok")
    );
}

#[tokio::test]
async fn test_unreachable_host_faults_reference() {
    let (registry, script) = scripted_registry();
    let metadata = metadata(IsolationLevel::SeparateProcess, "gone");
    let mut reference = registry.activate(&metadata, "m", "T").await.expect("activate");
    let description = reference.description().clone();

    script.set_reachable(reference.host(), false);
    let faulted = registry
        .mark_faulted_if_given_error(
            &description,
            Some(HostError::Unreachable("call failed".into())),
            Some(&mut reference),
        )
        .await
        .expect("lookup");

    assert!(faulted);
    assert!(reference.is_faulted());
    let host = registry.lookup_by_object_reference(&reference).await.expect("host");
    assert!(host.is_faulted());

    let result = registry.invoke(&mut reference, "ping", Vec::new()).await;
    assert!(matches!(result, Err(HostError::Faulted(_))));
}

#[tokio::test]
async fn test_error_free_result_is_ignored() {
    let (registry, _script) = scripted_registry();
    let metadata = metadata(IsolationLevel::None, "clean");
    let mut reference = registry.activate(&metadata, "m", "T").await.expect("activate");
    let description = reference.description().clone();

    let faulted = registry
        .mark_faulted_if_given_error(&description, None, Some(&mut reference))
        .await
        .expect("no-op");
    assert!(!faulted);
    assert!(!reference.is_faulted());
}

#[tokio::test]
async fn test_shutdown_stops_every_host() {
    let (registry, script) = scripted_registry();
    registry.start();
    for group in ["a", "b", "c"] {
        registry
            .get_host("T", &metadata(IsolationLevel::None, group))
            .await
            .expect("host");
    }

    registry.shutdown().await;
    assert_eq!(script.stops.load(Ordering::SeqCst), 3);
    assert!(!registry.is_running());
}

// ============================================================================
// Real hosts
// ============================================================================

#[derive(Default)]
struct Counter(i64);

impl Component for Counter {
    fn invoke(&mut self, member: &str, arguments: &[Value]) -> Result<Value, ComponentError> {
        match member {
            "add" => {
                self.0 += arguments.first().and_then(Value::as_i64).unwrap_or(1);
                Ok(json!(self.0))
            }
            "crash" => panic!("counter crashed"),
            other => Err(ComponentError::UnknownMember(other.to_string())),
        }
    }
}

fn real_registry() -> ActivationHostRegistry {
    let config = RegistryConfig::builder()
        .heartbeat_interval(Duration::from_millis(20))
        .build()
        .expect("valid config");
    let catalog = ComponentCatalog::new().with("tests", "Counter", Counter::default);
    ActivationHostRegistry::new(config, catalog).expect("registry")
}

#[tokio::test]
async fn test_local_host_end_to_end() {
    let registry = real_registry();
    let metadata = IsolationMetadata::new(IsolationLevel::None);

    let mut reference = registry
        .activate(&metadata, "tests", "Counter")
        .await
        .expect("activate");
    assert_eq!(reference.description().group(), isohost_core::DEFAULT_GROUP);

    let value = registry
        .invoke(&mut reference, "add", vec![RuntimeArgument::new(5)])
        .await
        .expect("invoke");
    assert_eq!(value, json!(5));
    registry.deactivate(&mut reference).await.expect("deactivate");

    let mut faults = registry.subscribe();
    registry.start();
    let host = registry.lookup_by_object_reference(&reference).await.expect("host");
    host.stop().await.expect("stop");

    let event = tokio::time::timeout(Duration::from_secs(2), faults.recv())
        .await
        .expect("sweep fired")
        .expect("event");
    assert_eq!(event.host, host.id());
    assert!(host.is_faulted());

    registry.shutdown().await;
}

#[tokio::test]
async fn test_unknown_type_leaves_host_healthy() {
    let registry = real_registry();
    let metadata = IsolationMetadata::new(IsolationLevel::None);

    let result = registry.activate(&metadata, "tests", "Missing").await;
    assert!(matches!(result, Err(HostError::UnknownType { .. })));

    let host = registry
        .lookup_by_description(&metadata.description())
        .await
        .expect("host");
    assert!(!host.is_faulted());
}

#[tokio::test]
async fn test_failed_activation_does_not_record_type() {
    let registry = real_registry();
    let metadata = IsolationMetadata::new(IsolationLevel::SandboxedInProcess)
        .group("retries")
        .host_per_instance(true);

    for _ in 0..3 {
        let result = registry.activate(&metadata, "tests", "Missing").await;
        assert!(matches!(result, Err(HostError::UnknownType { .. })));
    }

    let hosts = registry.hosts().await;
    assert_eq!(hosts.len(), 1);
    assert!(hosts[0].activated_types().is_empty());
    assert!(!hosts[0].is_faulted());

    let reference = registry
        .activate(&metadata, "tests", "Counter")
        .await
        .expect("activate");
    assert_eq!(reference.host(), hosts[0].id());
    assert!(hosts[0].has_activated("Counter"));
    assert_eq!(registry.host_count().await, 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_sandbox_panic_faults_host_and_reference() {
    let registry = real_registry();
    let metadata = IsolationMetadata::new(IsolationLevel::SandboxedInProcess).group("sandbox");

    let mut reference = registry
        .activate(&metadata, "tests", "Counter")
        .await
        .expect("activate");
    assert_eq!(
        registry
            .invoke(&mut reference, "add", Vec::new())
            .await
            .expect("invoke"),
        json!(1)
    );

    let result = registry.invoke(&mut reference, "crash", Vec::new()).await;
    assert!(matches!(result, Err(HostError::Unreachable(_))));
    assert!(reference.is_faulted());

    let host = registry.lookup_by_object_reference(&reference).await.expect("host");
    assert!(host.is_faulted());

    // The caller's process survives and a fresh sandbox can be obtained.
    let mut fresh = registry
        .activate(&metadata, "tests", "Counter")
        .await
        .expect("fresh sandbox");
    assert_ne!(fresh.host(), host.id());
    assert_eq!(
        registry.invoke(&mut fresh, "add", Vec::new()).await.expect("invoke"),
        json!(1)
    );

    registry.shutdown().await;
}
