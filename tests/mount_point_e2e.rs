//! Master and slave mount points over a simulated device, in one process.
//!
//! Actor names are process-global, so every test uses its own device name.

mod support;

use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use netmount::config::TimingConfig;
use netmount::device::DeviceNotification;
use netmount::device::RpcOutcome;
use netmount::device::SchemaSourceProvider;
use netmount::envelope::Envelope;
use netmount::master::MasterData;
use netmount::master::MasterMessage;
use netmount::master::MasterSetup;
use netmount::master::MountStatus;
use netmount::slave::RemoteSchemaProvider;
use netmount::testing::CallKind;
use netmount::testing::InMemorySchemaRepository;
use netmount::testing::SimulatedDevice;
use netmount::types::DataNode;
use netmount::types::Datastore;
use netmount::types::InstancePath;
use netmount::types::LogicalDatastore;
use netmount::types::QName;
use netmount::types::RpcError;
use netmount::types::SchemaPath;
use netmount::types::SourceIdentifier;
use netmount::types::TxId;
use netmount::MasterDirectory;
use netmount::MountError;
use netmount::MountPoint;
use netmount::MountPointService;
use netmount::SlaveProxy;
use ractor::call_t;
use support::device_id;
use support::interface;
use support::IF_NS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CONFIG: LogicalDatastore = LogicalDatastore::Configuration;

fn timing() -> TimingConfig {
    TimingConfig {
        actor_response_wait_ms: 2_000,
        discovery_backoff_ms: 20,
        ..TimingConfig::default()
    }
}

fn source() -> SourceIdentifier {
    SourceIdentifier::new("ietf-interfaces", Some("2018-02-20".to_string()))
}

struct Master {
    device: Arc<SimulatedDevice>,
    mount: MountPoint,
    handle: JoinHandle<()>,
    directory: Arc<MasterDirectory>,
}

impl Master {
    async fn spawn(name: &str, node: &str, device: SimulatedDevice, timing: TimingConfig) -> Self {
        let schema = Arc::new(InMemorySchemaRepository::new().with_source(source(), "module ietf-interfaces {}"));
        let mut setup = MasterSetup::new(node, device_id(name), schema);
        setup.timing = timing;
        let (mount, handle) = MountPoint::spawn(setup).await.unwrap();

        let directory = Arc::new(MasterDirectory::new());
        directory.elect(device_id(name), mount.address().clone());
        Self {
            device: Arc::new(device),
            mount,
            handle,
            directory,
        }
    }

    async fn started(name: &str) -> Self {
        let master = Self::spawn(name, "node-a", SimulatedDevice::candidate(), timing()).await;
        master.initialize().await;
        master
    }

    async fn initialize(&self) {
        self.mount
            .initialize(MasterData {
                session: self.device.clone(),
                capabilities: self.device.capabilities(),
                sources: vec![source()],
            })
            .await
            .unwrap();
    }

    fn slave(&self, node: &str) -> SlaveProxy {
        self.slave_with(node, timing())
    }

    fn slave_with(&self, node: &str, timing: TimingConfig) -> SlaveProxy {
        SlaveProxy::new(node, self.mount.device().clone(), self.directory.clone(), timing)
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// Discovery

#[tokio::test]
async fn test_single_ask_for_master_then_cached() {
    let master = Master::started("e2e-discovery").await;
    let slave = master.slave("node-b");
    let (path, data) = interface("eth0");
    master.device.seed_running(path.clone(), data.clone());

    assert!(slave.registration().is_none());
    let first = slave.read(CONFIG, path.clone()).await.unwrap();
    let second = slave.read(CONFIG, path.clone()).await.unwrap();

    assert_eq!(first.map(|tree| tree.node), Some(data));
    assert!(second.is_some());
    let registration = slave.registration().unwrap();
    assert_eq!(&registration.master, master.mount.address());
    assert_eq!(registration.sources, vec![source()]);
    assert_eq!(master.mount.stats().await.unwrap().ask_for_master, 1);
}

#[tokio::test]
async fn test_master_not_ready_until_initialized() {
    let master = Master::spawn("e2e-not-ready", "node-a", SimulatedDevice::candidate(), timing()).await;
    assert_eq!(master.mount.status(), MountStatus::Connecting);

    let (path, _) = interface("eth0");
    let err = master.mount.read(CONFIG, path.clone()).await.unwrap_err();
    assert!(matches!(err, MountError::MasterNotReady { .. }), "{err}");
    assert_eq!(master.device.count(CallKind::Read), 0);

    let slave = master.slave("node-b");
    let pending = tokio::spawn({
        let slave = slave.clone();
        let path = path.clone();
        async move { slave.read(CONFIG, path).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    master.initialize().await;

    assert!(master.mount.wait_connected(Duration::from_secs(1)).await);
    assert_eq!(pending.await.unwrap().unwrap(), None);
    assert!(slave.registration().is_some());
    assert_eq!(master.device.count(CallKind::Read), 1);
}

#[tokio::test]
async fn test_uninitialized_master_exhausts_discovery_budget() {
    let master = Master::spawn("e2e-never-ready", "node-a", SimulatedDevice::candidate(), timing()).await;
    let slave = master.slave_with(
        "node-b",
        TimingConfig {
            actor_response_wait_ms: 200,
            discovery_backoff_ms: 20,
            ..TimingConfig::default()
        },
    );

    let err = slave.discover().await.unwrap_err();
    assert!(matches!(err, MountError::DiscoveryTimeout { waited_ms: 200, .. }), "{err}");
    assert!(err.to_string().contains("e2e-never-ready"));
}

#[tokio::test]
async fn test_demoted_master_fails_over_to_new_master() {
    let old = Master::started("e2e-failover").await;
    let slave = old.slave("node-b");
    let (path, data) = interface("eth0");
    slave.read(CONFIG, path.clone()).await.unwrap();

    old.mount.demote().unwrap();
    let err = old.mount.read(CONFIG, path.clone()).await.unwrap_err();
    assert!(matches!(err, MountError::NotMaster { .. }), "{err}");
    assert_eq!(old.mount.status(), MountStatus::Unavailable);
    wait_until(|| old.device.is_closed()).await;

    let new = Master::spawn("e2e-failover", "node-c", SimulatedDevice::candidate(), timing()).await;
    new.initialize().await;
    new.device.seed_running(path.clone(), data.clone());
    old.directory.elect(device_id("e2e-failover"), new.mount.address().clone());

    let tree = slave.read(CONFIG, path).await.unwrap();
    assert_eq!(tree.map(|tree| tree.node), Some(data));
    assert_eq!(&slave.registration().unwrap().master, new.mount.address());
}

// Transactions

#[tokio::test]
async fn test_slave_transaction_commits_on_device() {
    let master = Master::started("e2e-tx-commit").await;
    let slave = master.slave("node-b");

    let tx = slave.begin_transaction();
    for name in ["eth0", "eth1"] {
        let (path, data) = interface(name);
        tx.merge(CONFIG, path, data).await.unwrap();
    }
    tx.commit().await.unwrap();

    assert_eq!(
        master.device.call_kinds(),
        vec![
            CallKind::Lock(Datastore::Candidate),
            CallKind::EditConfig,
            CallKind::EditConfig,
            CallKind::Commit,
            CallKind::Unlock(Datastore::Candidate),
        ]
    );
    let (path, data) = interface("eth1");
    assert_eq!(master.device.running_config(&path), Some(data));

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, MountError::Transaction { .. }), "{err}");
    let stats = master.mount.stats().await.unwrap();
    assert_eq!(stats.transactions_committed, 1);
}

#[tokio::test]
async fn test_edit_failure_reaches_slave_with_tx_id() {
    let master = Master::started("e2e-tx-fail").await;
    master
        .device
        .inject(netmount::testing::DeviceFault::reject(CallKind::EditConfig));
    let slave = master.slave("node-b");

    let tx = slave.begin_transaction();
    let (path, data) = interface("eth0");
    tx.put(CONFIG, path, data).await.unwrap();
    let err = tx.commit().await.unwrap_err();

    assert!(matches!(err, MountError::Transaction { .. }), "{err}");
    assert!(err.to_string().contains(&tx.id().to_string()), "{err}");
    assert_eq!(master.device.count(CallKind::Commit), 0);
    assert_eq!(master.device.count(CallKind::DiscardChanges), 1);
    assert_eq!(master.mount.stats().await.unwrap().transactions_failed, 1);
}

#[tokio::test]
async fn test_cancel_after_edit_failure_frees_the_master() {
    let master = Master::started("e2e-cancel-failed").await;
    master
        .device
        .inject(netmount::testing::DeviceFault::reject(CallKind::EditConfig));
    let slave = master.slave("node-b");

    let failed = slave.begin_transaction();
    let (path0, data0) = interface("eth0");
    failed.put(CONFIG, path0, data0).await.unwrap();
    wait_until(|| master.device.count(CallKind::Unlock(Datastore::Candidate)) == 1).await;

    assert!(!failed.cancel().await.unwrap());

    let next = slave.begin_transaction();
    let (path1, data1) = interface("eth1");
    next.merge(CONFIG, path1.clone(), data1.clone()).await.unwrap();
    next.commit().await.unwrap();
    assert_eq!(master.device.running_config(&path1), Some(data1));

    let stats = master.mount.stats().await.unwrap();
    assert_eq!(stats.transactions_failed, 1);
    assert_eq!(stats.transactions_committed, 1);
    assert_eq!(stats.transactions_cancelled, 0);
}

#[tokio::test]
async fn test_demote_after_edit_failure_closes_session() {
    let master = Master::started("e2e-demote-failed").await;
    master
        .device
        .inject(netmount::testing::DeviceFault::reject(CallKind::EditConfig));

    let tx = master.mount.begin_transaction();
    let (path, data) = interface("eth0");
    tx.put(CONFIG, path, data).await.unwrap();
    wait_until(|| master.device.count(CallKind::Unlock(Datastore::Candidate)) == 1).await;

    master.mount.demote().unwrap();
    wait_until(|| master.device.is_closed()).await;
    assert_eq!(master.device.call_kinds().last(), Some(&CallKind::Close));
    assert_eq!(master.device.count(CallKind::DiscardChanges), 1);
}

#[tokio::test]
async fn test_demote_while_locking_closes_session_after_release() {
    let master = Master::started("e2e-demote-locking").await;
    master.device.set_latency(Duration::from_millis(50));

    let tx = master.mount.begin_transaction();
    let (path, data) = interface("eth0");
    let opening = tokio::spawn(async move { tx.put(CONFIG, path, data).await });
    // Lock is in flight on the device.
    tokio::time::sleep(Duration::from_millis(20)).await;

    master.mount.demote().unwrap();
    assert!(matches!(opening.await.unwrap(), Err(MountError::NotMaster { .. })));
    wait_until(|| master.device.is_closed()).await;
    assert_eq!(
        master.device.call_kinds(),
        vec![
            CallKind::Lock(Datastore::Candidate),
            CallKind::DiscardChanges,
            CallKind::Unlock(Datastore::Candidate),
            CallKind::Close,
        ]
    );
}

#[tokio::test]
async fn test_second_writer_waits_for_first_commit() {
    let master = Master::started("e2e-queue").await;
    let first = master.slave("node-b").begin_transaction();
    let second = master.slave("node-c").begin_transaction();

    let (path0, data0) = interface("eth0");
    first.merge(CONFIG, path0, data0).await.unwrap();

    let (path1, data1) = interface("eth1");
    let waiting = tokio::spawn({
        let second = second.clone();
        async move {
            second.merge(CONFIG, path1, data1).await?;
            second.commit().await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(master.mount.stats().await.unwrap().queued_writes, 1);
    assert_eq!(master.device.count(CallKind::Lock(Datastore::Candidate)), 1);

    first.commit().await.unwrap();
    waiting.await.unwrap().unwrap();

    use CallKind::*;
    let candidate = Datastore::Candidate;
    assert_eq!(
        master.device.call_kinds(),
        vec![
            Lock(candidate),
            EditConfig,
            Commit,
            Unlock(candidate),
            Lock(candidate),
            EditConfig,
            Commit,
            Unlock(candidate),
        ]
    );
}

#[tokio::test]
async fn test_queue_bound_rejects_with_busy() {
    let timing = TimingConfig {
        max_queued_writes: 1,
        ..timing()
    };
    let master = Master::spawn("e2e-busy", "node-a", SimulatedDevice::candidate(), timing).await;
    master.initialize().await;

    let (path, data) = interface("eth0");
    let first = master.mount.begin_transaction();
    first.merge(CONFIG, path.clone(), data.clone()).await.unwrap();

    let second = master.mount.begin_transaction();
    let waiting = tokio::spawn({
        let (path, data) = (path.clone(), data.clone());
        async move { second.merge(CONFIG, path, data).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let third = master.mount.begin_transaction();
    let err = third.merge(CONFIG, path, data).await.unwrap_err();
    assert!(matches!(err, MountError::Busy { limit: 1, .. }), "{err}");

    assert!(first.cancel().await.unwrap());
    waiting.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_semantics() {
    let master = Master::started("e2e-cancel").await;
    let slave = master.slave("node-b");

    let unknown = slave.begin_transaction();
    assert!(!unknown.cancel().await.unwrap());

    let tx = slave.begin_transaction();
    let (path, data) = interface("eth0");
    tx.merge(CONFIG, path.clone(), data).await.unwrap();
    assert!(tx.cancel().await.unwrap());
    assert!(!tx.cancel().await.unwrap());

    assert_eq!(master.device.count(CallKind::Commit), 0);
    assert_eq!(master.device.count(CallKind::DiscardChanges), 1);
    assert_eq!(master.device.running_config(&path), None);
    assert_eq!(master.mount.stats().await.unwrap().transactions_cancelled, 1);
}

#[tokio::test]
async fn test_idle_transaction_is_cancelled_for_next_writer() {
    let timing = TimingConfig {
        write_tx_idle_timeout_ms: 100,
        ..timing()
    };
    let master = Master::spawn("e2e-idle", "node-a", SimulatedDevice::candidate(), timing).await;
    master.initialize().await;
    let slave = master.slave("node-b");

    let abandoned = slave.begin_transaction();
    let (path0, data0) = interface("eth0");
    abandoned.merge(CONFIG, path0.clone(), data0).await.unwrap();

    let next = slave.begin_transaction();
    let (path1, data1) = interface("eth1");
    next.merge(CONFIG, path1.clone(), data1.clone()).await.unwrap();
    next.commit().await.unwrap();

    assert_eq!(master.device.count(CallKind::DiscardChanges), 1);
    assert_eq!(master.device.running_config(&path0), None);
    assert_eq!(master.device.running_config(&path1), Some(data1));
    let err = abandoned.commit().await.unwrap_err();
    assert!(matches!(err, MountError::Transaction { .. }), "{err}");
}

#[tokio::test]
async fn test_shutdown_cancels_transaction_and_closes_session() {
    let master = Master::started("e2e-shutdown").await;
    let tx = master.mount.begin_transaction();
    let (path, data) = interface("eth0");
    tx.merge(CONFIG, path, data).await.unwrap();

    master.mount.shutdown().unwrap();
    master.handle.await.unwrap();

    use CallKind::*;
    let candidate = Datastore::Candidate;
    assert_eq!(
        master.device.call_kinds(),
        vec![Lock(candidate), EditConfig, DiscardChanges, Unlock(candidate), Close]
    );
    assert_eq!(master.mount.status(), MountStatus::Unavailable);
}

// RPCs, schema sources, notifications

#[tokio::test]
async fn test_rpc_and_action_replies() {
    let master = Master::started("e2e-rpc").await;
    let slave = master.slave("node-b");
    let reboot = SchemaPath::absolute([QName::new("urn:example:system", "reboot")]);
    let restart = SchemaPath::absolute([QName::new(IF_NS, "interfaces"), QName::new(IF_NS, "restart")]);
    let output = DataNode::leaf(QName::new("urn:example:system", "status"), netmount::types::Value::Bool(true));
    master.device.set_rpc_reply(reboot.clone(), RpcOutcome::with_output(output.clone()));
    master.device.set_rpc_reply(
        restart.clone(),
        RpcOutcome::failed(vec![RpcError::new("operation-not-supported", "no")]),
    );

    let reply = slave.invoke_rpc(reboot, None).await.unwrap();
    assert_eq!(reply.output, Some(output));

    let empty = SchemaPath::absolute([QName::new("urn:example:system", "noop")]);
    assert_eq!(slave.invoke_rpc(empty, None).await.unwrap(), RpcOutcome::ok());

    let (target, _) = interface("eth0");
    let action = slave.invoke_action(restart, target, None).await.unwrap();
    assert!(!action.is_success());
    assert_eq!(action.errors[0].tag, "operation-not-supported");
}

#[tokio::test]
async fn test_schema_sources_through_slave() {
    let master = Master::started("e2e-schema").await;
    let slave = master.slave("node-b");

    assert_eq!(slave.schema_source(source()).await.unwrap(), "module ietf-interfaces {}");
    let missing = SourceIdentifier::new("ietf-ip", None);
    let err = slave.schema_source(missing.clone()).await.unwrap_err();
    assert!(matches!(err, MountError::MissingSchemaSource { ref source_id, .. } if *source_id == missing));

    let provider = RemoteSchemaProvider::new(slave);
    assert!(provider.resolve_source(&source()).await.is_ok());
    assert_eq!(provider.resolve_source(&missing).await.unwrap_err().source_id, missing);
}

#[tokio::test]
async fn test_notifications_reach_slave_listener() {
    let master = Master::started("e2e-notify").await;
    let slave = master.slave("node-b");
    let path = SchemaPath::absolute([QName::new(IF_NS, "link-down")]);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let registration = slave
        .subscribe_notifications(
            path.clone(),
            Arc::new(move |notification: &DeviceNotification| {
                let _ = tx.send(notification.clone());
            }),
        )
        .await
        .unwrap();

    let body = DataNode::container(QName::new(IF_NS, "link-down"), vec![]);
    let notification = DeviceNotification {
        path: path.clone(),
        body: body.clone(),
        event_time: SystemTime::now(),
    };
    master.mount.publish_notification(notification.clone()).unwrap();
    let other = DeviceNotification {
        path: SchemaPath::absolute([QName::new(IF_NS, "link-up")]),
        ..notification.clone()
    };
    master.mount.publish_notification(other).unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, notification);

    slave.unsubscribe_notifications(registration).await.unwrap();
    master.mount.publish_notification(notification).unwrap();
    let stats = master.mount.stats().await.unwrap();
    assert_eq!(stats.notifications_delivered, 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_garbage_frame_gets_codec_failure() {
    let master = Master::started("e2e-codec").await;
    let Ok(reply) = call_t!(master.mount.actor(), MasterMessage::Frame, 1_000, vec![0xff, 0xff, 0xff]) else {
        panic!("master did not answer the frame");
    };
    match Envelope::decode(&reply).unwrap() {
        Envelope::Failure(MountError::Codec { device, .. }) => assert_eq!(device, device_id("e2e-codec")),
        other => panic!("unexpected reply {other:?}"),
    }

    let unknown_tx = Envelope::TxCancel { tx: TxId::new() };
    let reply = master.mount.request(unknown_tx).await.unwrap();
    assert_eq!(reply, Envelope::TxCancelled { cancelled: false });
    let root = master.mount.read(CONFIG, InstancePath::root()).await.unwrap();
    assert!(root.is_none());
}
