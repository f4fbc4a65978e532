//! Netmount simulator.
//!
//! Runs a master and a slave for one simulated device inside a single
//! process, pushes a write transaction through the slave and prints the
//! master's counters as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: candidate device, one interface
//! netmount-sim
//!
//! # Candidate device, five interfaces, a rejected first lock
//! netmount-sim --interfaces 5 --reject-first-lock
//!
//! # Device list and timing from a config file
//! NETMOUNT_CONFIG=/etc/netmount.toml netmount-sim --device r1
//! ```

use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::ValueEnum;
use netmount::config::DeviceConfig;
use netmount::device::DeviceNotification;
use netmount::master::MasterData;
use netmount::testing::CallKind;
use netmount::testing::DeviceFault;
use netmount::testing::InMemorySchemaRepository;
use netmount::testing::SimulatedDevice;
use netmount::types::DataNode;
use netmount::types::Datastore;
use netmount::types::InstancePath;
use netmount::types::LogicalDatastore;
use netmount::types::QName;
use netmount::types::SchemaPath;
use netmount::types::SourceIdentifier;
use netmount::types::Value;
use netmount::MasterDirectory;
use netmount::MasterSetup;
use netmount::MountPoint;
use netmount::MountPointService;
use netmount::NetmountConfig;
use netmount::SlaveProxy;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const SIM_NS: &str = "urn:netmount:sim";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SimProfile {
    Candidate,
    CandidateRunning,
    Running,
}

#[derive(Parser, Debug)]
#[command(name = "netmount-sim")]
struct Args {
    /// Device name; taken from the configuration when it lists one.
    #[arg(long, env = "NETMOUNT_SIM_DEVICE", default_value = "sim-r1")]
    device: String,

    /// Name of the simulated slave node.
    #[arg(long, default_value = "node-b")]
    slave_node: String,

    /// Datastore capabilities of the simulated device.
    #[arg(long, value_enum, default_value = "candidate")]
    profile: SimProfile,

    /// Number of interfaces written in the transaction.
    #[arg(long, default_value_t = 1)]
    interfaces: u32,

    /// Reject the first candidate lock to exercise the discard-and-retry path.
    #[arg(long)]
    reject_first_lock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = NetmountConfig::load_with_layers().context("failed to load configuration")?;
    let device_config = config.device(&args.device).cloned().unwrap_or_else(|| DeviceConfig {
        name: args.device.clone(),
        host: "127.0.0.1".into(),
        port: 830,
        lock_datastore: true,
        user_capabilities: Vec::new(),
        override_capabilities: false,
    });

    let device = Arc::new(match args.profile {
        SimProfile::Candidate => SimulatedDevice::candidate(),
        SimProfile::CandidateRunning => SimulatedDevice::candidate_running(),
        SimProfile::Running => SimulatedDevice::running(),
    });
    match (args.reject_first_lock, args.profile) {
        (false, _) => {}
        (true, SimProfile::Running) => warn!("running-only devices do not retry locks, ignoring --reject-first-lock"),
        (true, _) => device.inject(DeviceFault::reject(CallKind::Lock(Datastore::Candidate))),
    }

    let source = SourceIdentifier::new("netmount-sim", Some("2024-01-01".to_string()));
    let schema = Arc::new(InMemorySchemaRepository::new().with_source(source.clone(), "module netmount-sim {}"));

    let setup = MasterSetup::from_config(&config, &device_config, schema);
    let (mount_point, master_handle) = MountPoint::spawn(setup.clone()).await.context("failed to spawn master")?;
    mount_point
        .initialize(MasterData {
            session: device.clone(),
            capabilities: device.capabilities(),
            sources: vec![source.clone()],
        })
        .await
        .context("master initialization failed")?;

    let directory = Arc::new(MasterDirectory::new());
    directory.elect(setup.device.clone(), setup.address());
    let slave = SlaveProxy::new(&args.slave_node, setup.device.clone(), directory, config.timing);

    let notification_path = SchemaPath::absolute([QName::new(SIM_NS, "config-changed")]);
    let registration = slave
        .subscribe_notifications(
            notification_path.clone(),
            Arc::new(|notification: &DeviceNotification| info!(%notification, "slave received notification")),
        )
        .await
        .context("subscription failed")?;

    let tx = slave.begin_transaction();
    for index in 0..args.interfaces {
        let (path, data) = interface(index);
        tx.merge(LogicalDatastore::Configuration, path, data)
            .await
            .with_context(|| format!("write {index} failed"))?;
    }
    match tx.commit().await {
        Ok(()) => info!(tx = %tx.id(), "transaction committed"),
        Err(err) => warn!(tx = %tx.id(), error = %err, "transaction failed"),
    }

    mount_point
        .publish_notification(DeviceNotification {
            path: notification_path,
            body: DataNode::container(QName::new(SIM_NS, "config-changed"), vec![]),
            event_time: SystemTime::now(),
        })
        .context("failed to publish notification")?;

    let text = slave.schema_source(source).await.context("schema source lookup failed")?;
    info!(bytes = text.len(), "schema source fetched through slave");

    let (first, _) = interface(0);
    let committed = slave.read(LogicalDatastore::Configuration, first).await?;
    info!(present = committed.is_some(), "read back first interface");

    tokio::time::sleep(Duration::from_millis(50)).await;
    slave.unsubscribe_notifications(registration).await?;

    let stats = mount_point.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    for call in device.calls() {
        println!("{call:?}");
    }

    mount_point.shutdown()?;
    master_handle.await.context("master task panicked")?;
    Ok(())
}

fn interface(index: u32) -> (InstancePath, DataNode) {
    let name = QName::new(SIM_NS, "interface");
    let key = QName::new(SIM_NS, "name");
    let value = Value::String(format!("eth{index}"));
    let path = InstancePath::root()
        .node(QName::new(SIM_NS, "interfaces"))
        .entry(name.clone(), [(key.clone(), value.clone())]);
    let data = DataNode::ListEntry {
        name,
        keys: [(key.clone(), value.clone())].into_iter().collect(),
        children: vec![
            DataNode::leaf(key, value),
            DataNode::leaf(QName::new(SIM_NS, "enabled"), Value::Bool(true)),
        ],
    };
    (path, data)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}
