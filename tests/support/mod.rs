//! Shared fixtures for netmount integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use netmount::testing::SimulatedDevice;
use netmount::tx::TxContext;
use netmount::tx::TxProfile;
use netmount::tx::TxSettings;
use netmount::types::DataNode;
use netmount::types::DeviceId;
use netmount::types::InstancePath;
use netmount::types::QName;
use netmount::types::TxId;
use netmount::types::Value;

pub const IF_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-interfaces";

pub fn q(name: &str) -> QName {
    QName::with_revision(IF_NS, "2018-02-20", name)
}

pub fn device_id(name: &str) -> DeviceId {
    DeviceId::new(name, "192.0.2.1:830")
}

/// `/interfaces/interface[name=<name>]` and a matching entry.
pub fn interface(name: &str) -> (InstancePath, DataNode) {
    let value = Value::String(name.to_string());
    let path = InstancePath::root()
        .node(q("interfaces"))
        .entry(q("interface"), [(q("name"), value.clone())]);
    let entry = DataNode::ListEntry {
        name: q("interface"),
        keys: [(q("name"), value.clone())].into_iter().collect(),
        children: vec![
            DataNode::leaf(q("name"), value),
            DataNode::leaf(q("enabled"), Value::Bool(true)),
        ],
    };
    (path, entry)
}

pub fn context(device: &Arc<SimulatedDevice>, profile: TxProfile) -> TxContext {
    context_with(device, profile, TxSettings::default())
}

pub fn context_with(device: &Arc<SimulatedDevice>, profile: TxProfile, settings: TxSettings) -> TxContext {
    TxContext {
        id: TxId::new(),
        device: device_id("r1"),
        session: device.clone(),
        profile,
        settings,
    }
}
