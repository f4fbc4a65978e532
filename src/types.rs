//! Identity, schema and data-tree types shared by every layer.
//!
//! These are plain values: the transaction engine, the master actor and the
//! slave proxy all pass them around by value or reference, and every type that
//! can appear inside an [`Envelope`](crate::envelope::Envelope) derives serde.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Identity of one managed device: `{name, address}`.
///
/// Created once per device configuration and never mutated. Used as the
/// logging key, inside transaction identifiers and to derive actor addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    name: String,
    address: String,
}

impl DeviceId {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteDevice{{{}@{}}}", self.name, self.address)
    }
}

/// Identifier of one logical write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(Uuid);

impl TxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0.simple())
    }
}

/// Routable name of an actor somewhere in the cluster.
///
/// Addresses are ractor registry names; resolving one yields the actor cell
/// if the actor is alive on a reachable node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorAddress(String);

impl ActorAddress {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Address of the master actor for `device` hosted on `node`.
    pub fn master(node: &str, device: &DeviceId) -> Self {
        Self(format!("{node}/mount/{}", device.name()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Qualified name: namespace, optional revision, local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName {
    pub namespace: String,
    pub revision: Option<String>,
    pub local_name: String,
}

impl QName {
    pub fn new(namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            revision: None,
            local_name: local_name.into(),
        }
    }

    pub fn with_revision(
        namespace: impl Into<String>,
        revision: impl Into<String>,
        local_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            revision: Some(revision.into()),
            local_name: local_name.into(),
        }
    }

    pub fn without_revision(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            revision: None,
            local_name: self.local_name.clone(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(rev) => write!(f, "({}?revision={}){}", self.namespace, rev, self.local_name),
            None => write!(f, "({}){}", self.namespace, self.local_name),
        }
    }
}

/// Name and optional revision of a schema source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceIdentifier {
    pub name: String,
    pub revision: Option<String>,
}

impl SourceIdentifier {
    pub fn new(name: impl Into<String>, revision: Option<String>) -> Self {
        Self {
            name: name.into(),
            revision,
        }
    }
}

impl From<&QName> for SourceIdentifier {
    fn from(qname: &QName) -> Self {
        Self::new(qname.local_name.clone(), qname.revision.clone())
    }
}

impl fmt::Display for SourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(rev) => write!(f, "{}@{}", self.name, rev),
            None => f.write_str(&self.name),
        }
    }
}

/// Schema path of an RPC, action or notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaPath {
    pub absolute: bool,
    pub path: Vec<QName>,
}

impl SchemaPath {
    pub fn absolute(path: impl IntoIterator<Item = QName>) -> Self {
        Self {
            absolute: true,
            path: path.into_iter().collect(),
        }
    }

    pub fn relative(path: impl IntoIterator<Item = QName>) -> Self {
        Self {
            absolute: false,
            path: path.into_iter().collect(),
        }
    }

    pub fn last(&self) -> Option<&QName> {
        self.path.last()
    }
}

impl fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            f.write_str("/")?;
        }
        for (i, q) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{q}")?;
        }
        Ok(())
    }
}

/// Scalar value of a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Empty,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Int(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Empty => Ok(()),
        }
    }
}

/// One step of an [`InstancePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathArgument {
    /// Container, list or leaf identified by name.
    Node(QName),
    /// Entry of a keyed list.
    Entry {
        name: QName,
        keys: BTreeMap<QName, Value>,
    },
}

impl PathArgument {
    pub fn name(&self) -> &QName {
        match self {
            PathArgument::Node(name) | PathArgument::Entry { name, .. } => name,
        }
    }
}

/// Instance identifier of a node in the data tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstancePath(Vec<PathArgument>);

impl InstancePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(args: impl IntoIterator<Item = PathArgument>) -> Self {
        Self(args.into_iter().collect())
    }

    pub fn node(mut self, name: QName) -> Self {
        self.0.push(PathArgument::Node(name));
        self
    }

    pub fn entry(mut self, name: QName, keys: impl IntoIterator<Item = (QName, Value)>) -> Self {
        self.0.push(PathArgument::Entry {
            name,
            keys: keys.into_iter().collect(),
        });
        self
    }

    pub fn args(&self) -> &[PathArgument] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InstancePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for arg in &self.0 {
            match arg {
                PathArgument::Node(name) => write!(f, "/{}", name.local_name)?,
                PathArgument::Entry { name, keys } => {
                    write!(f, "/{}", name.local_name)?;
                    for (k, v) in keys {
                        write!(f, "[{}={}]", k.local_name, v)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Node of a normalized data tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataNode {
    Leaf {
        name: QName,
        value: Value,
    },
    LeafList {
        name: QName,
        values: Vec<Value>,
    },
    Container {
        name: QName,
        children: Vec<DataNode>,
    },
    /// Keyed list; carries only entries, never leaves directly.
    List {
        name: QName,
        entries: Vec<DataNode>,
    },
    ListEntry {
        name: QName,
        keys: BTreeMap<QName, Value>,
        children: Vec<DataNode>,
    },
}

impl DataNode {
    pub fn leaf(name: QName, value: Value) -> Self {
        DataNode::Leaf { name, value }
    }

    pub fn container(name: QName, children: Vec<DataNode>) -> Self {
        DataNode::Container { name, children }
    }

    pub fn name(&self) -> &QName {
        match self {
            DataNode::Leaf { name, .. }
            | DataNode::LeafList { name, .. }
            | DataNode::Container { name, .. }
            | DataNode::List { name, .. }
            | DataNode::ListEntry { name, .. } => name,
        }
    }

    /// Lists are pure grouping nodes: they vanish when serialized, only their
    /// entries are visible on the wire to the device.
    pub fn is_mixin(&self) -> bool {
        matches!(self, DataNode::List { .. } | DataNode::LeafList { .. })
    }

    pub fn children(&self) -> &[DataNode] {
        match self {
            DataNode::Container { children, .. } | DataNode::ListEntry { children, .. } => children,
            DataNode::List { entries, .. } => entries,
            DataNode::Leaf { .. } | DataNode::LeafList { .. } => &[],
        }
    }
}

/// A tree fragment together with the path it is anchored at.
///
/// Tree-bearing messages always carry the pair; a bare node cannot be applied
/// without its instance-identifier context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTree {
    pub path: InstancePath,
    pub node: DataNode,
}

impl PathTree {
    pub fn new(path: InstancePath, node: DataNode) -> Self {
        Self { path, node }
    }
}

/// Datastores of the device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datastore {
    Running,
    Candidate,
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datastore::Running => f.write_str("running"),
            Datastore::Candidate => f.write_str("candidate"),
        }
    }
}

/// Logical datastore seen by north-bound callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalDatastore {
    Configuration,
    Operational,
}

impl fmt::Display for LogicalDatastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalDatastore::Configuration => f.write_str("configuration"),
            LogicalDatastore::Operational => f.write_str("operational"),
        }
    }
}

/// `operation` / `default-operation` attribute of an edit-config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EditOperation {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
    None,
}

impl fmt::Display for EditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EditOperation::Merge => "merge",
            EditOperation::Replace => "replace",
            EditOperation::Create => "create",
            EditOperation::Delete => "delete",
            EditOperation::Remove => "remove",
            EditOperation::None => "none",
        };
        f.write_str(s)
    }
}

/// Severity of an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Error,
    Warning,
}

/// Structured `rpc-error` as reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub severity: ErrorSeverity,
    pub error_type: String,
    pub tag: String,
    pub message: Option<String>,
    pub app_tag: Option<String>,
    pub info: Option<String>,
}

impl RpcError {
    pub fn new(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ErrorSeverity::Error,
            error_type: "application".into(),
            tag: tag.into(),
            message: Some(message.into()),
            app_tag: None,
            info: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == ErrorSeverity::Error
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.error_type, self.tag)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(info) = &self.info {
            write!(f, " ({info})")?;
        }
        Ok(())
    }
}

/// Renders a list of rpc-errors on one line for logs and error messages.
pub fn format_rpc_errors(errors: &[RpcError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
