//! Capability set advertised by a device session.
//!
//! A [`CapabilitySet`] is built once per session from the raw capability URIs
//! of the device hello (plus optional user-defined capabilities) and is never
//! mutated: merging or replacing halves always yields a new value.
//!
//! Capabilities carrying a `module=` query parameter are module-based and are
//! keyed by their qualified name; everything else is kept verbatim as a
//! non-module capability.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::types::QName;

pub const NETCONF_CANDIDATE_URI: &str = "urn:ietf:params:netconf:capability:candidate:1.0";
pub const NETCONF_RUNNING_WRITABLE_URI: &str = "urn:ietf:params:netconf:capability:writable-running:1.0";
pub const NETCONF_ROLLBACK_ON_ERROR_URI: &str = "urn:ietf:params:netconf:capability:rollback-on-error:1.0";
pub const NETCONF_NOTIFICATIONS_URI: &str = "urn:ietf:params:netconf:capability:notification:1.0";

pub const IETF_NETCONF_MONITORING_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";
pub const IETF_NETCONF_NOTIFICATIONS_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-notifications";

/// `ietf-netconf-monitoring@2010-10-04`
pub fn ietf_netconf_monitoring() -> QName {
    QName::with_revision(IETF_NETCONF_MONITORING_NS, "2010-10-04", "ietf-netconf-monitoring")
}

/// `ietf-netconf-notifications@2012-02-06`
pub fn ietf_netconf_notifications() -> QName {
    QName::with_revision(IETF_NETCONF_NOTIFICATIONS_NS, "2012-02-06", "ietf-netconf-notifications")
}

/// Where a capability came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityOrigin {
    DeviceAdvertised,
    UserDefined,
}

/// Immutable partitioned view of a device's capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    module_caps: HashMap<QName, CapabilityOrigin>,
    non_module_caps: HashMap<String, CapabilityOrigin>,
}

impl CapabilitySet {
    pub fn new(
        non_module_caps: HashMap<String, CapabilityOrigin>,
        module_caps: HashMap<QName, CapabilityOrigin>,
    ) -> Self {
        Self {
            module_caps,
            non_module_caps,
        }
    }

    /// Parses capability URIs, tagging every entry with `origin`.
    pub fn from_strings<I, S>(capabilities: I, origin: CapabilityOrigin) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut module_caps = HashMap::new();
        let mut non_module_caps = HashMap::new();

        for capability in capabilities {
            let capability = capability.as_ref();
            match parse_module_capability(capability) {
                Some(qname) => {
                    module_caps.insert(qname, origin);
                }
                None => {
                    non_module_caps.insert(capability.to_string(), origin);
                }
            }
        }

        Self {
            module_caps,
            non_module_caps,
        }
    }

    /// Parses device-advertised capability URIs.
    pub fn from_advertised<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_strings(capabilities, CapabilityOrigin::DeviceAdvertised)
    }

    pub fn module_caps(&self) -> &HashMap<QName, CapabilityOrigin> {
        &self.module_caps
    }

    pub fn non_module_caps(&self) -> &HashMap<String, CapabilityOrigin> {
        &self.non_module_caps
    }

    pub fn contains_module_capability(&self, qname: &QName) -> bool {
        self.module_caps.contains_key(qname)
    }

    pub fn contains_non_module_capability(&self, capability: &str) -> bool {
        self.non_module_caps.contains_key(capability)
    }

    /// Prefix match, assuming parameters are in the same order.
    pub fn contains_partial_non_module_capability(&self, capability: &str) -> bool {
        let found = self.non_module_caps.keys().any(|c| c.starts_with(capability));
        if found {
            trace!(capability, "capability partially matches");
        }
        found
    }

    pub fn is_candidate_supported(&self) -> bool {
        self.contains_non_module_capability(NETCONF_CANDIDATE_URI)
    }

    pub fn is_running_writable(&self) -> bool {
        self.contains_non_module_capability(NETCONF_RUNNING_WRITABLE_URI)
    }

    pub fn is_rollback_supported(&self) -> bool {
        self.contains_non_module_capability(NETCONF_ROLLBACK_ON_ERROR_URI)
    }

    pub fn is_notifications_supported(&self) -> bool {
        self.contains_partial_non_module_capability(NETCONF_NOTIFICATIONS_URI)
            || self.contains_module_capability(&ietf_netconf_notifications())
    }

    pub fn is_monitoring_supported(&self) -> bool {
        self.contains_module_capability(&ietf_netconf_monitoring())
            || self.contains_partial_non_module_capability(IETF_NETCONF_MONITORING_NS)
    }

    /// Union of both halves; entries of `other` win on conflict.
    pub fn merge(&self, other: &CapabilitySet) -> Self {
        self.add_module_caps(other).add_non_module_caps(other)
    }

    /// Merges only the module-based half of `other` into this set.
    pub fn add_module_caps(&self, other: &CapabilitySet) -> Self {
        let mut module_caps = self.module_caps.clone();
        module_caps.extend(other.module_caps.iter().map(|(k, v)| (k.clone(), *v)));
        Self {
            module_caps,
            non_module_caps: self.non_module_caps.clone(),
        }
    }

    /// Merges only the non-module half of `other` into this set.
    pub fn add_non_module_caps(&self, other: &CapabilitySet) -> Self {
        let mut non_module_caps = self.non_module_caps.clone();
        non_module_caps.extend(other.non_module_caps.iter().map(|(k, v)| (k.clone(), *v)));
        Self {
            module_caps: self.module_caps.clone(),
            non_module_caps,
        }
    }

    /// Keeps the non-module half, takes the module half from `other`.
    pub fn replace_module_caps(&self, other: &CapabilitySet) -> Self {
        Self {
            module_caps: other.module_caps.clone(),
            non_module_caps: self.non_module_caps.clone(),
        }
    }

    /// Keeps the module half, takes the non-module half from `other`.
    pub fn replace_non_module_caps(&self, other: &CapabilitySet) -> Self {
        Self {
            module_caps: self.module_caps.clone(),
            non_module_caps: other.non_module_caps.clone(),
        }
    }

    /// Applies user-configured capabilities on top of the advertised set.
    ///
    /// With `override_modules` the user list replaces the advertised module
    /// capabilities; otherwise it is merged in.
    pub fn with_user_capabilities<I, S>(&self, user: I, override_modules: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let user = Self::from_strings(user, CapabilityOrigin::UserDefined);
        if override_modules {
            debug!(count = user.module_caps.len(), "overriding device module capabilities");
            self.replace_module_caps(&user).add_non_module_caps(&user)
        } else {
            self.merge(&user)
        }
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapabilitySet{{modules={}, capabilities={}, rollback={}, monitoring={}, candidate={}, writableRunning={}}}",
            self.module_caps.len(),
            self.non_module_caps.len(),
            self.is_rollback_supported(),
            self.is_monitoring_supported(),
            self.is_candidate_supported(),
            self.is_running_writable(),
        )
    }
}

fn param<'a>(params: &[&'a str], name: &str) -> Option<&'a str> {
    params.iter().find_map(|p| p.strip_prefix(name)).filter(|v| !v.is_empty())
}

fn parse_module_capability(capability: &str) -> Option<QName> {
    let (namespace, query) = capability.split_once('?')?;
    let params: Vec<&str> = query.split('&').collect();
    let module = param(&params, "module=")?;

    if let Some(revision) = param(&params, "revision=") {
        return Some(QName::with_revision(namespace, revision, module));
    }

    // Some devices mis-escape the revision, and it may not be there at all.
    if params.iter().any(|p| p.contains("revision=")) {
        debug!(capability, "device did not report revision correctly, trying amp;revision=");
        return match param(&params, "amp;revision=") {
            Some(revision) => Some(QName::with_revision(namespace, revision, module)),
            None => {
                warn!(capability, "device returned revision incorrectly escaped, ignoring it");
                Some(QName::new(namespace, module))
            }
        };
    }

    Some(QName::new(namespace, module))
}
