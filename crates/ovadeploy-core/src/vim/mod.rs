//! Host management API: shared types, the [`HostApi`] seam and the SOAP session.
//!
//! The import pipeline only talks to the host through [`HostApi`], so tests
//! can drive it with an in-memory host while [`VimSession`] speaks vim25 SOAP
//! to a real one.

pub mod session;
pub mod soap;

use std::fmt;

use crate::error::Result;

pub use session::{ServiceContent, VimSession};

/// Opaque identity of a host-side managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedObjectRef {
    /// Managed object type, e.g. `HostSystem` or `HttpNfcLease`.
    pub kind: String,
    /// Host-assigned identifier.
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// A named inventory object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryObject {
    pub reference: ManagedObjectRef,
    pub name: String,
}

impl InventoryObject {
    pub fn new(reference: ManagedObjectRef, name: impl Into<String>) -> Self {
        Self {
            reference,
            name: name.into(),
        }
    }
}

/// A datacenter with the folder new VMs are placed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datacenter {
    pub object: InventoryObject,
    pub vm_folder: ManagedObjectRef,
}

/// Generic key/value pair, used for OVF property values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Binds an appliance network name to a host network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMapping {
    /// Network name as declared in the descriptor (the requested port group).
    pub name: String,
    /// Host network the appliance network is attached to.
    pub network: ManagedObjectRef,
}

/// Parameters of `CreateImportSpec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpecParams {
    pub entity_name: String,
    pub host: ManagedObjectRef,
    pub locale: String,
    /// Deployment configuration id; empty selects the descriptor default.
    pub deployment_option: String,
    pub network_mappings: Vec<NetworkMapping>,
    pub property_mappings: Vec<KeyValue>,
    /// Disk provisioning mode passed through to the host (`thin`, `thick`, ...).
    pub disk_provisioning: String,
}

/// Import spec produced by the host, ready to be handed to `ImportVApp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    /// The spec element as returned by the host.
    pub spec: soap::XmlNode,
    /// Non-fatal messages reported alongside the spec.
    pub warnings: Vec<String>,
}

/// State of a transfer lease as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    Initializing,
    Ready,
    Done,
    Error,
    /// Any state string this client does not know.
    Unknown(String),
}

impl LeaseState {
    pub fn parse(value: &str) -> Self {
        match value {
            "initializing" => LeaseState::Initializing,
            "ready" => LeaseState::Ready,
            "done" => LeaseState::Done,
            "error" => LeaseState::Error,
            other => LeaseState::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LeaseState::Initializing => "initializing",
            LeaseState::Ready => "ready",
            LeaseState::Done => "done",
            LeaseState::Error => "error",
            LeaseState::Unknown(s) => s,
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upload target granted by a lease.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUrl {
    pub key: String,
    pub import_key: String,
    /// URL template; `*` stands for the host address.
    pub url: String,
    pub target_id: Option<String>,
    pub disk: bool,
}

/// Properties of a lease at one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub lease: ManagedObjectRef,
    pub state: LeaseState,
    pub device_urls: Vec<DeviceUrl>,
    /// Host message when the lease is in the error state.
    pub error: Option<String>,
}

impl LeaseSnapshot {
    /// URL template disks are streamed to: the first disk device URL, or the
    /// first device URL when none is flagged as a disk.
    pub fn transfer_url(&self) -> Option<&str> {
        self.device_urls
            .iter()
            .find(|d| d.disk)
            .or_else(|| self.device_urls.first())
            .map(|d| d.url.as_str())
    }
}

/// Operations the import pipeline needs from the host.
pub trait HostApi {
    /// Address substituted into lease URL templates.
    fn host_address(&self) -> &str;

    /// The datacenter file copies are addressed to.
    fn datacenter(&self) -> Result<InventoryObject>;

    /// Name lookup for a datastore reference.
    fn datastore(&self, reference: &ManagedObjectRef) -> Result<InventoryObject>;

    fn create_import_spec(
        &self,
        descriptor: &str,
        resource_pool: &ManagedObjectRef,
        datastore: &ManagedObjectRef,
        params: &ImportSpecParams,
    ) -> Result<ImportSpec>;

    /// Start the import; returns the transfer lease.
    fn import_vapp(
        &self,
        resource_pool: &ManagedObjectRef,
        spec: &ImportSpec,
        folder: &ManagedObjectRef,
        host: &ManagedObjectRef,
    ) -> Result<ManagedObjectRef>;

    fn lease_snapshot(&self, lease: &ManagedObjectRef) -> Result<LeaseSnapshot>;

    fn lease_progress(&self, lease: &ManagedObjectRef, percent: u8) -> Result<()>;

    fn complete_lease(&self, lease: &ManagedObjectRef) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_state_parse() {
        assert_eq!(LeaseState::parse("initializing"), LeaseState::Initializing);
        assert_eq!(LeaseState::parse("ready"), LeaseState::Ready);
        assert_eq!(LeaseState::parse("error"), LeaseState::Error);
        assert_eq!(LeaseState::parse("done"), LeaseState::Done);
        assert_eq!(
            LeaseState::parse("paused"),
            LeaseState::Unknown("paused".to_string())
        );
        assert_eq!(LeaseState::parse("paused").to_string(), "paused");
    }

    #[test]
    fn test_transfer_url_prefers_disk() {
        let snapshot = LeaseSnapshot {
            lease: ManagedObjectRef::new("HttpNfcLease", "52"),
            state: LeaseState::Ready,
            device_urls: vec![
                DeviceUrl {
                    url: "https://*/nfc/52/nvram".to_string(),
                    ..DeviceUrl::default()
                },
                DeviceUrl {
                    url: "https://*/nfc/52/disk-0.vmdk".to_string(),
                    disk: true,
                    ..DeviceUrl::default()
                },
            ],
            error: None,
        };
        assert_eq!(snapshot.transfer_url(), Some("https://*/nfc/52/disk-0.vmdk"));
    }

    #[test]
    fn test_transfer_url_empty() {
        let snapshot = LeaseSnapshot {
            lease: ManagedObjectRef::new("HttpNfcLease", "52"),
            state: LeaseState::Initializing,
            device_urls: Vec::new(),
            error: None,
        };
        assert_eq!(snapshot.transfer_url(), None);
    }

    #[test]
    fn test_managed_object_ref_display() {
        let r = ManagedObjectRef::new("HostSystem", "ha-host");
        assert_eq!(r.to_string(), "HostSystem:ha-host");
    }
}
