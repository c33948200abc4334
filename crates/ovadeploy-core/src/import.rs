//! Import spec building and the `ImportVApp` request.

use std::thread;

use tracing::{debug, info, warn};

use crate::archive::OvaInfo;
use crate::config::ImportOptions;
use crate::error::Result;
use crate::ovf::inspect_descriptor;
use crate::vim::soap::XmlNode;
use crate::vim::{
    HostApi, ImportSpec, ImportSpecParams, InventoryObject, KeyValue, ManagedObjectRef,
    NetworkMapping,
};

/// Requested shape of the imported VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmShape {
    /// Name of the new VM; also the datastore folder of fallback copies.
    pub name: String,
    /// Memory override in MB.
    pub memory_mb: Option<u32>,
    /// vCPU override.
    pub num_cpus: Option<u32>,
    /// Port-group names, matched by exact name against host networks.
    pub port_groups: Vec<String>,
    /// Passed through to the host unchanged (`thin`, `thick`, ...). Empty
    /// leaves the choice to the host.
    pub disk_provisioning: String,
    /// Deployment configuration id; empty selects the descriptor default.
    pub deployment_option: String,
}

impl VmShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Everything needed to import one appliance.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub ova: OvaInfo,
    pub vm_folder: ManagedObjectRef,
    pub host: ManagedObjectRef,
    pub datastore: ManagedObjectRef,
    pub resource_pool: ManagedObjectRef,
    /// Networks available on the host.
    pub networks: Vec<InventoryObject>,
    pub vm: VmShape,
    /// OVF property values.
    pub property_mappings: Vec<KeyValue>,
}

impl ImportRequest {
    pub fn network_mappings(&self) -> Vec<NetworkMapping> {
        network_mappings(&self.vm.port_groups, &self.networks)
    }
}

/// Pair every host network with every requested port group of the same name.
///
/// Mappings follow the host's network order. Names without a match produce
/// nothing; duplicates on either side produce one mapping per pair.
pub fn network_mappings(port_groups: &[String], networks: &[InventoryObject]) -> Vec<NetworkMapping> {
    let mut mappings = Vec::new();
    for network in networks {
        for port_group in port_groups {
            if &network.name == port_group {
                mappings.push(NetworkMapping {
                    name: port_group.clone(),
                    network: network.reference.clone(),
                });
            }
        }
    }
    mappings
}

/// Ask the host for an import spec and start the import.
///
/// Returns the transfer lease granted by `ImportVApp` after the settle
/// delay. Nothing is undone when a step fails.
pub fn import_appliance(
    host: &dyn HostApi,
    request: &ImportRequest,
    options: &ImportOptions,
) -> Result<ManagedObjectRef> {
    let network_mappings = request.network_mappings();
    warn_unmapped_networks(request, &network_mappings);

    let params = ImportSpecParams {
        entity_name: request.vm.name.clone(),
        host: request.host.clone(),
        locale: options.locale.clone(),
        deployment_option: request.vm.deployment_option.clone(),
        network_mappings,
        property_mappings: request.property_mappings.clone(),
        disk_provisioning: request.vm.disk_provisioning.clone(),
    };

    info!(vm = %request.vm.name, descriptor = %request.ova.ovf.file_name, "creating import spec");
    let mut spec = host.create_import_spec(
        &request.ova.ovf.data,
        &request.resource_pool,
        &request.datastore,
        &params,
    )?;
    for warning in &spec.warnings {
        warn!(vm = %request.vm.name, warning = %warning, "import spec warning");
    }

    apply_vm_shape(&mut spec, &request.vm);

    let lease = host.import_vapp(
        &request.resource_pool,
        &spec,
        &request.vm_folder,
        &request.host,
    )?;
    info!(vm = %request.vm.name, lease = %lease, "import started");

    if !options.settle_delay.is_zero() {
        thread::sleep(options.settle_delay);
    }
    Ok(lease)
}

fn warn_unmapped_networks(request: &ImportRequest, mappings: &[NetworkMapping]) {
    let summary = match inspect_descriptor(&request.ova.ovf.data) {
        Ok(summary) => summary,
        Err(e) => {
            debug!(error = %e, "descriptor not inspected");
            return;
        }
    };
    let mapped: Vec<String> = mappings.iter().map(|m| m.name.clone()).collect();
    for network in summary.unmapped_networks(&mapped) {
        warn!(network, "descriptor network is not mapped to a host network");
    }
}

/// Override memory and CPU count in every `configSpec` of the import spec.
fn apply_vm_shape(spec: &mut ImportSpec, vm: &VmShape) {
    if let Some(memory_mb) = vm.memory_mb {
        let n = rewrite_config_value(&mut spec.spec, "memoryMB", &memory_mb.to_string());
        if n == 0 {
            warn!(vm = %vm.name, "import spec has no memoryMB to override");
        }
    }
    if let Some(num_cpus) = vm.num_cpus {
        let n = rewrite_config_value(&mut spec.spec, "numCPUs", &num_cpus.to_string());
        if n == 0 {
            warn!(vm = %vm.name, "import spec has no numCPUs to override");
        }
    }
}

fn rewrite_config_value(node: &mut XmlNode, name: &str, value: &str) -> usize {
    let mut rewritten = 0;
    if node.local_name() == "configSpec" {
        for field in node.children.iter_mut().filter(|c| c.local_name() == name) {
            field.text = value.to_string();
            rewritten += 1;
        }
    }
    for child in &mut node.children {
        rewritten += rewrite_config_value(child, name, value);
    }
    rewritten
}
