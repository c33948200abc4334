//! Shared fixtures: OVA builder and an in-memory host.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;

use ovadeploy_core::vim::soap::parse_document;
use ovadeploy_core::vim::{
    DeviceUrl, HostApi, ImportSpec, ImportSpecParams, InventoryObject, LeaseSnapshot, LeaseState,
    ManagedObjectRef,
};
use ovadeploy_core::{Error, Result};

pub const DESCRIPTOR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1">
  <References>
    <File ovf:id="file1" ovf:href="disk-0.vmdk" ovf:size="4096"/>
    <File ovf:id="file2" ovf:href="tools.iso" ovf:size="2048"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:diskId="vmdisk1" ovf:fileRef="file1" ovf:capacity="8" ovf:capacityAllocationUnits="byte * 2^30" ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="VM Network">
      <Description>The VM Network network</Description>
    </Network>
    <Network ovf:name="Backend"/>
  </NetworkSection>
  <DeploymentOptionSection>
    <Info>Deployment sizes</Info>
    <Configuration ovf:id="small"><Label>Small</Label></Configuration>
    <Configuration ovf:id="large" ovf:default="true"><Label>Large</Label></Configuration>
  </DeploymentOptionSection>
  <VirtualSystem ovf:id="web01">
    <Info>A virtual machine</Info>
    <ProductSection>
      <Info>Product information</Info>
      <Product>Web Appliance</Product>
      <Property ovf:key="guestinfo.hostname" ovf:type="string" ovf:value="appliance"/>
      <Property ovf:key="guestinfo.ip" ovf:type="string"/>
    </ProductSection>
  </VirtualSystem>
</Envelope>
"#;

/// Write a ustar archive of `(name, data, mode)` entries to `dir/name`.
pub fn build_ova(dir: &Path, name: &str, entries: &[(&str, &[u8], u32)]) {
    let file = File::create(dir.join(name)).unwrap();
    let mut builder = tar::Builder::new(file);
    for (entry_name, data, mode) in entries {
        let mut header = tar::Header::new_ustar();
        header.set_path(entry_name).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    builder.finish().unwrap();
}

/// First sector of a stream-optimized sparse extent followed by filler.
pub fn stream_optimized_disk(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len.max(512)];
    data[0..4].copy_from_slice(b"KDMV");
    data[4..8].copy_from_slice(&3u32.to_le_bytes());
    data[8..12].copy_from_slice(&(0x1u32 | 1 << 16 | 1 << 17).to_le_bytes());
    data[12..20].copy_from_slice(&16_384u64.to_le_bytes());
    data
}

/// Standard appliance: descriptor, one disk, one optical image.
pub fn build_standard_ova(dir: &Path, name: &str) {
    let disk = stream_optimized_disk(4096);
    let iso = vec![0x43u8; 2048];
    build_ova(
        dir,
        name,
        &[
            ("web01.ovf", DESCRIPTOR.as_bytes(), 0o644),
            ("disk-0.vmdk", &disk, 0o644),
            ("tools.iso", &iso, 0o644),
        ],
    );
}

pub fn mo(kind: &str, value: &str) -> ManagedObjectRef {
    ManagedObjectRef::new(kind, value)
}

/// In-memory host recording every call.
pub struct FakeHost {
    pub address: String,
    pub device_url: String,
    /// Lease states returned by successive polls; the last one repeats.
    pub states: RefCell<VecDeque<LeaseState>>,
    pub lease_error: Option<String>,
    pub reject_import_spec: Option<String>,
    pub fail_complete: bool,
    pub fail_datacenter: bool,
    pub calls: RefCell<Vec<String>>,
    pub polls: Cell<u32>,
    pub spec_params: RefCell<Option<ImportSpecParams>>,
    pub imported_spec: RefCell<Option<ImportSpec>>,
    pub progress: RefCell<Vec<u8>>,
}

impl FakeHost {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            device_url: "http://*/nfc/52-1/disk-0.vmdk".to_string(),
            states: RefCell::new(VecDeque::from([LeaseState::Ready])),
            lease_error: None,
            reject_import_spec: None,
            fail_complete: false,
            fail_datacenter: false,
            calls: RefCell::new(Vec::new()),
            polls: Cell::new(0),
            spec_params: RefCell::new(None),
            imported_spec: RefCell::new(None),
            progress: RefCell::new(Vec::new()),
        }
    }

    pub fn with_states(self, states: impl IntoIterator<Item = LeaseState>) -> Self {
        *self.states.borrow_mut() = states.into_iter().collect();
        self
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls.borrow().iter().any(|c| c == name)
    }

    fn record(&self, name: &str) {
        self.calls.borrow_mut().push(name.to_string());
    }
}

impl HostApi for FakeHost {
    fn host_address(&self) -> &str {
        &self.address
    }

    fn datacenter(&self) -> Result<InventoryObject> {
        self.record("datacenter");
        if self.fail_datacenter {
            return Err(Error::host_rejected("RetrievePropertiesEx", "NotAuthenticated"));
        }
        Ok(InventoryObject::new(mo("Datacenter", "ha-datacenter"), "ha-datacenter"))
    }

    fn datastore(&self, reference: &ManagedObjectRef) -> Result<InventoryObject> {
        self.record("datastore");
        Ok(InventoryObject::new(reference.clone(), "datastore1"))
    }

    fn create_import_spec(
        &self,
        _descriptor: &str,
        _resource_pool: &ManagedObjectRef,
        _datastore: &ManagedObjectRef,
        params: &ImportSpecParams,
    ) -> Result<ImportSpec> {
        self.record("create_import_spec");
        *self.spec_params.borrow_mut() = Some(params.clone());
        if let Some(message) = &self.reject_import_spec {
            return Err(Error::host_rejected("CreateImportSpec", message.clone()));
        }
        let spec = parse_document(
            "<importSpec><configSpec><name>web01</name><numCPUs>1</numCPUs><memoryMB>1024</memoryMB></configSpec></importSpec>",
        )?;
        Ok(ImportSpec {
            spec,
            warnings: vec!["Line 20: Unsupported element 'Foo'".to_string()],
        })
    }

    fn import_vapp(
        &self,
        _resource_pool: &ManagedObjectRef,
        spec: &ImportSpec,
        _folder: &ManagedObjectRef,
        _host: &ManagedObjectRef,
    ) -> Result<ManagedObjectRef> {
        self.record("import_vapp");
        *self.imported_spec.borrow_mut() = Some(spec.clone());
        Ok(mo("HttpNfcLease", "52-1"))
    }

    fn lease_snapshot(&self, lease: &ManagedObjectRef) -> Result<LeaseSnapshot> {
        self.polls.set(self.polls.get() + 1);
        let state = {
            let mut states = self.states.borrow_mut();
            if states.len() > 1 {
                states.pop_front().unwrap_or(LeaseState::Ready)
            } else {
                states.front().cloned().unwrap_or(LeaseState::Ready)
            }
        };
        let device_urls = if state == LeaseState::Ready {
            vec![DeviceUrl {
                key: "/vm-1/VirtualLsiLogicController0:0".to_string(),
                import_key: "/web01/VirtualLsiLogicController0:0".to_string(),
                url: self.device_url.clone(),
                target_id: Some("disk-0.vmdk".to_string()),
                disk: true,
            }]
        } else {
            Vec::new()
        };
        let error = if state == LeaseState::Error {
            self.lease_error.clone()
        } else {
            None
        };
        Ok(LeaseSnapshot {
            lease: lease.clone(),
            state,
            device_urls,
            error,
        })
    }

    fn lease_progress(&self, _lease: &ManagedObjectRef, percent: u8) -> Result<()> {
        self.record("lease_progress");
        self.progress.borrow_mut().push(percent);
        Ok(())
    }

    fn complete_lease(&self, _lease: &ManagedObjectRef) -> Result<()> {
        self.record("complete_lease");
        if self.fail_complete {
            return Err(Error::host_rejected("HttpNfcLeaseComplete", "Timed out"));
        }
        Ok(())
    }
}
