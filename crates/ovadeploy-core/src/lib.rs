//! OVADeploy Core Library
//!
//! This crate imports packaged virtual appliances (OVA) into a vSphere host.
//!
//! # Overview
//!
//! An OVA is unpacked next to itself, the host is asked for an import spec
//! built from the OVF descriptor, and the disk images are streamed through
//! the transfer lease the host grants. The main entry point is
//! [`deploy_appliance`], which runs the whole chain; each step is also
//! available on its own.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`config`] - Connection and import settings
//! - [`archive`] - OVA extraction and file classification
//! - [`manifest`] - Manifest parsing and digest verification
//! - [`ovf`] - OVF descriptor inspection
//! - [`vmdk`] - VMDK header probing
//! - [`vim`] - Host API seam and the vim25 SOAP session
//! - [`transfer`] - Disk and datastore file uploads
//! - [`import`] - Import spec building and `ImportVApp`
//! - [`lease`] - Waiting for the transfer lease
//! - [`deploy`] - Disk transfer orchestration and the deploy pipeline
//!
//! # Quick Start
//!
//! ```no_run
//! use ovadeploy_core::{ConnectionConfig, TransferClient, VimSession};
//! use ovadeploy_core::vim::HostApi;
//!
//! let mut session = VimSession::connect(ConnectionConfig::new("esxi01.lab")).unwrap();
//! session.login("root", "secret").unwrap();
//! let transfer = TransferClient::from_session(&session);
//! println!("datacenter: {}", session.datacenter().unwrap().name);
//! # let _ = transfer;
//! session.logout().unwrap();
//! ```

pub mod archive;
pub mod config;
pub mod deploy;
pub mod error;
pub mod import;
pub mod lease;
pub mod manifest;
pub mod ovf;
pub mod transfer;
pub mod vim;
pub mod vmdk;

pub use error::{Error, Result};

pub use archive::{extract_appliance, FileRole, OvaInfo, OvfFile};
pub use config::{ConnectionConfig, ImportOptions};
pub use deploy::{
    deploy_appliance, transfer_disks, DeployOptions, DeployOutcome, DeployPhase, DeployPlan,
    DeployProgress, DeployTarget, DiskOutcome, ProgressCallback, TransferReport, TransferRoute,
};
pub use import::{import_appliance, network_mappings, ImportRequest, VmShape};
pub use lease::{await_lease_ready, CancelFlag, LeasePolicy};
pub use manifest::{verify_manifest, ManifestReport};
pub use ovf::{inspect_descriptor, OvfSummary};
pub use transfer::{CopyFileParams, TransferClient, UploadProgress};
pub use vim::{HostApi, VimSession};
pub use vmdk::{probe_disk, DiskFormat};
