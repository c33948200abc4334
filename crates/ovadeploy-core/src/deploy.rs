//! Disk transfer and the full deploy pipeline.
//!
//! [`transfer_disks`] uploads the extracted images of an appliance through a
//! ready lease, one after the other, switching a disk to the datastore copy
//! path when the host refuses the POST. [`deploy_appliance`] runs the whole
//! chain:
//! 1. Extract the archive next to itself
//! 2. Verify the manifest, when asked to and one is present
//! 3. Create the import spec and start the import
//! 4. Wait for the lease
//! 5. Upload the disks and complete the lease
//!
//! Nothing is rolled back when a step fails.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::archive::{extract_appliance, FileRole, OvaInfo};
use crate::config::ImportOptions;
use crate::error::{Error, Result};
use crate::import::{import_appliance, ImportRequest, VmShape};
use crate::lease::{await_lease_ready, CancelFlag, LeasePolicy};
use crate::manifest::{verify_manifest, ManifestReport};
use crate::transfer::{CopyFileParams, TransferClient, UploadProgress};
use crate::vim::{HostApi, InventoryObject, KeyValue, ManagedObjectRef};
use crate::vmdk::probe_disk;

/// Remote name optical images get when copied to the datastore.
pub const DEVICE_IMAGE_NAME: &str = "_deviceImage-0.iso";

/// How one disk reached the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRoute {
    /// Accepted by the lease endpoint.
    Primary,
    /// Refused by the lease endpoint, copied to the datastore instead.
    Fallback { remote_name: String },
    /// Refused by the lease endpoint and the datastore copy failed too.
    FallbackFailed { remote_name: String, reason: String },
}

/// Result for one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskOutcome {
    pub disk: String,
    pub route: TransferRoute,
}

/// Per-disk results in upload order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub outcomes: Vec<DiskOutcome>,
}

impl TransferReport {
    /// Disks that did not reach the host.
    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.route, TransferRoute::FallbackFailed { .. }))
            .map(|o| o.disk.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed().is_empty()
    }

    /// Turn recorded fallback failures into an error.
    pub fn ensure_complete(&self) -> Result<()> {
        let failed = self.failed();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialTransfer {
                failed: failed.into_iter().map(str::to_string).collect(),
            })
        }
    }
}

/// Datastore name an image is copied to when the lease path refuses it.
pub fn fallback_remote_name(disk: &str) -> &str {
    match FileRole::classify(disk) {
        FileRole::OpticalImage => DEVICE_IMAGE_NAME,
        _ => disk,
    }
}

/// Upload `disks` from `directory` in order and complete the lease.
///
/// `url_template` is the lease device URL; every `*` in it is replaced by the
/// host address. `progress` receives the bytes sent across all disks so far.
///
/// # Errors
///
/// A disk that cannot be opened, a transport failure or an error status
/// without the fallback marker stops the loop; the lease is then left
/// uncompleted. A failing lease completion is returned even when every disk
/// was placed. Failed datastore copies do not stop the loop; they are
/// recorded in the report.
#[allow(clippy::too_many_arguments)]
pub fn transfer_disks(
    host: &dyn HostApi,
    transfer: &TransferClient,
    url_template: &str,
    directory: &Path,
    disks: &[String],
    lease: &ManagedObjectRef,
    request: &ImportRequest,
    progress: Option<UploadProgress>,
) -> Result<TransferReport> {
    let report = upload_disks(
        host,
        transfer,
        url_template,
        directory,
        disks,
        lease,
        request,
        progress,
    )?;
    complete_lease(host, lease, disks.len())?;
    Ok(report)
}

/// The upload loop of [`transfer_disks`], leaving the lease open.
#[allow(clippy::too_many_arguments)]
fn upload_disks(
    host: &dyn HostApi,
    transfer: &TransferClient,
    url_template: &str,
    directory: &Path,
    disks: &[String],
    lease: &ManagedObjectRef,
    request: &ImportRequest,
    progress: Option<UploadProgress>,
) -> Result<TransferReport> {
    let url = url_template.replace('*', host.host_address());
    let mut report = TransferReport::default();
    let mut sent_before: u64 = 0;

    for (index, disk) in disks.iter().enumerate() {
        let path = directory.join(disk);
        warn_if_not_stream_optimized(disk, &path);

        let disk_progress = progress.as_ref().map(|p| {
            let p = Arc::clone(p);
            let base = sent_before;
            Arc::new(move |n: u64| p(base + n)) as UploadProgress
        });

        info!(disk = %disk, index = index + 1, total = disks.len(), "uploading disk");
        let response = transfer.post_stream_vmdk(&url, &path, disk_progress.clone())?;

        let route = if response.requests_fallback() {
            info!(disk = %disk, "lease endpoint refused the disk, copying to datastore");
            copy_through_datastore(host, transfer, directory, disk, request, disk_progress)
        } else if response.status.is_success() {
            TransferRoute::Primary
        } else {
            return Err(Error::transfer(
                disk,
                format!("host answered HTTP {}", response.status),
            ));
        };

        if let TransferRoute::FallbackFailed { reason, .. } = &route {
            warn!(disk = %disk, reason = %reason, "datastore copy failed");
        }
        report.outcomes.push(DiskOutcome {
            disk: disk.clone(),
            route,
        });

        sent_before += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let percent = ((index + 1) * 100 / disks.len()) as u8;
        if let Err(e) = host.lease_progress(lease, percent) {
            warn!(lease = %lease, percent, error = %e, "lease progress not reported");
        }
    }

    Ok(report)
}

fn complete_lease(host: &dyn HostApi, lease: &ManagedObjectRef, disks: usize) -> Result<()> {
    host.complete_lease(lease)?;
    info!(lease = %lease, disks, "lease completed");
    Ok(())
}

fn copy_through_datastore(
    host: &dyn HostApi,
    transfer: &TransferClient,
    directory: &Path,
    disk: &str,
    request: &ImportRequest,
    progress: Option<UploadProgress>,
) -> TransferRoute {
    let remote_name = fallback_remote_name(disk).to_string();

    let attempt = || -> Result<()> {
        let datacenter = host.datacenter()?;
        let datastore = host.datastore(&request.datastore)?;
        let params = CopyFileParams {
            dc_name: datacenter.name,
            ds_name: datastore.name,
            local_dir: directory.to_path_buf(),
            file_name: disk.to_string(),
            remote_dir: format!("/{}", request.vm.name),
            remote_file_name: (remote_name != disk).then(|| remote_name.clone()),
        };
        transfer.copy_to_datastore(&params, progress)
    };

    match attempt() {
        Ok(()) => TransferRoute::Fallback { remote_name },
        Err(e) => TransferRoute::FallbackFailed {
            remote_name,
            reason: e.to_string(),
        },
    }
}

fn warn_if_not_stream_optimized(disk: &str, path: &Path) {
    if FileRole::classify(disk) != FileRole::Disk {
        return;
    }
    match probe_disk(path) {
        Ok(format) if !format.is_stream_optimized() => {
            warn!(disk, ?format, "disk is not stream-optimized, the host may refuse it");
        }
        Ok(_) => {}
        Err(e) => debug!(disk, error = %e, "disk not probed"),
    }
}

/// Options for the deploy pipeline.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub import: ImportOptions,
    pub lease: LeasePolicy,
    /// Check SHA256 digests from the manifest before importing.
    pub verify_manifest: bool,
}

impl DeployOptions {
    /// Defaults with manifest verification turned on.
    pub fn verified() -> Self {
        Self {
            verify_manifest: true,
            ..Self::default()
        }
    }
}

/// Where on the host the appliance goes.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub vm_folder: ManagedObjectRef,
    pub host: ManagedObjectRef,
    pub datastore: ManagedObjectRef,
    pub resource_pool: ManagedObjectRef,
    /// Networks available for mapping.
    pub networks: Vec<InventoryObject>,
}

/// Input of [`deploy_appliance`].
#[derive(Debug, Clone)]
pub struct DeployPlan {
    /// Directory holding the archive; it is extracted in place.
    pub directory: PathBuf,
    /// Archive filename inside `directory`.
    pub archive: String,
    pub target: DeployTarget,
    pub vm: VmShape,
    pub property_mappings: Vec<KeyValue>,
    pub options: DeployOptions,
    pub cancel: Option<CancelFlag>,
}

/// Phase of the deploy pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    /// Unpacking the archive.
    Extracting,
    /// Checking manifest digests.
    Verifying,
    /// Creating the import spec and starting the import.
    Importing,
    /// Polling the lease.
    WaitingForLease,
    /// Sending disk images.
    Uploading,
    /// Completing the lease.
    Completing,
    /// Done.
    Complete,
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployPhase::Extracting => write!(f, "Extracting"),
            DeployPhase::Verifying => write!(f, "Verifying"),
            DeployPhase::Importing => write!(f, "Importing"),
            DeployPhase::WaitingForLease => write!(f, "Waiting for lease"),
            DeployPhase::Uploading => write!(f, "Uploading"),
            DeployPhase::Completing => write!(f, "Completing"),
            DeployPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Progress of the deploy pipeline.
#[derive(Debug, Clone)]
pub struct DeployProgress {
    pub phase: DeployPhase,
    /// Bytes uploaded so far.
    pub bytes_sent: u64,
    /// Total bytes of all images to upload.
    pub bytes_total: u64,
    pub total_disks: usize,
}

impl DeployProgress {
    pub fn new(phase: DeployPhase, bytes_total: u64, total_disks: usize) -> Self {
        Self {
            phase,
            bytes_sent: 0,
            bytes_total,
            total_disks,
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return match self.phase {
                DeployPhase::Complete => 100.0,
                _ => 0.0,
            };
        }
        (self.bytes_sent as f64 / self.bytes_total as f64) * 100.0
    }
}

pub type ProgressCallback = Arc<dyn Fn(DeployProgress) + Send + Sync>;

/// What a finished deploy produced.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub ova: OvaInfo,
    pub lease: ManagedObjectRef,
    /// Present when the manifest was verified.
    pub manifest: Option<ManifestReport>,
    pub report: TransferReport,
}

/// Extract, import and upload an appliance.
///
/// # Errors
///
/// Returns the first failing step's error. Fallback copy failures are not
/// errors here; check [`TransferReport::ensure_complete`] on the outcome.
pub fn deploy_appliance(
    host: &dyn HostApi,
    transfer: &TransferClient,
    plan: &DeployPlan,
    progress_callback: Option<ProgressCallback>,
) -> Result<DeployOutcome> {
    let report_phase = |progress: &DeployProgress| {
        if let Some(callback) = &progress_callback {
            callback(progress.clone());
        }
    };

    let mut progress = DeployProgress::new(DeployPhase::Extracting, 0, 0);
    report_phase(&progress);
    info!(archive = %plan.archive, dir = %plan.directory.display(), "extracting appliance");
    let ova = extract_appliance(&plan.directory, &plan.archive)?;

    progress.bytes_total = images_size(&ova)?;
    progress.total_disks = ova.disks.len();

    let manifest = match (&ova.manifest, plan.options.verify_manifest) {
        (Some(name), true) => {
            progress.phase = DeployPhase::Verifying;
            report_phase(&progress);
            let report = verify_manifest(&ova.dir, name)?;
            info!(verified = report.verified.len(), "manifest verified");
            Some(report)
        }
        (None, true) => {
            warn!(archive = %plan.archive, "no manifest to verify");
            None
        }
        _ => None,
    };

    let request = ImportRequest {
        ova: ova.clone(),
        vm_folder: plan.target.vm_folder.clone(),
        host: plan.target.host.clone(),
        datastore: plan.target.datastore.clone(),
        resource_pool: plan.target.resource_pool.clone(),
        networks: plan.target.networks.clone(),
        vm: plan.vm.clone(),
        property_mappings: plan.property_mappings.clone(),
    };

    progress.phase = DeployPhase::Importing;
    report_phase(&progress);
    let lease = import_appliance(host, &request, &plan.options.import)?;

    progress.phase = DeployPhase::WaitingForLease;
    report_phase(&progress);
    let snapshot = await_lease_ready(host, &lease, &plan.options.lease, plan.cancel.as_ref())?;

    let url_template = match snapshot.transfer_url() {
        Some(url) => url.to_string(),
        None if ova.disks.is_empty() => String::new(),
        None => {
            return Err(Error::lease(
                snapshot.state.as_str(),
                Some("lease granted no upload URL".to_string()),
            ))
        }
    };

    progress.phase = DeployPhase::Uploading;
    report_phase(&progress);
    let upload_progress: Option<UploadProgress> = progress_callback.as_ref().map(|callback| {
        let callback = Arc::clone(callback);
        let template = progress.clone();
        Arc::new(move |sent: u64| {
            let mut p = template.clone();
            p.bytes_sent = sent;
            callback(p);
        }) as UploadProgress
    });

    let report = upload_disks(
        host,
        transfer,
        &url_template,
        &ova.dir,
        &ova.disks,
        &lease,
        &request,
        upload_progress,
    )?;

    progress.phase = DeployPhase::Completing;
    progress.bytes_sent = progress.bytes_total;
    report_phase(&progress);
    complete_lease(host, &lease, ova.disks.len())?;

    progress.phase = DeployPhase::Complete;
    report_phase(&progress);

    Ok(DeployOutcome {
        ova,
        lease,
        manifest,
        report,
    })
}

fn images_size(ova: &OvaInfo) -> Result<u64> {
    let mut total = 0;
    for disk in &ova.disks {
        let path = ova.path_of(disk);
        total += fs::metadata(&path).map_err(|e| Error::io(e, &path))?.len();
    }
    Ok(total)
}
