//! OVA archive extraction.
//!
//! An OVA is a plain ustar archive holding an OVF descriptor, the disk images
//! it references and optionally a manifest and certificate. Extraction writes
//! every entry below the extraction directory and then classifies the
//! directory's files by name to build an [`OvaInfo`].

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Role of a file found next to the descriptor, decided by filename.
///
/// Matching is a case-sensitive substring test. When a name matches several
/// patterns the first variant in declaration order wins, so
/// `disk.vmdk.ovf` is a [`FileRole::Descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// OVF descriptor (`.ovf`).
    Descriptor,
    /// Virtual disk image (`.vmdk`).
    Disk,
    /// Optical media image (`.iso`).
    OpticalImage,
    /// Checksum manifest (`.mf`).
    Manifest,
    /// Signing certificate (`.cert`).
    Certificate,
    /// Anything else, including the archive itself.
    Other,
}

impl FileRole {
    /// Classify a filename.
    pub fn classify(name: &str) -> Self {
        if name.contains(".ovf") {
            FileRole::Descriptor
        } else if name.contains(".vmdk") {
            FileRole::Disk
        } else if name.contains(".iso") {
            FileRole::OpticalImage
        } else if name.contains(".mf") {
            FileRole::Manifest
        } else if name.contains(".cert") {
            FileRole::Certificate
        } else {
            FileRole::Other
        }
    }

    /// Whether files of this role are uploaded through the transfer lease.
    pub fn is_transferable(self) -> bool {
        matches!(self, FileRole::Disk | FileRole::OpticalImage)
    }
}

/// The descriptor file read from an extracted appliance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OvfFile {
    /// Filename of the descriptor within the extraction directory.
    pub file_name: String,
    /// Full descriptor text.
    pub data: String,
}

/// Result of extracting an appliance archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OvaInfo {
    /// The OVF descriptor.
    pub ovf: OvfFile,
    /// Directory holding the descriptor and the disk images.
    pub dir: PathBuf,
    /// Disk and optical image filenames, in directory listing order.
    pub disks: Vec<String>,
    /// Manifest filename, when the archive carried one.
    pub manifest: Option<String>,
}

impl OvaInfo {
    /// Path of a file inside the extraction directory.
    pub fn path_of(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

/// Extract `dir/filename` into `dir` and describe the result.
///
/// Directory entries that cannot be created are skipped with a warning.
/// Failing to create or fill a regular file aborts the extraction. Extracted
/// files are left in place whether or not the call succeeds.
///
/// # Errors
///
/// Returns an I/O error if the archive cannot be opened or read or the
/// directory cannot be listed, and an archive error if an entry would land
/// outside `dir` or the directory does not hold exactly one descriptor.
pub fn extract_appliance(dir: impl AsRef<Path>, filename: &str) -> Result<OvaInfo> {
    let dir = dir.as_ref();
    let archive_path = dir.join(filename);
    info!(archive = %archive_path.display(), "extracting appliance");

    unpack_archive(&archive_path, dir)?;
    scan_directory(dir)
}

/// Write every directory and regular-file entry of `archive_path` below `dest`.
fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path).map_err(|e| Error::io(e, archive_path))?;
    let mut archive = tar::Archive::new(file);
    let entries = archive
        .entries()
        .map_err(|e| Error::io(e, archive_path))?;

    let mut files_written = 0usize;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::io(e, archive_path))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::io(e, archive_path))?
            .into_owned();
        let relative = sanitize_entry_path(&entry_path)?;
        let entry_type = entry.header().entry_type();

        if relative.as_os_str().is_empty() {
            if entry_type.is_dir() {
                continue;
            }
            return Err(Error::archive(format!(
                "entry '{}' has an empty path",
                entry_path.display()
            )));
        }
        let target = dest.join(&relative);

        if entry_type.is_dir() {
            if !target.exists() {
                if let Err(e) = fs::create_dir(&target) {
                    warn!(dir = %target.display(), error = %e, "skipping directory entry");
                }
            }
            continue;
        }

        if !entry_type.is_file() {
            debug!(entry = %entry_path.display(), "skipping non-file entry");
            continue;
        }

        let mode = entry
            .header()
            .mode()
            .map_err(|e| Error::io(e, archive_path))?;

        if let Some(parent) = target.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent))?;
            }
        }

        let mut out = open_target(&target, mode)?;
        let copied = io::copy(&mut entry, &mut out).map_err(|e| Error::io(e, &target))?;
        drop(out);
        apply_mode(&target, mode)?;

        debug!(file = %target.display(), bytes = copied, mode = %format!("{mode:o}"), "extracted");
        files_written += 1;
    }

    debug!(files = files_written, "archive unpacked");
    Ok(files_written)
}

/// Reject entry paths that are absolute or climb out of the destination.
///
/// The root entry `./` sanitizes to an empty path.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::archive(format!(
                    "entry '{}' escapes the extraction directory",
                    path.display()
                )))
            }
        }
    }
    Ok(clean)
}

#[cfg(unix)]
fn open_target(target: &Path, mode: u32) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode & 0o7777)
        .open(target)
        .map_err(|e| Error::io(e, target))
}

#[cfg(not(unix))]
fn open_target(target: &Path, _mode: u32) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(target)
        .map_err(|e| Error::io(e, target))
}

// The umask may strip bits at creation time, so the declared mode is applied again.
#[cfg(unix)]
fn apply_mode(target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::io(e, target))
}

#[cfg(not(unix))]
fn apply_mode(_target: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Classify the direct file entries of `dir` into an [`OvaInfo`].
fn scan_directory(dir: &Path) -> Result<OvaInfo> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(e, dir))? {
        let entry = entry.map_err(|e| Error::io(e, dir))?;
        let file_type = entry.file_type().map_err(|e| Error::io(e, entry.path()))?;
        if !file_type.is_file() {
            continue;
        }
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    let mut descriptors = Vec::new();
    let mut info = OvaInfo {
        dir: dir.to_path_buf(),
        ..OvaInfo::default()
    };

    for name in names {
        match FileRole::classify(&name) {
            FileRole::Descriptor => descriptors.push(name),
            FileRole::Disk | FileRole::OpticalImage => info.disks.push(name),
            FileRole::Manifest => info.manifest = Some(name),
            FileRole::Certificate | FileRole::Other => {}
        }
    }

    let descriptor = match descriptors.len() {
        1 => descriptors.remove(0),
        0 => {
            return Err(Error::archive(format!(
                "no OVF descriptor found in '{}'",
                dir.display()
            )))
        }
        _ => {
            return Err(Error::archive(format!(
                "several OVF descriptors found in '{}': {}",
                dir.display(),
                descriptors.join(", ")
            )))
        }
    };

    let descriptor_path = dir.join(&descriptor);
    info.ovf = OvfFile {
        data: fs::read_to_string(&descriptor_path).map_err(|e| Error::io(e, &descriptor_path))?,
        file_name: descriptor,
    };

    info!(
        descriptor = %info.ovf.file_name,
        disks = info.disks.len(),
        manifest = info.manifest.is_some(),
        "appliance extracted"
    );
    Ok(info)
}
