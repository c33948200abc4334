//! VMDK header probing.
//!
//! The lease transfer endpoint accepts stream-optimized disks only. Probing
//! the first sector lets the orchestrator warn before it streams a disk the
//! host is likely to refuse.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

/// VMDK magic number ("KDMV" on disk, little-endian u32).
pub const VMDK_MAGIC: u32 = 0x564D444B;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

const FLAG_COMPRESSED: u32 = 1 << 16;
const FLAG_MARKERS: u32 = 1 << 17;

/// Layout of a disk image as seen from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    /// Sparse extent with compressed grains and markers.
    StreamOptimized {
        /// Virtual capacity in bytes.
        capacity_bytes: u64,
    },
    /// Hosted sparse extent (monolithicSparse and friends).
    Sparse {
        /// Virtual capacity in bytes.
        capacity_bytes: u64,
    },
    /// No sparse header: a text descriptor, flat extent or foreign format.
    Raw,
}

impl DiskFormat {
    /// Whether the lease endpoint can take this image as-is.
    pub fn is_stream_optimized(&self) -> bool {
        matches!(self, DiskFormat::StreamOptimized { .. })
    }
}

/// Fields of the sparse extent header the probe needs.
#[derive(Debug, Clone, Copy)]
struct SparseHeader {
    version: u32,
    flags: u32,
    capacity_sectors: u64,
}

impl SparseHeader {
    /// Parse the header from the first sector, `None` if the magic is absent.
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 20 {
            return None;
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != VMDK_MAGIC {
            return None;
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let flags = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let capacity_sectors = u64::from_le_bytes([
            data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
        ]);
        Some(Self {
            version,
            flags,
            capacity_sectors,
        })
    }

    fn is_stream_optimized(&self) -> bool {
        self.version >= 3 && self.flags & FLAG_COMPRESSED != 0 && self.flags & FLAG_MARKERS != 0
    }
}

/// Classify a disk image from its first sector.
pub fn probe_disk(path: &Path) -> Result<DiskFormat> {
    let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut sector = Vec::with_capacity(SECTOR_SIZE as usize);
    file.by_ref()
        .take(SECTOR_SIZE)
        .read_to_end(&mut sector)
        .map_err(|e| Error::io(e, path))?;

    Ok(classify_header(&sector))
}

/// A header whose capacity does not fit in a `u64` byte count is not a
/// sparse extent header; such images classify as [`DiskFormat::Raw`].
fn classify_header(sector: &[u8]) -> DiskFormat {
    let Some(header) = SparseHeader::from_bytes(sector) else {
        return DiskFormat::Raw;
    };
    let Some(capacity_bytes) = header.capacity_sectors.checked_mul(SECTOR_SIZE) else {
        return DiskFormat::Raw;
    };
    if header.is_stream_optimized() {
        DiskFormat::StreamOptimized { capacity_bytes }
    } else {
        DiskFormat::Sparse { capacity_bytes }
    }
}
