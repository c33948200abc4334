//! OVA manifest (`.mf`) parsing and verification.
//!
//! Manifest lines have the form `SHA256(disk1.vmdk)= <hex digest>`. Only
//! SHA256 digests are checked; entries using other algorithms are reported
//! back as unverified.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A single `ALGO(file)= digest` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Digest algorithm as written, e.g. `SHA256` or `SHA1`.
    pub algorithm: String,
    /// File the digest applies to.
    pub file_name: String,
    /// Lowercase hexadecimal digest.
    pub digest: String,
}

/// Outcome of checking a manifest against extracted files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestReport {
    /// Files whose SHA256 digest matched.
    pub verified: Vec<String>,
    /// Files listed with an algorithm this tool does not check.
    pub unverified: Vec<String>,
}

/// Parse manifest text.
pub fn parse_manifest(content: &str) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let malformed = || Error::manifest(format!("line {}: malformed entry '{}'", line_no + 1, line));

        let open = line.find('(').ok_or_else(malformed)?;
        let close = line.rfind(")=").ok_or_else(malformed)?;
        if close <= open {
            return Err(malformed());
        }

        let algorithm = line[..open].trim();
        let file_name = &line[open + 1..close];
        let digest = line[close + 2..].trim();

        if algorithm.is_empty() || file_name.is_empty() || digest.is_empty() {
            return Err(malformed());
        }
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed());
        }

        entries.push(ManifestEntry {
            algorithm: algorithm.to_string(),
            file_name: file_name.to_string(),
            digest: digest.to_ascii_lowercase(),
        });
    }

    Ok(entries)
}

/// Compute the SHA256 digest of a file as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| Error::io(e, path))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify the manifest `manifest_name` inside `dir` against the files next to it.
///
/// # Errors
///
/// Fails if the manifest cannot be read or parsed, a listed file is missing,
/// or a SHA256 digest does not match.
pub fn verify_manifest(dir: &Path, manifest_name: &str) -> Result<ManifestReport> {
    let manifest_path = dir.join(manifest_name);
    let content = fs::read_to_string(&manifest_path).map_err(|e| Error::io(e, &manifest_path))?;
    let entries = parse_manifest(&content)?;

    let mut report = ManifestReport::default();

    for entry in entries {
        if !stays_inside(&entry.file_name) {
            return Err(Error::manifest(format!(
                "'{}' points outside the manifest directory",
                entry.file_name
            )));
        }

        if !entry.algorithm.eq_ignore_ascii_case("SHA256") {
            warn!(file = %entry.file_name, algorithm = %entry.algorithm, "digest not verified");
            report.unverified.push(entry.file_name);
            continue;
        }

        let path = dir.join(&entry.file_name);
        if !path.is_file() {
            return Err(Error::manifest(format!(
                "'{}' is listed but was not extracted",
                entry.file_name
            )));
        }

        let actual = sha256_file(&path)?;
        if actual != entry.digest {
            return Err(Error::manifest(format!(
                "SHA256 mismatch for '{}': expected {}, got {}",
                entry.file_name, entry.digest, actual
            )));
        }

        debug!(file = %entry.file_name, "digest verified");
        report.verified.push(entry.file_name);
    }

    Ok(report)
}

/// Only plain relative names below the manifest directory are checked.
fn stays_inside(file_name: &str) -> bool {
    Path::new(file_name)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}
