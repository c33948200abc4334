//! OVF descriptor inspection.
//!
//! The host parses and validates the descriptor itself; this module only pulls
//! out the parts the import pipeline and the CLI report on: declared networks,
//! file references, disks, deployment options and user-configurable properties.
//! Namespace prefixes are ignored, elements are matched by local name and
//! parent.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

/// A `References/File` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// `ovf:id` of the file.
    pub id: String,
    /// `ovf:href`, the filename inside the archive.
    pub href: String,
    /// `ovf:size` in bytes, when declared.
    pub size: Option<u64>,
}

/// A `DiskSection/Disk` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDisk {
    /// `ovf:diskId`.
    pub disk_id: String,
    /// `ovf:fileRef`, absent for blank disks.
    pub file_ref: Option<String>,
    /// `ovf:capacity` as written (may be an expression such as `${size}`).
    pub capacity: String,
    /// `ovf:capacityAllocationUnits`, e.g. `byte * 2^30`.
    pub capacity_units: Option<String>,
    /// `ovf:format` URI.
    pub format: Option<String>,
}

/// A `ProductSection/Property` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfProperty {
    /// `ovf:key`.
    pub key: String,
    /// `ovf:value`, the default value.
    pub default_value: Option<String>,
}

/// Summary of an OVF descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OvfSummary {
    /// `ovf:id` of the first `VirtualSystem` or `VirtualSystemCollection`.
    pub system_id: Option<String>,
    /// Text of the first `ProductSection/Product`.
    pub product: Option<String>,
    /// Network names from `NetworkSection`.
    pub networks: Vec<String>,
    /// Files listed in `References`.
    pub files: Vec<FileReference>,
    /// Disks listed in `DiskSection`.
    pub disks: Vec<VirtualDisk>,
    /// Configuration ids from `DeploymentOptionSection`.
    pub deployment_options: Vec<String>,
    /// Properties from every `ProductSection`.
    pub properties: Vec<OvfProperty>,
}

impl OvfSummary {
    /// Declared networks that none of the requested port groups will map.
    pub fn unmapped_networks<'a>(&'a self, port_groups: &[String]) -> Vec<&'a str> {
        self.networks
            .iter()
            .filter(|n| !port_groups.iter().any(|pg| pg == *n))
            .map(String::as_str)
            .collect()
    }

    /// Referenced files that are missing from `available`.
    pub fn missing_files<'a>(&'a self, available: &[String]) -> Vec<&'a str> {
        self.files
            .iter()
            .filter(|f| !available.iter().any(|a| a == &f.href))
            .map(|f| f.href.as_str())
            .collect()
    }

    /// Sum of declared file sizes.
    pub fn declared_size(&self) -> u64 {
        self.files.iter().filter_map(|f| f.size).sum()
    }
}

/// Parse descriptor text into an [`OvfSummary`].
///
/// # Errors
///
/// Returns a descriptor error if the text is not well-formed XML or an
/// element the summary needs lacks its identifying attribute.
pub fn inspect_descriptor(text: &str) -> Result<OvfSummary> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut summary = OvfSummary::default();
    let mut stack: Vec<String> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| {
            Error::descriptor(format!(
                "XML error at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                visit_element(&mut summary, stack.last().map(String::as_str), &name, &e)?;
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                visit_element(&mut summary, stack.last().map(String::as_str), &name, &e)?;
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(t) => {
                let in_product = stack.len() >= 2
                    && stack[stack.len() - 1] == "Product"
                    && stack[stack.len() - 2] == "ProductSection";
                if in_product && summary.product.is_none() {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::descriptor(format!("bad Product text: {e}")))?;
                    summary.product = Some(text.into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if summary.system_id.is_none() && summary.files.is_empty() {
        return Err(Error::descriptor("no VirtualSystem or References found"));
    }

    Ok(summary)
}

fn visit_element(
    summary: &mut OvfSummary,
    parent: Option<&str>,
    name: &str,
    element: &BytesStart<'_>,
) -> Result<()> {
    match (parent, name) {
        (_, "VirtualSystem") | (_, "VirtualSystemCollection") => {
            if summary.system_id.is_none() {
                summary.system_id = attribute(element, "id")?;
            }
        }
        (Some("NetworkSection"), "Network") => {
            summary.networks.push(required(element, "name")?);
        }
        (Some("References"), "File") => {
            let size = match attribute(element, "size")? {
                Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                    Error::descriptor(format!("invalid File size '{raw}'"))
                })?),
                None => None,
            };
            summary.files.push(FileReference {
                id: required(element, "id")?,
                href: required(element, "href")?,
                size,
            });
        }
        (Some("DiskSection"), "Disk") => {
            summary.disks.push(VirtualDisk {
                disk_id: required(element, "diskId")?,
                file_ref: attribute(element, "fileRef")?,
                capacity: required(element, "capacity")?,
                capacity_units: attribute(element, "capacityAllocationUnits")?,
                format: attribute(element, "format")?,
            });
        }
        (Some("DeploymentOptionSection"), "Configuration") => {
            summary.deployment_options.push(required(element, "id")?);
        }
        (Some("ProductSection"), "Property") => {
            summary.properties.push(OvfProperty {
                key: required(element, "key")?,
                default_value: attribute(element, "value")?,
            });
        }
        _ => {}
    }
    Ok(())
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

/// Look up an attribute by local name, ignoring its namespace prefix.
fn attribute(element: &BytesStart<'_>, wanted: &str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| Error::descriptor(format!("bad attribute: {e}")))?;
        if attr.key.local_name().as_ref() == wanted.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| Error::descriptor(format!("bad attribute value: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required(element: &BytesStart<'_>, wanted: &str) -> Result<String> {
    attribute(element, wanted)?.ok_or_else(|| {
        Error::descriptor(format!(
            "<{}> is missing attribute '{}'",
            local_name(element),
            wanted
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_networks() {
        let summary = OvfSummary {
            networks: vec!["VM Network".to_string(), "Storage".to_string()],
            ..OvfSummary::default()
        };
        let unmapped = summary.unmapped_networks(&["VM Network".to_string()]);
        assert_eq!(unmapped, vec!["Storage"]);
    }

    #[test]
    fn test_missing_files() {
        let summary = OvfSummary {
            files: vec![
                FileReference {
                    id: "file1".to_string(),
                    href: "disk1.vmdk".to_string(),
                    size: Some(10),
                },
                FileReference {
                    id: "file2".to_string(),
                    href: "disk2.vmdk".to_string(),
                    size: None,
                },
            ],
            ..OvfSummary::default()
        };
        assert_eq!(summary.missing_files(&["disk1.vmdk".to_string()]), vec!["disk2.vmdk"]);
        assert_eq!(summary.declared_size(), 10);
    }

    #[test]
    fn test_rejects_non_descriptor() {
        assert!(inspect_descriptor("<html><body/></html>").is_err());
    }

    #[test]
    fn test_rejects_malformed_xml() {
        assert!(inspect_descriptor("<Envelope><VirtualSystem ovf:id=\"x\"></Envelope>").is_err());
    }
}
