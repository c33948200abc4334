//! Connection profile loaded from a TOML file.
//!
//! Command-line flags and environment variables override profile values.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Settings shared by every command that talks to a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    /// Host name or address.
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Require a valid TLS certificate.
    pub verify_tls: bool,
    /// vim25 API version for the SOAPAction header.
    pub api_version: Option<String>,
    /// Upload timeout in seconds.
    pub upload_timeout_secs: Option<u64>,
    /// Default placement for deployments.
    pub deploy: DeployDefaults,
}

/// Placement and shape defaults for `deploy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployDefaults {
    pub datastore: Option<String>,
    pub resource_pool: Option<String>,
    pub host_system: Option<String>,
    pub networks: Vec<String>,
    pub disk_provisioning: Option<String>,
    /// OVF property values applied to every deployment.
    pub properties: BTreeMap<String, String>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse profile {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_profile() {
        let profile = Profile::parse(
            r#"
            host = "esxi01.lab"
            user = "root"
            verify_tls = true
            upload_timeout_secs = 600

            [deploy]
            datastore = "datastore1"
            networks = ["VM Network"]
            disk_provisioning = "thin"

            [deploy.properties]
            "guestinfo.hostname" = "web01"
            "#,
        )
        .unwrap();

        assert_eq!(profile.host.as_deref(), Some("esxi01.lab"));
        assert_eq!(profile.password, None);
        assert!(profile.verify_tls);
        assert_eq!(profile.upload_timeout_secs, Some(600));
        assert_eq!(profile.deploy.datastore.as_deref(), Some("datastore1"));
        assert_eq!(profile.deploy.networks, vec!["VM Network".to_string()]);
        assert_eq!(
            profile.deploy.properties.get("guestinfo.hostname").map(String::as_str),
            Some("web01")
        );
    }

    #[test]
    fn test_empty_profile() {
        assert_eq!(Profile::parse("").unwrap(), Profile::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Profile::parse("hots = \"typo\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Profile::load(Path::new("/nonexistent/ovadeploy.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read profile"));
    }
}
