//! Connection and import settings.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default timeout for SOAP calls (60 s).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for a single disk or file upload (12000 s).
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(12_000);

/// Default pause between a successful import request and lease observation.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Locale sent with import spec requests.
pub const DEFAULT_LOCALE: &str = "US";

/// How to reach the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Host name or address, optionally with `:port`.
    pub host: String,
    /// URL scheme, `https` unless talking to a test endpoint.
    pub scheme: String,
    /// Accept self-signed and otherwise invalid certificates.
    pub accept_invalid_certs: bool,
    /// vim25 API version announced in the SOAPAction header.
    pub api_version: String,
    /// Timeout for SOAP calls.
    pub request_timeout: Duration,
    /// Timeout for each upload.
    pub upload_timeout: Duration,
}

impl ConnectionConfig {
    /// HTTPS connection to `host` with default timeouts.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scheme: "https".to_string(),
            accept_invalid_certs: true,
            api_version: "7.0".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }

    /// Use plain HTTP, for local endpoints.
    pub fn insecure_http(mut self) -> Self {
        self.scheme = "http".to_string();
        self
    }

    /// `{scheme}://{host}`.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// SOAP endpoint URL.
    pub fn sdk_url(&self) -> String {
        format!("{}/sdk", self.base_url())
    }

    /// Datastore file endpoint URL.
    pub fn folder_url(&self) -> String {
        format!("{}/folder", self.base_url())
    }

    /// Reject values no request could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        if self.host.contains('/') {
            return Err(Error::config(format!(
                "host '{}' must be a name or address, not a URL",
                self.host
            )));
        }
        if self.scheme != "https" && self.scheme != "http" {
            return Err(Error::config(format!("unsupported scheme '{}'", self.scheme)));
        }
        if self.request_timeout.is_zero() || self.upload_timeout.is_zero() {
            return Err(Error::config("timeouts must be greater than zero"));
        }
        Ok(())
    }
}

/// Settings of the import spec builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Locale for host messages.
    pub locale: String,
    /// Pause after `ImportVApp` before the lease is observed.
    pub settle_delay: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            locale: DEFAULT_LOCALE.to_string(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::new("esxi01.lab");
        assert_eq!(config.scheme, "https");
        assert!(config.accept_invalid_certs);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.upload_timeout, Duration::from_secs(12_000));
        assert_eq!(config.sdk_url(), "https://esxi01.lab/sdk");
        assert_eq!(config.folder_url(), "https://esxi01.lab/folder");
    }

    #[test]
    fn test_insecure_http() {
        let config = ConnectionConfig::new("127.0.0.1:8080").insecure_http();
        assert_eq!(config.base_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionConfig::new("esxi01").validate().is_ok());
        assert!(ConnectionConfig::new("").validate().is_err());
        assert!(ConnectionConfig::new("https://esxi01/sdk").validate().is_err());

        let mut config = ConnectionConfig::new("esxi01");
        config.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_import_options_default() {
        let options = ImportOptions::default();
        assert_eq!(options.locale, "US");
        assert_eq!(options.settle_delay, Duration::from_secs(1));
    }
}
