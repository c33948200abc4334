//! HTTP uploads to the host.
//!
//! Two paths exist: the lease path, where a disk image is POSTed as a
//! stream-optimized VMDK to a URL granted by the transfer lease, and the
//! datastore path, where any file is PUT below `/folder` addressed by
//! datacenter and datastore name.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Body, Client};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, info};
use url::Url;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::vim::VimSession;

/// Content type of a streamed disk upload.
pub const STREAM_VMDK_CONTENT_TYPE: &str = "application/x-vnd.vmware-streamVmdk";

/// Body text the host returns when the lease path refuses the upload.
pub const CANNOT_POST_MARKER: &str = "Cannot POST";

/// Called with the number of bytes sent so far for the current file.
pub type UploadProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Reader wrapper reporting the running byte count.
struct ProgressReader<R> {
    inner: R,
    sent: u64,
    progress: Option<UploadProgress>,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.sent += n as u64;
        if let Some(progress) = &self.progress {
            progress(self.sent);
        }
        Ok(n)
    }
}

/// Status and full body of a lease upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: StatusCode,
    pub body: String,
}

impl UploadResponse {
    /// The host refused the POST and the file has to go through the
    /// datastore path instead.
    pub fn requests_fallback(&self) -> bool {
        self.body.contains(CANNOT_POST_MARKER)
    }
}

/// Arguments of a datastore file copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFileParams {
    /// Datacenter name, sent as `dcPath`.
    pub dc_name: String,
    /// Datastore name, sent as `dsName`.
    pub ds_name: String,
    /// Local directory holding the file.
    pub local_dir: PathBuf,
    /// Local filename.
    pub file_name: String,
    /// Folder on the datastore, e.g. `/web01`.
    pub remote_dir: String,
    /// Target filename; the local filename when `None`.
    pub remote_file_name: Option<String>,
}

impl CopyFileParams {
    pub fn remote_name(&self) -> &str {
        self.remote_file_name.as_deref().unwrap_or(&self.file_name)
    }

    pub fn local_path(&self) -> PathBuf {
        self.local_dir.join(&self.file_name)
    }
}

/// Uploads files to the host with the session's credentials.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    folder_url: String,
    upload_timeout: Duration,
}

impl fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferClient")
            .field("folder_url", &self.folder_url)
            .field("upload_timeout", &self.upload_timeout)
            .finish()
    }
}

impl TransferClient {
    /// Client with its own cookie store, for hosts that need no session.
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self::with_client(http, config))
    }

    /// Share the session's HTTP client so uploads carry the session cookie.
    pub fn from_session(session: &VimSession) -> Self {
        Self::with_client(session.http_client().clone(), session.config())
    }

    pub fn with_client(http: Client, config: &ConnectionConfig) -> Self {
        Self {
            http,
            folder_url: config.folder_url(),
            upload_timeout: config.upload_timeout,
        }
    }

    /// POST `path` to a lease URL as a stream-optimized disk.
    ///
    /// The response body is read in full; the caller decides from it whether
    /// the fallback path is needed.
    pub fn post_stream_vmdk(
        &self,
        url: &str,
        path: &Path,
        progress: Option<UploadProgress>,
    ) -> Result<UploadResponse> {
        let (body, len) = open_body(path, progress)?;
        let name = display_name(path);
        debug!(url, disk = %name, bytes = len, "posting disk");

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, STREAM_VMDK_CONTENT_TYPE)
            .timeout(self.upload_timeout)
            .body(body)
            .send()
            .map_err(|e| Error::transfer(&name, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| Error::transfer(&name, format!("reading response: {e}")))?;

        debug!(disk = %name, %status, "disk upload answered");
        Ok(UploadResponse { status, body })
    }

    /// PUT a local file into a datastore folder.
    pub fn copy_to_datastore(
        &self,
        params: &CopyFileParams,
        progress: Option<UploadProgress>,
    ) -> Result<()> {
        let url = self.datastore_url(params)?;
        let (body, len) = open_body(&params.local_path(), progress)?;
        info!(file = %params.file_name, url = %url, bytes = len, "copying file to datastore");

        let response = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .timeout(self.upload_timeout)
            .body(body)
            .send()
            .map_err(|e| Error::transfer(&params.file_name, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transfer(
                &params.file_name,
                format!("datastore upload returned HTTP {status}"),
            ));
        }
        Ok(())
    }

    /// `{folder}/{remote_dir}/{remote_name}?dcPath=..&dsName=..`
    pub fn datastore_url(&self, params: &CopyFileParams) -> Result<Url> {
        let mut url = Url::parse(&self.folder_url)
            .map_err(|e| Error::config(format!("invalid folder URL '{}': {e}", self.folder_url)))?;
        url.path_segments_mut()
            .map_err(|()| Error::config(format!("'{}' cannot carry a path", self.folder_url)))?
            .pop_if_empty()
            .extend(params.remote_dir.split('/').filter(|s| !s.is_empty()))
            .push(params.remote_name());
        url.query_pairs_mut()
            .append_pair("dcPath", &params.dc_name)
            .append_pair("dsName", &params.ds_name);
        Ok(url)
    }
}

fn open_body(path: &Path, progress: Option<UploadProgress>) -> Result<(Body, u64)> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let len = file.metadata().map_err(|e| Error::io(e, path))?.len();
    let reader = ProgressReader {
        inner: file,
        sent: 0,
        progress,
    };
    Ok((Body::sized(reader, len), len))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
