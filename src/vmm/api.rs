//! Cloud Hypervisor REST API over its per-VM Unix socket.
//!
//! Only three endpoints are consumed: `vm.shutdown` and `vm.power-button`
//! (PUT, expect 204) and `vm.info` (GET, returns the console/serial PTY
//! paths). Transient failures (connection errors, 5xx, 429) retry with
//! bounded exponential backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, Uri as UnixUri};
use serde::Deserialize;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// API response with an unexpected status code.
#[derive(Debug, Error)]
#[error("{method} {path} -> {status}: {body}")]
pub struct ApiError {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub body: String,
}

/// Transient errors retry: connection-level failures always, HTTP errors
/// on 5xx and 429. Anything else is terminal.
fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<ApiError>() {
        Some(api) => api.status.is_server_error() || api.status == StatusCode::TOO_MANY_REQUESTS,
        None => true,
    }
}

pub struct VmmClient {
    socket_path: PathBuf,
    client: Client<hyperlocal::UnixConnector>,
}

impl VmmClient {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            client: Client::unix(),
        }
    }

    /// Asks the VMM to shut the guest down and flush disk backends.
    pub async fn shutdown(&self) -> Result<()> {
        self.put_with_retry("/api/v1/vm.shutdown").await
    }

    /// Sends an ACPI power-button event to the guest.
    pub async fn power_button(&self) -> Result<()> {
        self.put_with_retry("/api/v1/vm.power-button").await
    }

    /// Fetches the PTY path of the virtio console (direct boot) or the
    /// serial device (UEFI), whichever the VMM allocated.
    pub async fn console_pty(&self) -> Result<Option<PathBuf>> {
        let body = self.get_with_retry("/api/v1/vm.info").await?;
        let info: VmInfoResponse =
            serde_json::from_slice(&body).context("decode vm.info response")?;
        let path = info
            .config
            .console
            .and_then(|c| c.file)
            .or(info.config.serial.and_then(|s| s.file));
        Ok(path.map(PathBuf::from))
    }

    async fn put_with_retry(&self, path: &str) -> Result<()> {
        self.with_retry(|| self.do_request(Method::PUT, path, StatusCode::NO_CONTENT))
            .await
            .map(|_| ())
    }

    async fn get_with_retry(&self, path: &str) -> Result<Vec<u8>> {
        self.with_retry(|| self.do_request(Method::GET, path, StatusCode::OK))
            .await
    }

    async fn with_retry<F, Fut>(&self, mut op: F) -> Result<Vec<u8>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>>>,
    {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match op().await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    if !is_retryable(&e) {
                        return Err(e);
                    }
                    last_err = Some(e);
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }

    async fn do_request(
        &self,
        method: Method,
        path: &str,
        expect: StatusCode,
    ) -> Result<Vec<u8>> {
        let uri: hyper::Uri = UnixUri::new(&self.socket_path, path).into();
        let req = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(Body::empty())
            .context("build request")?;

        let resp = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| anyhow::anyhow!("{method} {path} timed out after {REQUEST_TIMEOUT:?}"))?
            .with_context(|| format!("{method} {path}"))?;

        let status = resp.status();
        let body = hyper::body::to_bytes(resp.into_body())
            .await
            .with_context(|| format!("{method} {path} read body"))?;
        if status != expect {
            return Err(ApiError {
                method,
                path: path.to_string(),
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            }
            .into());
        }
        Ok(body.to_vec())
    }
}

#[derive(Debug, Deserialize)]
struct VmInfoResponse {
    #[serde(default)]
    config: VmInfoConfig,
}

#[derive(Debug, Default, Deserialize)]
struct VmInfoConfig {
    #[serde(default)]
    console: Option<DeviceFile>,
    #[serde(default)]
    serial: Option<DeviceFile>,
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    #[serde(default)]
    file: Option<String>,
}
