// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A client for the VMM's HTTP API, which is served on a Unix socket inside
//! the jail, and the request/response bodies it exchanges.

use std::{io, path::PathBuf, time::Duration};

use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to connect to API socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("HTTP error talking to the API server: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build API request: {0}")]
    Request(String),

    #[error("failed to encode or decode an API body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl ApiError {
    /// Returns true if the request could not reach the server at all, which
    /// is expected while the VMM is still starting.
    fn is_transient(&self) -> bool {
        matches!(self, ApiError::Connect { .. })
    }
}

/// Issues requests to a VMM's API socket. Each request uses a fresh
/// connection.
#[derive(Clone, Debug)]
pub struct ApiClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
}

/// How long requests keep retrying while the API socket is not yet accepting
/// connections.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

impl ApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    pub async fn put<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(), ApiError> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        self.send(Method::PUT, path, Some(body)).await.map(|_| ())
    }

    pub async fn patch<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(), ApiError> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        self.send(Method::PATCH, path, Some(body)).await.map(|_| ())
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ApiError> {
        let body = self.send(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Sends a request, retrying for a short while if the socket cannot be
    /// connected to yet. Any other error is returned immediately.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, ApiError> {
        let send_fn = || {
            let method = method.clone();
            let body = body.clone();
            async move {
                match self.send_once(method.clone(), path, body).await {
                    Ok(body) => Ok(body),
                    Err(e) if e.is_transient() => {
                        debug!(%e, path, "API socket not ready");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => {
                        warn!(%e, %method, path, "API request failed");
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        };

        backoff::future::retry(
            backoff::ExponentialBackoff {
                max_elapsed_time: Some(self.connect_timeout),
                initial_interval: Duration::from_millis(20),
                ..Default::default()
            },
            send_fn,
        )
        .await
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, ApiError> {
        let stream =
            UnixStream::connect(&self.socket_path).await.map_err(|source| {
                ApiError::Connect { path: self.socket_path.clone(), source }
            })?;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%e, "API connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(format!("http://localhost{path}"))
            .header("Host", "localhost")
            .header("Accept", "application/json");
        let body = match body {
            Some(body) => {
                builder = builder
                    .header("Content-Type", "application/json")
                    .header("Content-Length", body.len());
                body
            }
            None => Bytes::new(),
        };
        let request = builder
            .body(Full::new(body))
            .map_err(|e| ApiError::Request(e.to_string()))?;

        info!(%method, path, "sending API request");
        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(ApiError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(body)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vsock {
    pub guest_cid: u32,
    pub uds_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
    FlushMetrics,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceActionInfo {
    pub action_type: ActionType,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VmState {
    Paused,
    Resumed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmStateChange {
    pub state: VmState,
}

/// The body of `GET /`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,

    /// "Not started", "Running", or "Paused".
    pub state: String,

    #[serde(default)]
    pub vmm_version: String,
}
