// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Round-trip verification of a VM's vsock device.
//!
//! The VMM exposes a guest's vsock namespace to the host through Unix domain
//! sockets:
//!
//! - Host-initiated connections connect to the device's `uds_path` and perform
//!   a `CONNECT <port>` handshake to reach a listener inside the guest.
//! - Guest-initiated connections to host port `P` are forwarded by the VMM to a
//!   Unix socket at `<uds_path>_<P>`, on which a host-side server listens.
//!
//! Either way, a random [`Blob`] is pushed through an echo service on the far
//! side and the echoed bytes are fingerprinted; every fingerprint must match
//! the blob's.

use std::path::{Path, PathBuf};

use thiserror::Error;

mod blob;
mod check;
mod handshake;
mod server;
mod worker;

pub use blob::Blob;
pub use check::{
    check_guest_connections, check_host_connections, check_vsock_device,
    check_vsock_device_with_blob_size, guest_worker_script,
    verify_worker_results, RoundTripError,
};
pub use handshake::{connect_to_guest, handshake, GuestPortConnector};
pub use server::{EchoServer, EchoServerError};
pub use worker::{
    pump_blob, run_echo_workers, Connector, EchoWorker, WorkerResult,
};

/// The guest port on which the guest echo service listens, and the host port
/// guest workers connect to.
pub const ECHO_SERVER_PORT: u32 = 5252;

/// The accept backlog of the host echo server's listening socket.
pub const SERVER_ACCEPT_BACKLOG: i32 = 128;

/// The number of concurrent connections each scenario opens.
pub const TEST_CONNECTION_COUNT: usize = 50;

/// The default size of the transferred blob.
pub const BLOB_SIZE: usize = 20 * 1024 * 1024;

/// The chunk size used for every read and write in the protocol.
pub const BUF_SIZE: usize = 64 * 1024;

/// The vsock device's Unix socket, relative to the VMM's jail root.
pub const VSOCK_UDS_PATH: &str = "v.sock";

/// Where the blob is placed inside the guest.
pub const GUEST_BLOB_PATH: &str = "/tmp/vsock/test.blob";

/// Errors from a single vsock connection.
#[derive(Debug, Error)]
pub enum VsockError {
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vsock handshake rejected: unexpected reply {0:?}")]
    Handshake(String),

    #[error("failed to open blob {path}: {source}")]
    Blob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),
}

/// Builds the path of the Unix socket the VMM connects to when the guest opens
/// a connection to host port `port`.
pub fn host_port_path(uds_path: impl AsRef<Path>, port: u32) -> PathBuf {
    let mut path = uds_path.as_ref().as_os_str().to_owned();
    path.push(format!("_{port}"));
    PathBuf::from(path)
}
