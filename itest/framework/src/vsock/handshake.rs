// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host side of the VMM's `CONNECT` handshake.

use std::{
    io::ErrorKind,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{worker::Connector, VsockError};
use crate::transport::{send_all, ByteStream};

/// The longest reply the VMM sends to a `CONNECT` request.
const MAX_REPLY_LEN: usize = 32;

/// Asks the VMM to forward `stream` to guest port `port`. Returns the host-side
/// port the VMM assigned to the connection.
///
/// The reply must be exactly `OK <digits>\n`; anything else, including the
/// peer closing the connection, fails immediately.
pub fn handshake<S: ByteStream + ?Sized>(
    stream: &mut S,
    port: u32,
) -> Result<u32, VsockError> {
    send_all(stream, format!("CONNECT {port}\n").as_bytes())?;

    // Read a byte at a time so that nothing after the reply's newline is
    // consumed.
    let mut reply = Vec::with_capacity(MAX_REPLY_LEN);
    let mut byte = [0u8; 1];
    while reply.len() < MAX_REPLY_LEN && reply.last() != Some(&b'\n') {
        match stream.recv(&mut byte) {
            Ok(0) => break,
            Ok(_) => reply.push(byte[0]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let reply = String::from_utf8_lossy(&reply).into_owned();
    match parse_ok_reply(&reply) {
        Some(assigned) => {
            debug!(port, assigned, "vsock handshake complete");
            Ok(assigned)
        }
        None => Err(VsockError::Handshake(reply)),
    }
}

/// Matches `^OK [0-9]+\n$`.
fn parse_ok_reply(reply: &str) -> Option<u32> {
    let digits = reply.strip_prefix("OK ")?.strip_suffix('\n')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}

/// Returns a Unix socket connected to guest vsock port `port` through the
/// VMM's vsock socket at `uds_path`.
pub fn connect_to_guest(
    uds_path: impl AsRef<Path>,
    port: u32,
) -> Result<UnixStream, VsockError> {
    let uds_path = uds_path.as_ref();
    let mut stream = UnixStream::connect(uds_path).map_err(|source| {
        VsockError::Connect { path: uds_path.to_path_buf(), source }
    })?;

    handshake(&mut stream, port)?;
    Ok(stream)
}

/// Connects to a listener inside the guest for host-initiated tests.
#[derive(Clone, Debug)]
pub struct GuestPortConnector {
    pub uds_path: PathBuf,
    pub port: u32,
}

impl GuestPortConnector {
    pub fn new(uds_path: impl Into<PathBuf>, port: u32) -> Self {
        Self { uds_path: uds_path.into(), port }
    }
}

impl Connector for GuestPortConnector {
    type Stream = UnixStream;

    fn connect(&self) -> Result<UnixStream, VsockError> {
        connect_to_guest(&self.uds_path, self.port)
    }
}
