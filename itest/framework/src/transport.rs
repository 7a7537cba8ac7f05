// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A bidirectional byte channel abstraction over host-side Unix sockets, guest
//! character devices, and process pipes.

use std::io::{self, ErrorKind, Read, Write};

/// A blocking, bidirectional byte stream.
///
/// Both operations may transfer fewer bytes than requested. Callers that need
/// an exact transfer should use [`send_all`] and [`recv_exact`].
pub trait ByteStream {
    /// Sends some prefix of `buf`, returning the number of bytes sent.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Receives up to `buf.len()` bytes. A return value of 0 means the peer
    /// closed its end of the stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read + Write> ByteStream for T {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Sends all of `buf`, looping over partial sends.
pub fn send_all<S: ByteStream + ?Sized>(
    stream: &mut S,
    mut buf: &[u8],
) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.send(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "stream accepted no bytes",
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Fills all of `buf`, looping over partial receives. Fails with
/// [`ErrorKind::UnexpectedEof`] if the peer closes the stream first.
pub fn recv_exact<S: ByteStream + ?Sized>(
    stream: &mut S,
    buf: &mut [u8],
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.recv(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "stream closed after {filled} of {} bytes",
                        buf.len()
                    ),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
