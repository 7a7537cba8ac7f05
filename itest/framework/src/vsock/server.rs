// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A host-side echo server for guest-initiated vsock connections.

use std::{
    io::{self, ErrorKind, Read, Write},
    os::{
        fd::AsRawFd,
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{BUF_SIZE, SERVER_ACCEPT_BACKLOG};

/// How long a single readiness wait may block before the stop flag is checked
/// again.
const POLL_TIMEOUT_MS: libc::c_int = 1000;

/// Faults raised inside the server's background thread. These are recorded
/// when the thread exits and returned from [`EchoServer::stop`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EchoServerError {
    #[error("echo server loop failed: {0}")]
    Internal(String),

    #[error("echo server thread panicked: {0}")]
    Panicked(String),

    #[error("echo server was already started")]
    AlreadyStarted,
}

enum ServerState {
    /// Listening, but no connections are being accepted yet.
    Bound(UnixListener),

    Running {
        stop: Arc<AtomicBool>,
        thread: JoinHandle<io::Result<()>>,
    },

    /// The background thread has exited; carries its outcome.
    Stopped(Result<(), EchoServerError>),
}

/// Accepts connections on a Unix socket and echoes back everything each
/// connection sends until stopped.
///
/// All connections are serviced from one background thread that waits for
/// readiness on the listener and every open connection at once. Connections
/// are non-blocking: a peer that stops reading only holds up its own echo,
/// never the other connections or [`Self::stop`].
pub struct EchoServer {
    path: PathBuf,
    state: ServerState,
}

impl EchoServer {
    /// Binds a listening socket at `path`. The socket is listening as soon as
    /// this returns, but connections are only serviced after [`Self::start`].
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let listener = UnixListener::bind(&path)?;

        // Re-issue listen(2) to pin the accept backlog.
        let ret =
            unsafe { libc::listen(listener.as_raw_fd(), SERVER_ACCEPT_BACKLOG) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        info!(path = %path.display(), "echo server listening");
        Ok(Self { path, state: ServerState::Bound(listener) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts servicing connections on a background thread and returns
    /// immediately.
    pub fn start(&mut self) -> Result<(), EchoServerError> {
        self.launch(|listener, stop| {
            std::thread::Builder::new()
                .name("vsock-echo-server".to_string())
                .spawn(move || serve(listener, &stop))
        })
    }

    fn launch<F>(&mut self, spawn: F) -> Result<(), EchoServerError>
    where
        F: FnOnce(
            UnixListener,
            Arc<AtomicBool>,
        ) -> io::Result<JoinHandle<io::Result<()>>>,
    {
        let listener = match std::mem::replace(
            &mut self.state,
            ServerState::Stopped(Err(EchoServerError::AlreadyStarted)),
        ) {
            ServerState::Bound(listener) => listener,
            other => {
                self.state = other;
                return Err(EchoServerError::AlreadyStarted);
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        match spawn(listener, Arc::clone(&stop)) {
            Ok(thread) => {
                self.state = ServerState::Running { stop, thread };
                Ok(())
            }
            Err(e) => {
                // The listener went down with the failed spawn.
                let fault = EchoServerError::Internal(format!(
                    "spawning the server thread: {e}"
                ));
                self.state = ServerState::Stopped(Err(fault.clone()));
                Err(fault)
            }
        }
    }

    /// Stops the server, waits for its background thread to exit, and removes
    /// the socket path. Returns any fault the background thread hit.
    ///
    /// Calling this again after the server has stopped returns the same
    /// outcome and does nothing else. The stop flag is checked once per poll
    /// interval, so this can block for up to a second.
    pub fn stop(&mut self) -> Result<(), EchoServerError> {
        let outcome = match std::mem::replace(
            &mut self.state,
            ServerState::Stopped(Ok(())),
        ) {
            ServerState::Bound(listener) => {
                drop(listener);
                Ok(())
            }
            ServerState::Running { stop, thread } => {
                stop.store(true, Ordering::Release);
                match thread.join() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(EchoServerError::Internal(e.to_string())),
                    Err(payload) => Err(EchoServerError::Panicked(
                        payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_default(),
                    )),
                }
            }
            ServerState::Stopped(outcome) => outcome,
        };

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), %e, "failed to remove echo server socket");
            }
        }

        if let Err(e) = &outcome {
            error!(%e, "echo server stopped with a fault");
        }

        self.state = ServerState::Stopped(outcome.clone());
        outcome
    }

    /// Returns the fault recorded when the server stopped, if any.
    pub fn fault(&self) -> Option<&EchoServerError> {
        match &self.state {
            ServerState::Stopped(Err(e)) => Some(e),
            _ => None,
        }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        if !matches!(self.state, ServerState::Stopped(_)) {
            let _ = self.stop();
        }
    }
}

/// One accepted connection and the echo it still owes its peer.
struct Connection {
    stream: UnixStream,
    pending: Vec<u8>,
    sent: usize,
}

enum Progress {
    Open,
    Closed,
}

impl Connection {
    fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream, pending: Vec::with_capacity(BUF_SIZE), sent: 0 })
    }

    fn draining(&self) -> bool {
        self.sent < self.pending.len()
    }

    /// Nothing more is read until the previous echo has been written out.
    fn interest(&self) -> libc::c_short {
        if self.draining() {
            libc::POLLOUT
        } else {
            libc::POLLIN
        }
    }

    /// Reads one chunk if no echo is outstanding, then writes as much of the
    /// outstanding echo as the socket accepts without blocking.
    fn service(&mut self, buf: &mut [u8]) -> io::Result<Progress> {
        if !self.draining() {
            match self.stream.read(buf) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => {
                    self.pending.clear();
                    self.pending.extend_from_slice(&buf[..n]);
                    self.sent = 0;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(Progress::Open)
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    warn!(%e, "connection reset by peer");
                    return Ok(Progress::Closed);
                }
                Err(e) => return Err(e),
            }
        }

        while self.draining() {
            match self.stream.write(&self.pending[self.sent..]) {
                Ok(0) => {
                    warn!("peer accepted no bytes of its echo");
                    return Ok(Progress::Closed);
                }
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(%e, "peer went away before its echo was sent");
                    return Ok(Progress::Closed);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Progress::Open)
    }
}

fn serve(listener: UnixListener, stop: &AtomicBool) -> io::Result<()> {
    let mut conns: Vec<Connection> = Vec::new();
    let mut buf = vec![0u8; BUF_SIZE];

    while !stop.load(Ordering::Acquire) {
        let mut fds: Vec<libc::pollfd> = conns
            .iter()
            .map(|c| libc::pollfd {
                fd: c.stream.as_raw_fd(),
                events: c.interest(),
                revents: 0,
            })
            .chain(std::iter::once(libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }))
            .collect();
        let listener_idx = fds.len() - 1;

        let ready = unsafe {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
        };
        if ready < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        let mut closed = Vec::new();
        for (idx, pfd) in fds.iter().enumerate() {
            if pfd.revents == 0 {
                continue;
            }

            if idx == listener_idx {
                match listener.accept() {
                    Ok((stream, _)) => {
                        conns.push(Connection::new(stream)?);
                        debug!(clients = conns.len(), "accepted connection");
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        debug!(%e, "ignoring failed accept");
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            if let Progress::Closed = conns[idx].service(&mut buf)? {
                closed.push(idx);
            }
        }

        // `closed` is in ascending order, so removing from the back keeps the
        // remaining indices valid.
        for idx in closed.into_iter().rev() {
            conns.remove(idx);
        }
    }

    debug!(open = conns.len(), "echo server loop exiting");
    Ok(())
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::transport::recv_exact;

    #[test]
    fn echoes_on_concurrent_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let mut server = EchoServer::bind(&path).unwrap();
        server.start().unwrap();

        let mut a = UnixStream::connect(&path).unwrap();
        let mut b = UnixStream::connect(&path).unwrap();
        a.write_all(b"hello from a").unwrap();
        b.write_all(b"and from b").unwrap();

        let mut from_b = [0u8; 10];
        recv_exact(&mut b, &mut from_b).unwrap();
        assert_eq!(&from_b, b"and from b");

        let mut from_a = [0u8; 12];
        recv_exact(&mut a, &mut from_a).unwrap();
        assert_eq!(&from_a, b"hello from a");

        drop(a);
        drop(b);
        assert_eq!(server.stop(), Ok(()));
        assert!(server.fault().is_none());
    }

    #[test]
    fn stop_is_idempotent_and_removes_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let mut server = EchoServer::bind(&path).unwrap();
        server.start().unwrap();
        assert!(path.exists());

        assert_eq!(server.stop(), Ok(()));
        assert!(!path.exists());
        assert_eq!(server.stop(), Ok(()));
        assert!(!path.exists());
        assert!(UnixStream::connect(&path).is_err());
    }

    #[test]
    fn stopping_an_unstarted_server_removes_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let mut server = EchoServer::bind(&path).unwrap();
        assert_eq!(server.stop(), Ok(()));
        assert!(!path.exists());
        assert_eq!(server.start(), Err(EchoServerError::AlreadyStarted));
    }

    #[test]
    fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = EchoServer::bind(dir.path().join("echo.sock")).unwrap();
        server.start().unwrap();
        assert_eq!(server.start(), Err(EchoServerError::AlreadyStarted));
        assert_eq!(server.stop(), Ok(()));
    }

    #[test]
    fn stalled_reader_does_not_hold_up_other_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let mut server = EchoServer::bind(&path).unwrap();
        server.start().unwrap();

        // This client writes far more than the socket buffers hold and never
        // reads its echo back. Its writes fail once the server goes away.
        let mut stalled = UnixStream::connect(&path).unwrap();
        let flood = std::thread::spawn(move || {
            let chunk = vec![0x5a_u8; 64 * 1024];
            for _ in 0..64 {
                if stalled.write_all(&chunk).is_err() {
                    break;
                }
            }
        });
        std::thread::sleep(Duration::from_millis(500));

        let mut other = UnixStream::connect(&path).unwrap();
        other.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        other.write_all(b"ping").unwrap();
        let mut echo = [0u8; 4];
        recv_exact(&mut other, &mut echo).unwrap();
        assert_eq!(&echo, b"ping");

        let begin = Instant::now();
        assert_eq!(server.stop(), Ok(()));
        assert!(begin.elapsed() < Duration::from_secs(3), "{:?}", begin.elapsed());
        flood.join().unwrap();
    }

    #[test]
    fn failed_spawn_is_recorded_as_the_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let mut server = EchoServer::bind(&path).unwrap();

        let err = server
            .launch(|_, _| Err(io::Error::new(ErrorKind::Other, "no threads")))
            .unwrap_err();
        assert!(
            matches!(&err, EchoServerError::Internal(msg) if msg.contains("no threads")),
            "{err:?}"
        );
        assert_eq!(server.fault(), Some(&err));
        assert_eq!(server.stop(), Err(err));
        assert!(!path.exists());
    }

    #[test]
    fn dropping_a_running_server_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        {
            let mut server = EchoServer::bind(&path).unwrap();
            server.start().unwrap();
        }
        assert!(!path.exists());
    }
}
