// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-side echo workers. Each worker owns one connection, pushes the blob
//! through it chunk by chunk, and fingerprints what comes back.

use std::{
    fs::File,
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    thread::JoinHandle,
};

use tracing::{debug, error, info_span};

use super::{VsockError, BUF_SIZE};
use crate::{
    fingerprint::{Fingerprint, FingerprintBuilder},
    transport::{recv_exact, send_all, ByteStream},
};

/// Opens the connection an echo worker talks over. Each worker calls
/// `connect` once, from its own thread.
pub trait Connector: Clone + Send + 'static {
    type Stream: ByteStream + Send;

    fn connect(&self) -> Result<Self::Stream, VsockError>;
}

/// The outcome of a single worker's round trip.
#[derive(Debug)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub outcome: Result<Fingerprint, VsockError>,
}

/// Streams the file at `blob_path` through `stream` and returns the
/// fingerprint of the echoed bytes.
///
/// Each chunk is sent in full and then exactly as many bytes are read back
/// before the next chunk is sent.
pub fn pump_blob<S: ByteStream + ?Sized>(
    stream: &mut S,
    blob_path: &Path,
) -> Result<Fingerprint, VsockError> {
    let mut blob = File::open(blob_path).map_err(|source| VsockError::Blob {
        path: blob_path.to_path_buf(),
        source,
    })?;

    let mut builder = FingerprintBuilder::new();
    let mut chunk = vec![0u8; BUF_SIZE];
    let mut echoed = vec![0u8; BUF_SIZE];
    loop {
        let len = match blob.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(VsockError::Blob {
                    path: blob_path.to_path_buf(),
                    source,
                })
            }
        };

        send_all(stream, &chunk[..len])?;
        recv_exact(stream, &mut echoed[..len])?;
        builder.update(&echoed[..len]);
    }

    Ok(builder.finish())
}

/// A round trip running on its own thread.
pub struct EchoWorker {
    id: usize,
    handle: JoinHandle<Result<Fingerprint, VsockError>>,
}

impl EchoWorker {
    /// Spawns a worker that connects with `connector` and pumps the blob at
    /// `blob_path` through the connection.
    pub fn start<C: Connector>(
        id: usize,
        connector: C,
        blob_path: impl Into<PathBuf>,
    ) -> std::io::Result<Self> {
        let blob_path = blob_path.into();
        let span = info_span!("vsock echo worker", worker = id);
        let handle = std::thread::Builder::new()
            .name(format!("vsock-echo-worker-{id}"))
            .spawn(move || {
                let _guard = span.enter();
                let mut stream = connector.connect()?;
                let result = pump_blob(&mut stream, &blob_path);
                match &result {
                    Ok(fingerprint) => debug!(%fingerprint, "worker finished"),
                    Err(e) => error!(%e, "worker failed"),
                }
                result
            })?;

        Ok(Self { id, handle })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Waits for the worker to finish and returns its result.
    pub fn join(self) -> WorkerResult {
        let outcome = match self.handle.join() {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                Err(VsockError::WorkerPanicked(msg))
            }
        };

        WorkerResult { worker_id: self.id, outcome }
    }
}

/// Starts `count` workers, waits for all of them, and returns their results in
/// worker-id order. A worker that cannot be spawned is reported as a failed
/// worker rather than aborting the others.
pub fn run_echo_workers<C: Connector>(
    connector: &C,
    blob_path: &Path,
    count: usize,
) -> Vec<WorkerResult> {
    let mut started = Vec::with_capacity(count);
    let mut results = Vec::with_capacity(count);
    for id in 0..count {
        match EchoWorker::start(id, connector.clone(), blob_path) {
            Ok(worker) => started.push(worker),
            Err(e) => results.push(WorkerResult {
                worker_id: id,
                outcome: Err(VsockError::Transport(e)),
            }),
        }
    }

    results.extend(started.into_iter().map(EchoWorker::join));
    results.sort_by_key(|r| r.worker_id);
    results
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::transport::test_support::ShortLoopback;

    fn write_blob(dir: &Path, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let path = dir.join("blob");
        File::create(&path).unwrap().write_all(&data).unwrap();
        (path, data)
    }

    #[test]
    fn pump_blob_handles_short_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = write_blob(dir.path(), 2 * BUF_SIZE + 1234);

        let mut stream = ShortLoopback::new(1000);
        let fingerprint = pump_blob(&mut stream, &path).unwrap();
        assert_eq!(fingerprint, Fingerprint::of_bytes(&data));
        assert!(stream.sends > 3, "short writes should force resends");
        assert!(stream.recvs > 3, "short reads should force rereads");
    }

    #[test]
    fn pump_blob_of_empty_file_is_empty_digest() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_blob(dir.path(), 0);
        let mut stream = ShortLoopback::new(16);
        assert_eq!(
            pump_blob(&mut stream, &path).unwrap(),
            Fingerprint::of_bytes(&[])
        );
    }

    #[test]
    fn pump_blob_reports_truncated_echo() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_blob(dir.path(), 100);

        // Writes vanish and reads see EOF, so the echo never arrives.
        struct BlackHole;
        impl std::io::Read for BlackHole {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Ok(0)
            }
        }
        impl std::io::Write for BlackHole {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let err = pump_blob(&mut BlackHole, &path).unwrap_err();
        match err {
            VsockError::Transport(e) => {
                assert_eq!(e.kind(), ErrorKind::UnexpectedEof)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_blob_is_a_blob_error() {
        let mut stream = ShortLoopback::new(16);
        let err = pump_blob(&mut stream, Path::new("/nonexistent/blob"))
            .unwrap_err();
        assert!(matches!(err, VsockError::Blob { .. }));
    }
}
