// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rand::RngCore;
use tracing::{info, warn};

use crate::fingerprint::{Fingerprint, FingerprintBuilder};

const BLOB_FILE_NAME: &str = "vsock-test.blob";
const FILL_CHUNK_SIZE: usize = 4096;

/// A file of random bytes used as the transfer test vector. The file is
/// removed when the blob is dropped.
#[derive(Debug)]
pub struct Blob {
    path: PathBuf,
    size: usize,
    fingerprint: Fingerprint,
}

impl Blob {
    /// Writes `size` random bytes to a new blob file in `dir`, hashing them as
    /// they are generated.
    pub fn create(dir: impl AsRef<Path>, size: usize) -> Result<Self> {
        let path = dir.as_ref().join(BLOB_FILE_NAME);
        let file = File::create(&path)
            .with_context(|| format!("creating blob file {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        let mut rng = rand::thread_rng();
        let mut builder = FingerprintBuilder::new();
        let mut chunk = [0u8; FILL_CHUNK_SIZE];
        let mut left = size;
        while left > 0 {
            let count = left.min(FILL_CHUNK_SIZE);
            rng.fill_bytes(&mut chunk[..count]);
            builder.update(&chunk[..count]);
            writer.write_all(&chunk[..count])?;
            left -= count;
        }

        writer
            .flush()
            .with_context(|| format!("flushing blob file {}", path.display()))?;

        let fingerprint = builder.finish();
        info!(path = %path.display(), size, %fingerprint, "created vsock blob");
        Ok(Self { path, size, fingerprint })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %e, "failed to remove blob");
        }
    }
}
