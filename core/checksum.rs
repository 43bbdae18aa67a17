// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! SHA-256 over recording file bytes.

use crate::model::Checksum;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 256 * 1024;

/// Computes the SHA-256 over the full contents of `path`.
///
/// This is only ever called after the driver has closed the file: the implementation reads with a plain blocking `File`
/// rather than an in-progress write handle.
pub fn sha256_file(path: &Path) -> Result<Checksum, base::Error> {
    let mut f = std::fs::File::open(path)?;
    let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    let digest = ctx.finish();
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    Ok(Checksum(out))
}

/// Incremental hasher used by the offload client (local) and the ingest
/// server (as chunks arrive) so the whole file needn't be re-read at
/// `finalize` time.
pub struct IncrementalSha256(ring::digest::Context);

impl Default for IncrementalSha256 {
    fn default() -> Self {
        IncrementalSha256(ring::digest::Context::new(&ring::digest::SHA256))
    }
}

impl IncrementalSha256 {
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> Checksum {
        let digest = self.0.finish();
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        Checksum(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_file_matches_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.bin");
        std::fs::write(&path, b"hello, soccer").unwrap();

        let whole = sha256_file(&path).unwrap();

        let mut inc = IncrementalSha256::default();
        inc.update(b"hello, ");
        inc.update(b"soccer");
        let incremental = inc.finish();

        assert_eq!(whole.0, incremental.0);
    }
}
