//! Dropbox content hash.
//!
//! The file is split into 4 MiB blocks, each block is hashed with SHA-256 and
//! the concatenated block digests are hashed once more. The hex encoding of the
//! outer digest is what the API reports as `content_hash`.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// Streaming hasher; feed bytes with [`update`](Self::update).
#[derive(Clone, Default)]
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = data.len().min(BLOCK_SIZE - self.block_len);
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];
            if self.block_len == BLOCK_SIZE {
                self.flush_block();
            }
        }
    }

    pub fn finalize(mut self) -> String {
        // An exact multiple of the block size leaves no trailing block.
        if self.block_len > 0 {
            self.flush_block();
        }
        format!("{:x}", self.overall.finalize())
    }

    fn flush_block(&mut self) {
        let digest = std::mem::take(&mut self.block).finalize();
        self.overall.update(digest);
        self.block_len = 0;
    }
}

pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = ContentHasher::new();
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

#[cfg(test)]
fn fold_block_digests(digests: &[[u8; 32]]) -> String {
    let mut overall = Sha256::new();
    for digest in digests {
        overall.update(digest);
    }
    format!("{:x}", overall.finalize())
}
