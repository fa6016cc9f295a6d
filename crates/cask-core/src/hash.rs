use std::io::Read;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Read buffer for streaming hashes.
pub const HASH_BUF_SIZE: usize = 64 * 1024;

/// Default rollover size for block signatures.
pub const SIGNATURE_BLOCK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DigestEncoding {
    #[default]
    Hex,
    Base64,
}

impl DigestEncoding {
    fn encode(self, digest: &[u8]) -> String {
        match self {
            DigestEncoding::Hex => hex::encode(digest),
            DigestEncoding::Base64 => STANDARD.encode(digest),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HashOptions {
    pub encoding: DigestEncoding,
    /// Also emit per-block SHA-1 checksums.
    pub signature: bool,
    pub block_size: usize,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self {
            encoding: DigestEncoding::Hex,
            signature: false,
            block_size: SIGNATURE_BLOCK_SIZE,
        }
    }
}

/// One block of a rolling signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    pub offset: u64,
    pub size: u32,
    pub checksum: String,
}

/// Stream `reader` through SHA-256, optionally collecting SHA-1 block
/// signatures that roll over every `block_size` bytes. The final incomplete
/// block, if non-empty, is emitted too. The reader is consumed but not
/// closed here; pass ownership or a `&mut` borrow as appropriate.
pub fn hash_reader<R: Read>(
    mut reader: R,
    opts: &HashOptions,
) -> Result<(String, Option<Vec<SignatureBlock>>)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    let mut blocks: Option<Vec<SignatureBlock>> = opts.signature.then(Vec::new);
    let mut block_hasher = Sha1::new();
    let mut block_fill: usize = 0;
    let mut block_offset: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);

        if let Some(blocks) = blocks.as_mut() {
            // A 64 KiB read spans several signature blocks; feed sub-slices.
            let mut chunk = &buf[..n];
            while !chunk.is_empty() {
                let room = opts.block_size - block_fill;
                let take = room.min(chunk.len());
                block_hasher.update(&chunk[..take]);
                block_fill += take;
                chunk = &chunk[take..];

                if block_fill == opts.block_size {
                    let digest = std::mem::take(&mut block_hasher).finalize();
                    blocks.push(SignatureBlock {
                        offset: block_offset,
                        size: block_fill as u32,
                        checksum: opts.encoding.encode(&digest),
                    });
                    block_offset += block_fill as u64;
                    block_fill = 0;
                }
            }
        }
    }

    if let Some(blocks) = blocks.as_mut() {
        if block_fill > 0 {
            let digest = std::mem::take(&mut block_hasher).finalize();
            blocks.push(SignatureBlock {
                offset: block_offset,
                size: block_fill as u32,
                checksum: opts.encoding.encode(&digest),
            });
        }
    }

    Ok((opts.encoding.encode(&hasher.finalize()), blocks))
}

/// Hash a file by path; the file handle is opened and closed internally.
pub fn hash_file(path: &Path, opts: &HashOptions) -> Result<(String, Option<Vec<SignatureBlock>>)> {
    let file = std::fs::File::open(path)?;
    hash_reader(file, opts)
}
