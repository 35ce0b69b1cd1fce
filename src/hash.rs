//! Content hashes for comparing compressed artifacts.
//!
//! Two runs with the same seed and stable training must write byte-identical
//! `.ntc` files; the selftest and the `compare` subcommand check that with
//! xxHash64, rendered as 16 lowercase hex digits.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Compute xxHash64 of a file as a hex string.
///
/// Streams the file so large artifacts are not loaded into memory.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;

    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut buf = vec![0u8; 1024 * 1024];
    let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);

    loop {
        let bytes_read = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buf[..bytes_read]);
    }

    Ok(format!("{:016x}", hasher.digest()))
}

/// Hash in-memory data the same way as [`compute_file_hash`]
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh64::xxh64(data, 0))
}

/// Whether two files have identical content hashes
pub fn files_match(a: &Path, b: &Path) -> Result<bool> {
    Ok(compute_file_hash(a)? == compute_file_hash(b)?)
}
