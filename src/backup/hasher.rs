//! Whole-file content digests used for change detection.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read buffer size; memory use stays constant regardless of file size.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Hex-encoded SHA-256 of the file content, streamed in fixed chunks.
pub fn digest<P: AsRef<Path>>(file_path: P) -> Result<String> {
    let file_path = file_path.as_ref();
    let mut file = File::open(file_path)
        .map_err(Error::from)
        .with_msg(format!("Open {:?} for hashing failed", file_path))?;
    digest_reader(&mut file).with_msg(format!("Hashing {:?} failed", file_path))
}

pub fn digest_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
