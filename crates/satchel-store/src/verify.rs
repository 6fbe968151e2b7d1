// ABOUTME: Checksum computation and artifact verification against recorded catalog metadata.
// ABOUTME: Verification is a pure read: exact SHA-256 and size equality, never a mutation of metadata.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use satchel_core::BackupMetadata;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Stream a file through SHA-256. Returns the digest and the byte count.
pub fn sha256_file(path: &Path) -> Result<(String, u64), std::io::Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

/// Expected versus observed state of an artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub expected_checksum: String,
    pub expected_size: u64,
    /// `None` when the artifact file does not exist.
    pub actual_checksum: Option<String>,
    pub actual_size: Option<u64>,
}

impl VerificationReport {
    pub fn is_match(&self) -> bool {
        self.actual_checksum.as_deref() == Some(self.expected_checksum.as_str())
            && self.actual_size == Some(self.expected_size)
    }

    pub fn is_missing(&self) -> bool {
        self.actual_checksum.is_none()
    }
}

/// Recompute the artifact's checksum and size and compare them to the
/// metadata. A missing artifact is reported, not treated as an I/O failure.
pub fn inspect(path: &Path, metadata: &BackupMetadata) -> Result<VerificationReport, std::io::Error> {
    let (actual_checksum, actual_size) = match sha256_file(path) {
        Ok((checksum, size)) => (Some(checksum), Some(size)),
        Err(e) if e.kind() == ErrorKind::NotFound => (None, None),
        Err(e) => return Err(e),
    };

    Ok(VerificationReport {
        expected_checksum: metadata.checksum.clone(),
        expected_size: metadata.size,
        actual_checksum,
        actual_size,
    })
}

/// True only when the artifact on disk hashes to exactly the recorded
/// checksum and has the recorded size.
pub fn verify(path: &Path, metadata: &BackupMetadata) -> Result<bool, std::io::Error> {
    let report = inspect(path, metadata)?;
    if !report.is_match() {
        tracing::warn!(
            "artifact {} failed verification (expected {} / {} bytes, found {:?} / {:?})",
            path.display(),
            report.expected_checksum,
            report.expected_size,
            report.actual_checksum,
            report.actual_size
        );
    }
    Ok(report.is_match())
}

/// Same comparison as `verify`, over bytes already read into memory. Used by
/// the restorer so the bytes it applies are exactly the bytes it checked.
pub fn verify_bytes(bytes: &[u8], metadata: &BackupMetadata) -> bool {
    bytes.len() as u64 == metadata.size && sha256_hex(bytes) == metadata.checksum
}
