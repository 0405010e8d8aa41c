//! Checksum calculation for migration content

use sha2::{Digest, Sha256};

/// Calculate the SHA-256 checksum of a migration's content.
///
/// The digest is the migration's identity in the ledger: stable and
/// deterministic for identical text, different for any edit. It is used to
/// detect drift between the content recorded at apply time and the content
/// supplied on a later run.
#[must_use]
pub fn checksum_of(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
