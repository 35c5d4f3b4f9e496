//! SSH public key helpers.
//!
//! Keys arrive from the transport as raw wire-format bytes
//! (`string algorithm || key data`). The identity API wants the OpenSSH text
//! form and the logs want a fingerprint.

use base64::Engine;
use sha2::{Digest, Sha256};

/// Read the algorithm name from the leading SSH string of a wire-format key.
pub fn key_algorithm(raw: &[u8]) -> Option<&str> {
    let len_bytes: [u8; 4] = raw.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = raw.get(4..4usize.checked_add(len)?)?;
    let name = std::str::from_utf8(name).ok()?;
    if name.is_empty() || !name.is_ascii() {
        return None;
    }
    Some(name)
}

/// Render a wire-format key as `"<algorithm> <base64>"`.
///
/// Returns `None` when the bytes do not start with a readable algorithm name.
pub fn to_openssh(raw: &[u8]) -> Option<String> {
    let algorithm = key_algorithm(raw)?;
    let data = base64::engine::general_purpose::STANDARD.encode(raw);
    Some(format!("{} {}", algorithm, data))
}

/// SHA256 fingerprint in the `SHA256:...` form printed by `ssh-keygen -l`.
pub fn fingerprint(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}
