//! SHA256 content digest utilities
//!
//! Digests are content-addressed identifiers of the form `sha256:<hex>` used
//! for blobs and manifests throughout the registry API.

use crate::error::{RegscanError, Result};
use sha2::Digest;

/// Blob sum of the well-known empty layer. Empty layers are filtered out
/// before any scan; scanning them never contributes vulnerabilities.
pub const EMPTY_LAYER_BLOB_SUM: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// Utilities for working with sha256 digests.
pub struct DigestUtils;

impl DigestUtils {
    /// Compute a full `sha256:<hex>` digest over the given bytes.
    pub fn compute_digest(data: &[u8]) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    /// Validate a 64-character hex string.
    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Validate a full `sha256:<hex>` digest.
    pub fn is_valid_digest(digest: &str) -> bool {
        match digest.strip_prefix("sha256:") {
            Some(hex_part) => Self::is_valid_sha256_hex(hex_part),
            None => false,
        }
    }

    /// Parse a digest, requiring the full `sha256:<hex>` form.
    pub fn parse(digest: &str) -> Result<String> {
        if Self::is_valid_digest(digest) {
            Ok(digest.to_string())
        } else {
            Err(RegscanError::Parse(format!("invalid digest: {:?}", digest)))
        }
    }

    /// Whether a digest names the well-known empty layer.
    pub fn is_empty_layer(digest: &str) -> bool {
        digest == EMPTY_LAYER_BLOB_SUM
    }
}
