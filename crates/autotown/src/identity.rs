//! Board identity resolution.
//!
//! A board is identified by the unique ID its ground station reports, or,
//! failing that, by the SHA-256 of its CPU serial. Every code path that
//! derives an identity goes through [`hash_identity`] so that independent
//! paths converge on the same key for the same device.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Identities shorter than this are legacy, pre-hash identities.
///
/// A hex SHA-256 digest is exactly this long.
pub const LEGACY_IDENTITY_THRESHOLD: usize = 64;

/// Hash an identifier into a new-style identity (lowercase hex SHA-256).
#[must_use]
pub fn hash_identity(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Resolve a board identity from an explicit ID or a hardware fallback.
///
/// # Errors
///
/// Returns [`Error::NoIdentity`] if both inputs are empty.
pub fn resolve_identity(explicit_id: &str, hardware_id: &str) -> Result<String> {
    if !explicit_id.is_empty() {
        return Ok(explicit_id.to_string());
    }
    if !hardware_id.is_empty() {
        return Ok(hash_identity(hardware_id));
    }
    Err(Error::NoIdentity)
}

/// Map legacy board names onto their canonical names.
#[must_use]
pub fn canonical_board_name(name: &str) -> String {
    match name {
        "CopterControl" => "CC3D",
        "Revolution" | "RevoMini" => "Revo",
        other => other,
    }
    .to_string()
}

/// Collapse a ground station OS description into a coarse family name.
#[must_use]
pub fn abbreviate_os(os: &str) -> &'static str {
    if os.starts_with("Windows") {
        "Windows"
    } else if os.starts_with("OS X") || os.starts_with("macOS") {
        "Mac"
    } else {
        "Linux"
    }
}

/// Check whether an identity predates hashed identities.
#[must_use]
pub fn is_legacy_identity(identity: &str, threshold: usize) -> bool {
    identity.len() < threshold
}

/// Derive the new-style identity for a legacy one.
///
/// Returns `None` when `identity` is already new-style, which makes the
/// migration idempotent.
#[must_use]
pub fn migrate_identity(identity: &str, threshold: usize) -> Option<String> {
    is_legacy_identity(identity, threshold).then(|| hash_identity(identity))
}
