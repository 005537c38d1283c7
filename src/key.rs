//! Lock and watch key validation.
//!
//! Every lock and watch entry point runs [`validate_key`] before any
//! network I/O; this module is the only producer of [`Error::EmptyKey`] and
//! [`Error::KeyTooLong`].

use crate::error::{Error, Result};

/// Maximum raw key length in bytes.
pub const MAX_KEY_BYTES: usize = 512;

/// Prefix prepended to user keys unless overridden per acquisition.
pub const DEFAULT_KEY_PREFIX: &str = "lock:";

/// Validate a user-supplied key.
///
/// Accepts `key` iff it is non-empty after trimming leading and trailing
/// whitespace and its raw byte length does not exceed [`MAX_KEY_BYTES`].
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::EmptyKey);
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::KeyTooLong { len: key.len() });
    }
    Ok(())
}

/// Build the full key the backend sees: prefix + user key, UTF-8 bytes,
/// no further normalization.
pub fn full_key(prefix: &str, key: &str) -> String {
    let mut full = String::with_capacity(prefix.len() + key.len());
    full.push_str(prefix);
    full.push_str(key);
    full
}
