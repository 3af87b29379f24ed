//! # Command Descriptors
//!
//! Purpose: Model every request the client can issue as an immutable value
//! that the codec serializes losslessly to the memcached text protocol.
//!
//! ## Design Principles
//! 1. **Borrow-Friendly**: Commands borrow keys and values; nothing is copied
//!    until the encoder writes into the connection's buffer.
//! 2. **Validate Early**: Key constraints are checked before any bytes hit
//!    the wire, so a bad key never poisons a pooled connection.
//! 3. **One Exchange**: A command exists for the duration of a single
//!    request/response round trip and carries no retry state.

use crate::error::{ProtoError, ProtoResult};

/// Maximum key length accepted by the protocol (bytes).
pub const MAX_KEY_SIZE: usize = 250;

/// Default cap on a single value, matching the classic 1 MiB server slab limit.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Storage verb for the `set` family of commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Unconditional store.
    Set,
    /// Store only if the key does not exist.
    Add,
    /// Store only if the key already exists.
    Replace,
    /// Store only if the entry's CAS token still matches.
    Cas(u64),
}

impl StoreMode {
    /// Protocol verb for this mode.
    pub fn verb(&self) -> &'static [u8] {
        match self {
            StoreMode::Set => b"set",
            StoreMode::Add => b"add",
            StoreMode::Replace => b"replace",
            StoreMode::Cas(_) => b"cas",
        }
    }
}

/// A single request to one cache node.
///
/// `exptime` follows server semantics: `0` means no expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Store a value under a key.
    Store {
        mode: StoreMode,
        key: &'a str,
        value: &'a [u8],
        flags: u32,
        exptime: u32,
    },
    /// Fetch one or more keys. `with_cas` selects `gets` over `get`.
    Get { keys: &'a [&'a str], with_cas: bool },
    /// Increment the stored decimal value.
    Incr { key: &'a str, delta: u64 },
    /// Decrement the stored decimal value (the server clamps at zero).
    Decr { key: &'a str, delta: u64 },
    /// Remove a key.
    Delete { key: &'a str },
    /// Invalidate every entry on the node, optionally after `delay` seconds.
    FlushAll { delay: Option<u32> },
    /// Ask the node for its version string.
    Version,
}

/// Checks that a key is sendable over the text protocol.
///
/// Keys are limited to 250 bytes and must not contain whitespace or control
/// bytes, since the protocol delimits fields with spaces and lines with CRLF.
pub fn validate_key(key: &str) -> ProtoResult<()> {
    if key.is_empty() {
        return Err(ProtoError::BadKey("empty key"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(ProtoError::BadKey("key longer than 250 bytes"));
    }
    if key.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(ProtoError::BadKey("key contains whitespace or control bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_keys() {
        validate_key("user:123").unwrap();
        validate_key(&"k".repeat(MAX_KEY_SIZE)).unwrap();
    }

    #[test]
    fn rejects_empty_key() {
        assert!(validate_key("").is_err());
    }

    #[test]
    fn rejects_oversized_key() {
        assert!(validate_key(&"k".repeat(MAX_KEY_SIZE + 1)).is_err());
    }

    #[test]
    fn rejects_whitespace_and_control() {
        assert!(validate_key("a key").is_err());
        assert!(validate_key("a\r\nkey").is_err());
        assert!(validate_key("a\tkey").is_err());
    }
}
