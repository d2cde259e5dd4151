//! Content hashing used for deduplication and chunk integrity checks.
//!
//! Digests are MD5, rendered as 32 lowercase hex characters.

use md5::Context;

pub const HASH_HEX_LEN: usize = 32;

/// Digest a complete byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Incremental digest for data that arrives in pieces.
pub struct ContentHasher {
    ctx: Context,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            ctx: Context::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.len += data.len() as u64;
        self.ctx.consume(data);
    }

    /// Bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// True if `value` looks like an MD5 hex digest (either case).
pub fn is_valid_hash(value: &str) -> bool {
    value.len() == HASH_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Case-insensitive digest comparison.
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
