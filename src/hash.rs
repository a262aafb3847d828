use xxhash_rust::xxh3::{xxh3_64, Xxh3};

/// Incremental xxh3-64 state for response bodies.
///
/// Chunk boundaries never affect the digest: hashing a byte stream in any
/// chunking equals hashing its concatenation.
pub struct StreamingHasher {
    state: Xxh3,
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self { state: Xxh3::new() }
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    pub fn digest(&self) -> u64 {
        self.state.digest()
    }
}

/// Request identity: one-shot xxh3-64 (seed 0) over the exact bytes of
/// `origin+path`. Query strings and fragments are stripped before the URL
/// reaches this function, so identities are query-insensitive.
pub fn identity_hash(url: &str) -> u64 {
    xxh3_64(url.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_vector() {
        // Reference xxh3-64 digest of the empty input, seed 0.
        assert_eq!(xxh3_64(b""), 0x2D06_8005_38D3_94C2);
        assert_eq!(StreamingHasher::new().digest(), 0x2D06_8005_38D3_94C2);
    }

    #[test]
    fn streaming_equals_one_shot() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        for chunk_size in [1usize, 7, 64, 1000, 4096] {
            let mut hasher = StreamingHasher::new();
            for chunk in payload.chunks(chunk_size) {
                hasher.update(chunk);
            }
            assert_eq!(
                hasher.digest(),
                xxh3_64(&payload),
                "chunk size {} diverged",
                chunk_size
            );
        }
    }

    #[test]
    fn reset_discards_prior_updates() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"stale bytes");
        hasher.reset();
        hasher.update(b"fresh");
        assert_eq!(hasher.digest(), xxh3_64(b"fresh"));
    }

    #[test]
    fn digest_is_observable_mid_stream() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"abc");
        let first = hasher.digest();
        assert_eq!(first, xxh3_64(b"abc"));
        hasher.update(b"def");
        assert_eq!(hasher.digest(), xxh3_64(b"abcdef"));
    }

    #[test]
    fn identity_is_url_sensitive() {
        assert_eq!(
            identity_hash("http://app/dummy"),
            identity_hash("http://app/dummy")
        );
        assert_ne!(
            identity_hash("http://app/dummy"),
            identity_hash("http://app/other")
        );
    }
}
