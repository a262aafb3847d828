use std::f64::consts::LN_2;

/// Append-only Bloom filter over 64-bit keys.
///
/// Sized by the classical formulas: `m = ⌈−n·ln(p)/(ln 2)²⌉` bits and
/// `k = ⌈(m/n)·ln 2⌉` probes for `n` expected elements at false-positive
/// rate `p`. False positives are possible, false negatives are not.
///
/// Keys are assumed to be already well mixed (they come out of xxh3-64),
/// so the k probe positions are derived from a single key by iterated
/// left rotation instead of a second hash family.
pub struct BloomFilter {
    bits: Vec<u8>,
    m: u64,
    k: u32,
    inserted: u64,
}

impl BloomFilter {
    /// `expected` and `error_rate` are validated upstream; out-of-range
    /// values are clamped here so the filter itself never panics.
    pub fn new(expected: usize, error_rate: f64) -> Self {
        let n = expected.max(1) as f64;
        let p = error_rate.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);

        let m = ((-n * p.ln()) / (LN_2 * LN_2)).ceil().max(1.0) as u64;
        let k = ((m as f64 / n) * LN_2).ceil().max(1.0) as u32;

        Self {
            bits: vec![0u8; m.div_ceil(8) as usize],
            m,
            k,
            inserted: 0,
        }
    }

    pub fn add(&mut self, key: u64) {
        let mut h = key;
        for _ in 0..self.k {
            h = h.rotate_left(1);
            let pos = h % self.m;
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
        self.inserted += 1;
    }

    pub fn has(&self, key: u64) -> bool {
        let mut h = key;
        for _ in 0..self.k {
            h = h.rotate_left(1);
            let pos = h % self.m;
            if self.bits[(pos / 8) as usize] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Atomic has-then-insert: returns `true` when the key was already
    /// present, inserting it otherwise. Callers serialize access with a
    /// mutex so two concurrent identical keys cannot both see "absent".
    pub fn check_and_add(&mut self, key: u64) -> bool {
        if self.has(key) {
            return true;
        }
        self.add(key);
        false
    }

    /// Expected false-positive probability after `inserted` insertions:
    /// `(1 − e^(−k·n/m))^k`.
    pub fn estimate_fpp(&self, inserted: u64) -> f64 {
        let exponent = -(self.k as f64 * inserted as f64) / self.m as f64;
        (1.0 - exponent.exp()).powi(self.k as i32)
    }
}
