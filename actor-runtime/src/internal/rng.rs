//! Minimal xorshift64 generator.
//!
//! Used for steal-victim selection on CPU workers and for randomized
//! choices inside stress tests. Not suitable for anything security related.

/// Xorshift64 PRNG, one per thread.
#[derive(Debug, Clone)]
pub struct Xorshift64(u64);

impl Xorshift64 {
    /// Creates a generator. A zero seed is replaced by 1 since zero is a
    /// fixed point of the xorshift recurrence.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self(if seed == 0 { 1 } else { seed })
    }

    /// Seeds from the current thread's slot id and the wall clock.
    #[must_use]
    pub fn from_thread() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| u64::from(d.subsec_nanos()));
        let slot = super::thread_id::current() as u64;
        Self::new(nanos ^ slot.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `0..bound`. `bound` must be non-zero.
    pub fn below(&mut self, bound: usize) -> usize {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "result of modulo by a usize bound fits in usize"
        )]
        let v = (self.next_u64() % bound as u64) as usize;
        v
    }

    /// True with probability `1 / n`.
    #[cfg(test)]
    pub fn one_in(&mut self, n: usize) -> bool {
        self.below(n) == 0
    }
}
