//! Deterministic jitter streams.
//!
//! Backoff jitter must not perturb tests, so it never comes from a
//! platform RNG. Each component that jitters (provider retries,
//! notification retries) draws from its own PCG stream derived from a
//! single engine seed. Adding a component never shifts another
//! component's stream.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for one engine component.
pub struct JitterRng {
    inner: Pcg64Mcg,
}

impl JitterRng {
    pub fn new(engine_seed: u64, slot: ComponentSlot) -> Self {
        let derived = engine_seed ^ (slot as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            inner: Pcg64Mcg::seed_from_u64(derived),
        }
    }

    /// Draw a u64 in [0, n). Returns 0 when n is 0 (no jitter configured).
    pub fn below(&mut self, n: u64) -> u64 {
        use rand::RngCore;
        if n == 0 {
            return 0;
        }
        self.inner.next_u64() % n
    }
}

/// Stable component slot assignments. Append only — reordering changes
/// every component's stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ComponentSlot {
    Provider = 0,
    Notifier = 1,
}
