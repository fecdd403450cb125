use std::f64::consts::PI;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Per-path random source: a ChaCha stream plus the spare value left over
/// from the last Box-Muller pair.
///
/// The spare lives on the instance, so two paths never share Gaussian state.
/// Implements [`RngCore`] so `rand_distr` distributions can sample from it.
pub struct RandomSource {
    rng: ChaCha20Rng,
    spare_normal: Option<f64>,
}

impl RandomSource {
    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(ChaCha20Rng::seed_from_u64(seed))
    }

    /// Independent stream `stream` of the generator keyed by `seed`. Streams
    /// of the same seed never overlap, so path `i` can use stream `i` and the
    /// run stays reproducible however paths are scheduled across threads.
    pub fn for_stream(seed: u64, stream: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        rng.set_stream(stream);
        Self::from_rng(rng)
    }

    fn from_rng(rng: ChaCha20Rng) -> Self {
        RandomSource { rng, spare_normal: None }
    }

    /// Uniform draw on `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    /// Uniform index into a collection of `len` items. `len` must be non-zero.
    pub fn index(&mut self, len: usize) -> usize {
        let idx = (self.uniform() * len as f64).floor() as usize;
        idx.min(len.saturating_sub(1))
    }

    /// Gaussian draw via Box-Muller. Each pair yields two values; the second
    /// is cached and returned by the next call.
    pub fn normal(&mut self, mean: f64, std: f64) -> f64 {
        if std <= 0.0 {
            return mean;
        }
        if let Some(cached) = self.spare_normal.take() {
            return mean + std * cached;
        }

        let mut u = 0.0;
        while u == 0.0 {
            u = self.uniform();
        }
        let v = self.uniform();

        let mag = (-2.0 * u.ln()).sqrt();
        let z0 = mag * (2.0 * PI * v).cos();
        let z1 = mag * (2.0 * PI * v).sin();

        self.spare_normal = Some(z1);
        mean + std * z0
    }

    pub fn standard_normal(&mut self) -> f64 {
        self.normal(0.0, 1.0)
    }

    #[cfg(test)]
    pub(crate) fn has_spare(&self) -> bool {
        self.spare_normal.is_some()
    }
}

impl RngCore for RandomSource {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        self.rng.fill_bytes(dst)
    }
}

/// Fresh run seed for unseeded runs.
pub fn entropy_seed() -> u64 {
    rand::random::<u64>()
}
