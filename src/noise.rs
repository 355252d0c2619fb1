//! Seeded Gaussian noise, one generator per batch element.
//!
//! Tensors are filled on the host from `ChaCha8Rng` streams and moved to the
//! target device, so the same seeds give the same latents on any backend.

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::Result;

/// Resolve a request seed: 0 means "pick one at random".
pub fn resolve_seed(seed: u64) -> u64 {
    if seed == 0 {
        // Never hand out 0 itself, it would read back as "random" in provenance.
        rand::rng().random_range(1..=u64::MAX)
    } else {
        seed
    }
}

/// Per-element seeds for a batch: `base, base + 1, ...`.
pub fn batch_seeds(base: u64, batch_size: usize) -> Vec<u64> {
    (0..batch_size as u64).map(|i| base.wrapping_add(i)).collect()
}

/// A batch of independent seeded normal generators.
pub struct NoiseGenerator {
    rngs: Vec<ChaCha8Rng>,
}

impl NoiseGenerator {
    pub fn new(seeds: &[u64]) -> Self {
        Self {
            rngs: seeds.iter().map(|&s| ChaCha8Rng::seed_from_u64(s)).collect(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.rngs.len()
    }

    /// Draw a `[batch, dims...]` tensor of standard normal noise.
    ///
    /// Element `b` of the batch comes exclusively from generator `b`.
    pub fn randn(&mut self, dims: &[usize], device: &Device, dtype: DType) -> Result<Tensor> {
        let per_element: usize = dims.iter().product();
        let mut data = Vec::with_capacity(per_element * self.rngs.len());
        for rng in self.rngs.iter_mut() {
            data.extend((0..per_element).map(|_| rng.sample::<f32, _>(StandardNormal)));
        }
        let mut shape = Vec::with_capacity(dims.len() + 1);
        shape.push(self.rngs.len());
        shape.extend_from_slice(dims);
        let noise = Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)?;
        Ok(noise)
    }

    /// Draw noise shaped like `like` (batch dimension must match).
    pub fn randn_like(&mut self, like: &Tensor) -> Result<Tensor> {
        let dims = like.dims();
        self.randn(&dims[1..], like.device(), like.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() {
        let a = NoiseGenerator::new(&[42])
            .randn(&[2, 3, 4], &Device::Cpu, DType::F32)
            .unwrap();
        let b = NoiseGenerator::new(&[42])
            .randn(&[2, 3, 4], &Device::Cpu, DType::F32)
            .unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn batch_elements_are_independent_streams() {
        // Element 1 of a [7, 8] batch equals element 0 of a [8] batch.
        let pair = NoiseGenerator::new(&[7, 8])
            .randn(&[4], &Device::Cpu, DType::F32)
            .unwrap();
        let single = NoiseGenerator::new(&[8])
            .randn(&[4], &Device::Cpu, DType::F32)
            .unwrap();
        let second: Vec<f32> = pair.get(1).unwrap().to_vec1().unwrap();
        let only: Vec<f32> = single.get(0).unwrap().to_vec1().unwrap();
        assert_eq!(second, only);
        assert_eq!(pair.dims(), &[2, 4]);
    }

    #[test]
    fn random_seed_is_never_zero() {
        for _ in 0..16 {
            assert_ne!(resolve_seed(0), 0);
        }
        assert_eq!(resolve_seed(1234), 1234);
        assert_eq!(batch_seeds(u64::MAX, 2), vec![u64::MAX, 0]);
    }

    #[test]
    fn noise_is_roughly_standard() {
        let noise = NoiseGenerator::new(&[3])
            .randn(&[4096], &Device::Cpu, DType::F32)
            .unwrap();
        let mean: f32 = noise.mean_all().unwrap().to_scalar().unwrap();
        let var: f32 = noise.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 0.1, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.1, "var = {var}");
    }
}
