// Weight initialization — slice-level schemes the layers call from their
// init_params hooks
//
// Glorot uniform is the default for dense layers: U(-k, k) with
// k = sqrt(6 / (fan_in + fan_out)) keeps activation variance roughly
// constant through the chain.

use rand::{Rng, RngCore};

/// Fill a slice from U(low, high).
pub fn uniform(slice: &mut [f32], low: f32, high: f32, rng: &mut dyn RngCore) {
    for v in slice.iter_mut() {
        *v = rng.random_range(low..high);
    }
}

/// Glorot (Xavier) uniform initialization.
pub fn glorot_uniform(slice: &mut [f32], fan_in: usize, fan_out: usize, rng: &mut dyn RngCore) {
    let k = (6.0 / (fan_in + fan_out) as f32).sqrt();
    uniform(slice, -k, k, rng);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_glorot_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut w = [0.0f32; 64];
        glorot_uniform(&mut w, 4, 3, &mut rng);
        let k = (6.0f32 / 7.0).sqrt();
        assert!(w.iter().all(|v| v.abs() <= k));
        assert!(w.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_uniform_deterministic_per_seed() {
        let mut a = [0.0f32; 8];
        let mut b = [0.0f32; 8];
        uniform(&mut a, -1.0, 1.0, &mut StdRng::seed_from_u64(3));
        uniform(&mut b, -1.0, 1.0, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
