//! Quasi-random initial candidates: a Halton sequence with a seeded random
//! shift per dimension (Cranley-Patterson rotation).

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// `count` points in `[0,1)^dim`. The same `(count, dim, seed)` always yields
/// the same grid, and a shorter grid is a prefix of a longer one.
pub fn halton_grid(count: usize, dim: usize, seed: u64) -> Array2<f64> {
    let bases = primes(dim);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let shifts: Vec<f64> = (0..dim).map(|_| rng.gen::<f64>()).collect();
    Array2::from_shape_fn((count, dim), |(i, d)| {
        (radical_inverse(i as u64 + 1, bases[d]) + shifts[d]).fract()
    })
}

/// Van der Corput radical inverse of `index` in `base`.
pub fn radical_inverse(mut index: u64, base: u64) -> f64 {
    let inv_base = 1.0 / base as f64;
    let mut scale = inv_base;
    let mut result = 0.0;
    while index > 0 {
        result += (index % base) as f64 * scale;
        index /= base;
        scale *= inv_base;
    }
    result
}

fn primes(count: usize) -> Vec<u64> {
    let mut found: Vec<u64> = Vec::with_capacity(count);
    let mut candidate = 2u64;
    while found.len() < count {
        if found
            .iter()
            .take_while(|&&p| p * p <= candidate)
            .all(|&p| candidate % p != 0)
        {
            found.push(candidate);
        }
        candidate += 1;
    }
    found
}
