//! Seeded variance-scaling weight initializers.
//!
//! Weights follow the candle `Linear` layout, `out × in`, so a
//! `rows × cols` weight has `fan_in = cols` and `fan_out = rows`. Values are
//! drawn from the caller's RNG so that a run is reproducible from its seed.

use crate::core::Result;
use candle_core::{Device, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Nonlinearity following a layer, used to pick the initialization gain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Nonlinearity {
    Linear,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu(f32),
}

/// Recommended gain for a nonlinearity.
pub fn calculate_gain(nonlinearity: Nonlinearity) -> f32 {
    match nonlinearity {
        Nonlinearity::Linear | Nonlinearity::Sigmoid => 1.0,
        Nonlinearity::Tanh => 5.0 / 3.0,
        Nonlinearity::Relu => 2.0f32.sqrt(),
        Nonlinearity::LeakyRelu(slope) => (2.0 / (1.0 + slope * slope)).sqrt(),
    }
}

/// Glorot uniform: `U(-a, a)` with `a = gain · sqrt(6 / (fan_in + fan_out))`.
pub fn xavier_uniform<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    gain: f32,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let bound = gain * (6.0 / (rows + cols).max(1) as f32).sqrt();
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..=bound))
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

/// Glorot normal: `N(0, std²)` with `std = gain · sqrt(2 / (fan_in + fan_out))`.
pub fn xavier_normal<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    gain: f32,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let std = gain * (2.0 / (rows + cols).max(1) as f32).sqrt();
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| {
            let z: f32 = StandardNormal.sample(rng);
            z * std
        })
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

/// (Semi-)orthogonal matrix scaled by `gain`, via Gram-Schmidt on a
/// Gaussian draw. Rows are orthonormal when `rows <= cols`, columns otherwise.
pub fn orthogonal<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    gain: f32,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let transposed = rows > cols;
    let (n, m) = if transposed { (cols, rows) } else { (rows, cols) };

    let mut basis: Vec<Vec<f32>> = Vec::with_capacity(n);
    while basis.len() < n {
        let mut v: Vec<f32> = (0..m).map(|_| StandardNormal.sample(rng)).collect();
        for b in &basis {
            let proj: f32 = v.iter().zip(b).map(|(x, y)| x * y).sum();
            for (x, y) in v.iter_mut().zip(b) {
                *x -= proj * y;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        // Degenerate draw; resample.
        if norm < 1e-6 {
            continue;
        }
        basis.push(v.into_iter().map(|x| x / norm * gain).collect());
    }

    let flat: Vec<f32> = basis.into_iter().flatten().collect();
    let q = Tensor::from_vec(flat, (n, m), device)?;
    if transposed {
        Ok(q.t()?.contiguous()?)
    } else {
        Ok(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_gain_values() {
        assert_eq!(calculate_gain(Nonlinearity::Linear), 1.0);
        assert!((calculate_gain(Nonlinearity::Relu) - 1.41421).abs() < 1e-4);
        assert!(calculate_gain(Nonlinearity::LeakyRelu(0.01)) < calculate_gain(Nonlinearity::Relu));
    }

    #[test]
    fn test_xavier_uniform_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = xavier_uniform(10, 6, 1.0, &mut rng, &Device::Cpu).unwrap();
        let bound = (6.0f32 / 16.0).sqrt();
        assert_eq!(w.dims(), &[10, 6]);
        assert!(values(&w).iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_xavier_normal_spread() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = values(&xavier_normal(200, 200, 1.0, &mut rng, &Device::Cpu).unwrap());
        let var = w.iter().map(|v| v * v).sum::<f32>() / w.len() as f32;
        let expected = 2.0 / 400.0;
        assert!((var - expected).abs() < expected * 0.2);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = xavier_uniform(4, 3, 1.0, &mut StdRng::seed_from_u64(5), &Device::Cpu).unwrap();
        let b = xavier_uniform(4, 3, 1.0, &mut StdRng::seed_from_u64(5), &Device::Cpu).unwrap();
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn test_orthogonal_rows_are_orthonormal() {
        let mut rng = StdRng::seed_from_u64(11);
        let q = orthogonal(4, 4, 1.0, &mut rng, &Device::Cpu).unwrap();
        let qqt = q.matmul(&q.t().unwrap()).unwrap().to_vec2::<f32>().unwrap();
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((qqt[i][j] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_orthogonal_tall_matrix() {
        let mut rng = StdRng::seed_from_u64(3);
        let q = orthogonal(6, 3, 1.0, &mut rng, &Device::Cpu).unwrap();
        assert_eq!(q.dims(), &[6, 3]);
        let qtq = q.t().unwrap().matmul(&q).unwrap().to_vec2::<f32>().unwrap();
        for (i, row) in qtq.iter().enumerate() {
            assert!((row[i] - 1.0).abs() < 1e-4);
        }
    }
}
