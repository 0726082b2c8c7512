//! Gated recurrent cell carrying state across windows.

use crate::core::{Error, Result};
use crate::tensor::{calculate_gain, orthogonal, xavier_normal, xavier_uniform, Nonlinearity, ParamStore};
use candle_core::{DType, Device, Tensor};
use candle_nn::rnn::{GRUConfig, GRUState, GRU, RNN};
use rand::Rng;

/// Single-layer GRU over `1 × input_dim` rows.
///
/// ```text
/// r  = σ(x·W_irᵀ + b_ir + h·W_hrᵀ + b_hr)
/// z  = σ(x·W_izᵀ + b_iz + h·W_hzᵀ + b_hz)
/// n  = tanh(x·W_inᵀ + b_in + r ⊙ (h·W_hnᵀ + b_hn))
/// h' = (1 − z) ⊙ n + z ⊙ h
/// ```
///
/// Gate weights are stacked `r, z, n` in `{name}.weight_ih_l0` (`3H × in`)
/// and `{name}.weight_hh_l0` (`3H × H`).
#[derive(Clone, Debug)]
pub struct GruCell {
    pub input_dim: usize,
    pub hidden_dim: usize,
    gru: GRU,
    device: Device,
}

impl GruCell {
    /// Input weights are Xavier-uniform over the stacked gate matrix,
    /// recurrent weights orthogonal, biases zero.
    pub fn new<R: Rng + ?Sized>(
        store: &ParamStore,
        name: &str,
        input_dim: usize,
        hidden_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(Error::InvalidConfig(
                "GRU dimensions must be positive".to_string(),
            ));
        }
        let device = store.device().clone();
        let gates = 3 * hidden_dim;
        store.insert(
            &format!("{name}.weight_ih_l0"),
            xavier_uniform(gates, input_dim, 1.0, rng, &device)?,
        )?;
        store.insert(
            &format!("{name}.weight_hh_l0"),
            orthogonal(gates, hidden_dim, 1.0, rng, &device)?,
        )?;
        for bias in ["bias_ih_l0", "bias_hh_l0"] {
            store.insert(
                &format!("{name}.{bias}"),
                Tensor::zeros(gates, DType::F32, &device)?,
            )?;
        }
        let gru = candle_nn::rnn::gru(
            input_dim,
            hidden_dim,
            GRUConfig::default(),
            store.var_builder().pp(name),
        )?;
        Ok(Self {
            input_dim,
            hidden_dim,
            gru,
            device,
        })
    }

    /// Fresh `1 × hidden_dim` state.
    pub fn init_hidden<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Tensor> {
        xavier_normal(1, self.hidden_dim, calculate_gain(Nonlinearity::Relu), rng, &self.device)
    }

    /// One update from a `1 × input_dim` input and `1 × hidden_dim` state.
    pub fn forward(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let (xr, xc) = x.dims2()?;
        let (hr, hc) = h.dims2()?;
        if xc != self.input_dim || hc != self.hidden_dim || xr != hr {
            return Err(Error::ShapeMismatch(format!(
                "GRU expects {}/{} columns, got input {:?} and state {:?}",
                self.input_dim,
                self.hidden_dim,
                (xr, xc),
                (hr, hc)
            )));
        }
        let state = GRUState { h: h.clone() };
        Ok(self.gru.step(x, &state)?.h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cell(input: usize, hidden: usize) -> (ParamStore, GruCell) {
        let mut rng = StdRng::seed_from_u64(42);
        let store = ParamStore::cpu();
        let gru = GruCell::new(&store, "gru", input, hidden, &mut rng).unwrap();
        (store, gru)
    }

    fn row(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (1, values.len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_parameter_layout() {
        let (store, gru) = cell(4, 3);
        assert_eq!(store.len(), 4);
        assert_eq!(store.num_scalars(), 9 * 4 + 9 * 3 + 2 * 9);
        let w_ih = store.get("gru.weight_ih_l0").unwrap().unwrap();
        assert_eq!(w_ih.dims(), &[9, 4]);
        let h0 = gru.init_hidden(&mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(h0.dims(), &[1, 3]);
    }

    #[test]
    fn test_recurrent_weights_have_orthonormal_columns() {
        let (store, _) = cell(2, 4);
        let w = store.get("gru.weight_hh_l0").unwrap().unwrap();
        assert_eq!(w.dims(), &[12, 4]);
        let gram = w.t().unwrap().matmul(&w).unwrap().to_vec2::<f32>().unwrap();
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[i][j] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_zero_weights_keep_half_state() {
        // With all parameters zero: r = z = 0.5, n = 0, so h' = h / 2.
        let (store, gru) = cell(2, 3);
        for var in store.vars().unwrap() {
            var.set(&var.zeros_like().unwrap()).unwrap();
        }
        let out = gru
            .forward(&row(&[1.0, -1.0]), &row(&[0.4, -0.8, 2.0]))
            .unwrap();
        let out = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (got, want) in out.iter().zip([0.2f32, -0.4, 1.0]) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_state_stays_bounded() {
        let (_store, gru) = cell(3, 4);
        let mut h = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        for step in 0..50 {
            let x = row(&[step as f32, -(step as f32), 1.0]);
            h = gru.forward(&x, &h).unwrap();
        }
        let values = h.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_shape_mismatch() {
        let (_store, gru) = cell(3, 4);
        let h = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            gru.forward(&row(&[1.0, 2.0]), &h),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
