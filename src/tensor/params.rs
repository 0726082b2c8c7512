//! Named trainable parameters backed by a candle [`VarMap`].
//!
//! Layers are built through [`ParamStore::var_builder`]. Values are seeded
//! first with [`ParamStore::insert`], so the builder picks up the seeded
//! tensor instead of drawing its own.

use crate::core::{Error, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

/// Host copy of one named tensor, used by checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSnapshot {
    /// Dotted parameter name, e.g. `encoder.layer1.head0.fc.weight`
    pub name: String,
    /// Tensor dimensions
    pub shape: Vec<usize>,
    /// Row-major values
    pub values: Vec<f32>,
}

impl TensorSnapshot {
    pub fn from_tensor(name: impl Into<String>, tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            shape: tensor.dims().to_vec(),
            values: tensor.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.values.clone(), self.shape.as_slice(), device)?)
    }
}

/// Every learnable tensor of a model.
#[derive(Clone)]
pub struct ParamStore {
    varmap: VarMap,
    device: Device,
}

impl ParamStore {
    pub fn new(device: Device) -> Self {
        Self {
            varmap: VarMap::new(),
            device,
        }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Builder over this store. Names already inserted resolve to the
    /// stored variable.
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device)
    }

    /// Register `value` as a trainable variable under `name`.
    pub fn insert(&self, name: &str, value: Tensor) -> Result<()> {
        let var = Var::from_tensor(&value.to_dtype(DType::F32)?)?;
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Tensor("parameter map lock poisoned".to_string()))?;
        if data.contains_key(name) {
            return Err(Error::InvalidConfig(format!("duplicate parameter {name}")));
        }
        data.insert(name.to_string(), var);
        Ok(())
    }

    /// A `Linear` layer named `name` with the given `out × in` weight and a
    /// zero bias, both registered in this store.
    pub fn linear(&self, name: &str, weight: Tensor) -> Result<Linear> {
        let (out_dim, in_dim) = weight.dims2()?;
        self.insert(&format!("{name}.weight"), weight)?;
        self.insert(
            &format!("{name}.bias"),
            Tensor::zeros(out_dim, DType::F32, &self.device)?,
        )?;
        Ok(candle_nn::linear(in_dim, out_dim, self.var_builder().pp(name))?)
    }

    /// Variables sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Tensor("parameter map lock poisoned".to_string()))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Variables in the same order as [`ParamStore::named_vars`].
    pub fn vars(&self) -> Result<Vec<Var>> {
        Ok(self.named_vars()?.into_iter().map(|(_, v)| v).collect())
    }

    /// Current value of one parameter.
    pub fn get(&self, name: &str) -> Result<Option<Tensor>> {
        Ok(self
            .named_vars()?
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_tensor().clone()))
    }

    pub fn len(&self) -> usize {
        self.varmap.all_vars().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of scalar weights.
    pub fn num_scalars(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Host copy of every parameter, sorted by name.
    pub fn snapshot(&self) -> Result<Vec<TensorSnapshot>> {
        self.named_vars()?
            .iter()
            .map(|(name, var)| TensorSnapshot::from_tensor(name.as_str(), var.as_tensor()))
            .collect()
    }

    /// Overwrite every parameter in place. Layers holding the variables
    /// see the new values. The snapshot must match names and shapes exactly.
    pub fn restore(&self, snapshot: &[TensorSnapshot]) -> Result<()> {
        let vars = self.named_vars()?;
        let same_layout = vars.len() == snapshot.len()
            && vars
                .iter()
                .zip(snapshot)
                .all(|((name, var), s)| *name == s.name && var.dims() == s.shape.as_slice());
        if !same_layout {
            return Err(Error::CheckpointCorrupted(
                "parameter layout does not match the configured model".to_string(),
            ));
        }
        for ((_, var), s) in vars.iter().zip(snapshot) {
            var.set(&s.to_tensor(&self.device)?)?;
        }
        Ok(())
    }
}
