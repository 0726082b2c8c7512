//! Best-model checkpoints.
//!
//! On-disk layout: a 32-byte SHA3-256 digest of the body, then the body,
//! which is the LZ4-compressed (size-prepended) bincode encoding of a
//! [`Checkpoint`].

use crate::core::{now, Error, ForecastConfig, Hash256, Result, Timestamp};
use crate::gnn::optim::AdamState;
use crate::tensor::TensorSnapshot;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Bumped whenever the serialized layout changes.
pub const CHECKPOINT_VERSION: u32 = 2;

const DIGEST_LEN: usize = 32;

/// Learned parameters, optimizer state and the configuration that produced them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run_id: Uuid,
    pub created_at: Timestamp,
    pub epoch: usize,
    pub val_loss: f32,
    /// Regions the model was trained on
    pub regions: Vec<String>,
    /// Every model parameter, sorted by name
    pub params: Vec<TensorSnapshot>,
    pub optimizer: AdamState,
    pub config: ForecastConfig,
}

impl Checkpoint {
    pub fn new(
        run_id: Uuid,
        epoch: usize,
        val_loss: f32,
        regions: Vec<String>,
        params: Vec<TensorSnapshot>,
        optimizer: AdamState,
        config: ForecastConfig,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            run_id,
            created_at: now(),
            epoch,
            val_loss,
            regions,
            params,
            optimizer,
            config,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let encoded = bincode::serialize(self)?;
        let body = compress_prepend_size(&encoded);
        let digest = Hash256::digest(&body);
        let mut out = Vec::with_capacity(DIGEST_LEN + body.len());
        out.extend_from_slice(digest.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DIGEST_LEN {
            return Err(Error::CheckpointCorrupted(format!(
                "{} bytes is shorter than the digest",
                bytes.len()
            )));
        }
        let (stored, body) = bytes.split_at(DIGEST_LEN);
        let actual = Hash256::digest(body);
        if actual.as_bytes()[..] != stored[..] {
            return Err(Error::CheckpointCorrupted(format!(
                "digest mismatch: stored {}, computed {}",
                hex::encode(stored),
                actual
            )));
        }
        let encoded = decompress_size_prepended(body)
            .map_err(|e| Error::CheckpointCorrupted(e.to_string()))?;
        let checkpoint: Checkpoint = bincode::deserialize(&encoded)
            .map_err(|e| Error::DeserializationError(e.to_string()))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::CheckpointCorrupted(format!(
                "unsupported version {}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }

    /// Write via a sibling temporary file so a failed write never replaces
    /// the previous best. Returns the body digest.
    pub fn save(&self, path: &Path) -> Result<Hash256> {
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[..DIGEST_LEN]);
        let digest = Hash256::new(digest);
        info!(
            path = %path.display(),
            epoch = self.epoch,
            val_loss = self.val_loss,
            bytes = bytes.len(),
            "Saved checkpoint"
        );
        Ok(digest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnn::optim::{Adam, AdamParams};
    use crate::tensor::ParamStore;
    use candle_core::{Device, Tensor};
    use candle_nn::Optimizer;
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        let store = ParamStore::cpu();
        store
            .insert("w", Tensor::new(&[[0.5f32, -1.25, 3.0]], &Device::Cpu).unwrap())
            .unwrap();
        store
            .insert("b", Tensor::new(&[0.1f32], &Device::Cpu).unwrap())
            .unwrap();
        let optimizer = Adam::new(store.vars().unwrap(), AdamParams::default()).unwrap();
        let params = store.snapshot().unwrap();
        let optimizer = optimizer.state().unwrap();
        Checkpoint::new(
            Uuid::new_v4(),
            7,
            0.42,
            vec!["New York".to_string()],
            params,
            optimizer,
            ForecastConfig::default(),
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("best.ckpt");
        let original = sample();
        let digest = original.save(&path).unwrap();
        assert_eq!(digest.to_hex().len(), 64);

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.run_id, original.run_id);
        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.val_loss, 0.42);
        assert_eq!(loaded.params, original.params);
        assert_eq!(loaded.optimizer, original.optimizer);
        assert_eq!(loaded.config, original.config);
        assert_eq!(loaded.created_at, original.created_at);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_tampered_body_is_detected() {
        let mut bytes = sample().to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            Checkpoint::from_bytes(&bytes),
            Err(Error::CheckpointCorrupted(_))
        ));
    }

    #[test]
    fn test_truncated_file_is_detected() {
        assert!(matches!(
            Checkpoint::from_bytes(&[0u8; 10]),
            Err(Error::CheckpointCorrupted(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Checkpoint::load(&dir.path().join("absent.ckpt")),
            Err(Error::Io(_))
        ));
    }
}
