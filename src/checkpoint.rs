// src/checkpoint.rs
use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::module::Module;
use half::{bf16, f16};
use memmap2::MmapOptions;
use ndarray::ArrayD;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use tracing::{debug, info, warn};

pub const INIT_PREFIX: &str = "init";
pub const VELOCITY_PREFIX: &str = "optimizer.velocity";

/// Scalars stored next to the tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub randomlabels: bool,
    pub tr_loss: f64,
    pub tr_err: f64,
    pub val_err: f64,
    pub val_margin: f64,
    pub config: TrainConfig,
}

/// Everything needed to resume a run or measure a trained network.
pub struct CheckpointState<'a> {
    pub meta: CheckpointMeta,
    pub model: &'a dyn Module,
    /// parameters of the network right after initialization
    pub init_params: &'a [(String, ArrayD<f32>)],
    pub velocities: &'a [Option<ArrayD<f32>>],
}

pub struct LoadedCheckpoint {
    pub meta: CheckpointMeta,
    tensors: HashMap<String, ArrayD<f32>>,
}

fn to_bytes(data: &ArrayD<f32>) -> Vec<u8> {
    data.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn save_checkpoint(path: &Path, state: &CheckpointState<'_>) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }

    let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    for (name, param) in state.model.named_parameters("") {
        let data = param.data();
        entries.push((name, data.shape().to_vec(), to_bytes(&data)));
    }
    for (name, data) in state.init_params {
        entries.push((format!("{}.{}", INIT_PREFIX, name), data.shape().to_vec(), to_bytes(data)));
    }
    for (i, v) in state.velocities.iter().enumerate() {
        if let Some(v) = v {
            entries.push((format!("{}.{}", VELOCITY_PREFIX, i), v.shape().to_vec(), to_bytes(v)));
        }
    }

    let mut views = Vec::with_capacity(entries.len());
    for (name, shape, bytes) in &entries {
        views.push((name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }

    let meta = &state.meta;
    let mut metadata = HashMap::new();
    metadata.insert("epoch".to_string(), meta.epoch.to_string());
    metadata.insert("randomlabels".to_string(), meta.randomlabels.to_string());
    metadata.insert("tr_loss".to_string(), meta.tr_loss.to_string());
    metadata.insert("tr_err".to_string(), meta.tr_err.to_string());
    metadata.insert("val_err".to_string(), meta.val_err.to_string());
    metadata.insert("val_margin".to_string(), meta.val_margin.to_string());
    metadata.insert("config".to_string(), serde_json::to_string(&meta.config)?);

    safetensors::tensor::serialize_to_file(views, &Some(metadata), path)?;
    info!("Checkpoint saved to {} (epoch {})", path.display(), meta.epoch);
    Ok(())
}

fn meta_field<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str) -> Result<T> {
    map.get(key)
        .ok_or_else(|| Error::Checkpoint(format!("metadata field `{}` missing", key)))?
        .parse::<T>()
        .map_err(|_| Error::Checkpoint(format!("metadata field `{}` is malformed", key)))
}

fn decode(name: &str, view: &TensorView<'_>) -> Result<ArrayD<f32>> {
    let bytes = view.data();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => {
            return Err(Error::Checkpoint(format!("Unsupported dtype: {:?} for {}", other, name)));
        }
    };
    Ok(ArrayD::from_shape_vec(view.shape().to_vec(), values)?)
}

pub fn load_checkpoint(path: &Path) -> Result<LoadedCheckpoint> {
    let file = File::open(path)?;
    // SAFETY: the file is only read while the mapping is alive
    let mmap = unsafe { MmapOptions::new().map(&file)? };

    let (_, header) = SafeTensors::read_metadata(&mmap)?;
    let map = header
        .metadata()
        .clone()
        .ok_or_else(|| Error::Checkpoint(format!("{} carries no metadata", path.display())))?;

    let config_json = map
        .get("config")
        .ok_or_else(|| Error::Checkpoint("metadata field `config` missing".to_string()))?;
    let meta = CheckpointMeta {
        epoch: meta_field(&map, "epoch")?,
        randomlabels: meta_field(&map, "randomlabels")?,
        tr_loss: meta_field(&map, "tr_loss")?,
        tr_err: meta_field(&map, "tr_err")?,
        val_err: meta_field(&map, "val_err")?,
        val_margin: meta_field(&map, "val_margin")?,
        config: serde_json::from_str(config_json)?,
    };

    let tensors = SafeTensors::deserialize(&mmap)?;
    let mut decoded = HashMap::new();
    for (name, view) in tensors.tensors() {
        let array = decode(&name, &view)?;
        decoded.insert(name, array);
    }
    debug!("{}: {} tensors", path.display(), decoded.len());

    Ok(LoadedCheckpoint {
        meta,
        tensors: decoded,
    })
}

impl LoadedCheckpoint {
    /// 把训练后的参数写入模型；缺失或形状不符都是错误
    pub fn apply_parameters(&self, module: &dyn Module) -> Result<()> {
        for (name, param) in module.named_parameters("") {
            let source = self
                .tensors
                .get(&name)
                .ok_or_else(|| Error::Checkpoint(format!("Parameter {} not found in checkpoint", name)))?;
            if source.shape() != param.shape().as_slice() {
                return Err(Error::Checkpoint(format!(
                    "Shape mismatch for {}: checkpoint {:?}, model {:?}",
                    name,
                    source.shape(),
                    param.shape()
                )));
            }
            param.set_data(source.clone());
        }
        Ok(())
    }

    /// Parameters the run started from, keyed like `module.named_parameters("")`.
    pub fn init_params(&self, module: &dyn Module) -> Result<Vec<(String, ArrayD<f32>)>> {
        module
            .named_parameters("")
            .into_iter()
            .map(|(name, _)| {
                let key = format!("{}.{}", INIT_PREFIX, name);
                self.tensors
                    .get(&key)
                    .cloned()
                    .map(|t| (name, t))
                    .ok_or_else(|| Error::Checkpoint(format!("Parameter {} not found in checkpoint", key)))
            })
            .collect()
    }

    pub fn velocities(&self, n_params: usize) -> Vec<Option<ArrayD<f32>>> {
        let velocities: Vec<Option<ArrayD<f32>>> = (0..n_params)
            .map(|i| self.tensors.get(&format!("{}.{}", VELOCITY_PREFIX, i)).cloned())
            .collect();
        if velocities.iter().all(|v| v.is_none()) {
            warn!("checkpoint has no momentum buffers; optimizer starts from zero velocity");
        }
        velocities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use crate::sequential;
    use ndarray::arr1;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn meta() -> CheckpointMeta {
        CheckpointMeta {
            epoch: 4,
            randomlabels: true,
            tr_loss: 0.25,
            tr_err: 0.1,
            val_err: 0.3,
            val_margin: 1.5,
            config: TrainConfig::default(),
        }
    }

    #[test]
    fn save_and_load_restores_params_init_and_velocity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ckpt.safetensors");
        let mut rng = StdRng::seed_from_u64(3);

        let model = sequential![Linear::new(3, 2, &mut rng)];
        let init: Vec<(String, ArrayD<f32>)> =
            model.named_parameters("").into_iter().map(|(n, p)| (n, p.data())).collect();
        model.parameters()[0].data_mut().fill(0.5);
        let velocities = vec![Some(arr1(&[1.0f32, 2.0]).into_dyn()), None];
        save_checkpoint(
            &path,
            &CheckpointState { meta: meta(), model: &model, init_params: &init, velocities: &velocities },
        )
        .unwrap();

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.meta, meta());

        let fresh = sequential![Linear::new(3, 2, &mut rng)];
        loaded.apply_parameters(&fresh).unwrap();
        assert!(fresh.parameters()[0].data().iter().all(|&v| v == 0.5));

        let restored_init = loaded.init_params(&fresh).unwrap();
        assert_eq!(restored_init, init);

        let v = loaded.velocities(2);
        assert_eq!(v[0].as_ref().unwrap().as_slice().unwrap(), &[1.0, 2.0]);
        assert!(v[1].is_none());
    }

    #[test]
    fn half_precision_tensors_are_widened() {
        let values = [1.5f32, -0.25, 3.0, 0.0];
        let f16_bytes: Vec<u8> = values.iter().flat_map(|&v| f16::from_f32(v).to_le_bytes()).collect();
        let bf16_bytes: Vec<u8> = values.iter().flat_map(|&v| bf16::from_f32(v).to_le_bytes()).collect();

        let view = TensorView::new(Dtype::F16, vec![2, 2], &f16_bytes).unwrap();
        let widened = decode("w", &view).unwrap();
        assert_eq!(widened.shape(), &[2, 2]);
        assert_eq!(widened.iter().copied().collect::<Vec<_>>(), values);

        let view = TensorView::new(Dtype::BF16, vec![4], &bf16_bytes).unwrap();
        assert_eq!(decode("w", &view).unwrap().iter().copied().collect::<Vec<_>>(), values);

        let ints = [0u8; 4];
        let view = TensorView::new(Dtype::I32, vec![1], &ints).unwrap();
        assert!(matches!(decode("w", &view), Err(Error::Checkpoint(_))));
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let mut rng = StdRng::seed_from_u64(3);
        let model = sequential![Linear::new(3, 2, &mut rng)];
        save_checkpoint(&path, &CheckpointState { meta: meta(), model: &model, init_params: &[], velocities: &[] })
            .unwrap();

        let other = sequential![Linear::new(4, 2, &mut rng)];
        let loaded = load_checkpoint(&path).unwrap();
        assert!(matches!(loaded.apply_parameters(&other), Err(Error::Checkpoint(_))));
        assert!(loaded.init_params(&other).is_err());
    }
}
