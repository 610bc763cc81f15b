use std::{
    fs,
    path::{Path, PathBuf},
};

use log::info;
use machine_learning::model::ParamLayout;
use safetensors::{Dtype, SafeTensors, serialize_to_file, tensor::TensorView};

use crate::{OrchestratorError, Result};

/// Persists and restores the model parameters.
pub trait Checkpoint {
    /// Writes `params`, laid out as `layout`, to the checkpoint.
    fn save(&self, layout: &ParamLayout, params: &[f32]) -> Result<()>;

    /// Reads back a flat parameter buffer following `layout`.
    fn restore(&self, layout: &ParamLayout) -> Result<Vec<f32>>;
}

/// A checkpoint stored as a safetensors file, one named tensor per parameter segment.
#[derive(Debug, Clone)]
pub struct SafetensorsCheckpoint {
    path: PathBuf,
}

impl SafetensorsCheckpoint {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpoint for SafetensorsCheckpoint {
    fn save(&self, layout: &ParamLayout, params: &[f32]) -> Result<()> {
        layout.check("checkpoint params", params)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let tensors = layout
            .segments()
            .iter()
            .map(|seg| {
                let bytes: &[u8] = bytemuck::cast_slice(&params[seg.range.clone()]);
                let view = TensorView::new(Dtype::F32, seg.shape.clone(), bytes)?;
                Ok((seg.name.as_str(), view))
            })
            .collect::<Result<Vec<_>>>()?;

        serialize_to_file(tensors, &None, &self.path)?;
        info!(params = params.len(); "saved checkpoint to {}", self.path.display());
        Ok(())
    }

    fn restore(&self, layout: &ParamLayout) -> Result<Vec<f32>> {
        let buffer = fs::read(&self.path)?;
        let tensors = SafeTensors::deserialize(&buffer)?;
        let mut params = Vec::with_capacity(layout.size());

        for seg in layout.segments() {
            let tensor = tensors.tensor(&seg.name)?;
            let mismatch = |reason: String| OrchestratorError::CheckpointMismatch {
                tensor: seg.name.clone(),
                reason,
            };

            if tensor.dtype() != Dtype::F32 {
                return Err(mismatch(format!("expected F32, got {:?}", tensor.dtype())));
            }

            if tensor.shape() != seg.shape.as_slice() {
                return Err(mismatch(format!(
                    "expected shape {:?}, got {:?}",
                    seg.shape,
                    tensor.shape()
                )));
            }

            // The tensor's bytes aren't guaranteed to be aligned for f32.
            params.extend(bytemuck::pod_collect_to_vec::<u8, f32>(tensor.data()));
        }

        info!(params = params.len(); "restored checkpoint from {}", self.path.display());
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ParamLayout {
        ParamLayout::new().push("dense/weights", &[2, 3]).push("dense/bias", &[3])
    }

    #[test]
    fn restores_what_was_saved() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = SafetensorsCheckpoint::new(dir.path().join("nested/model.safetensors"));

        let params: Vec<f32> = (0..9).map(|i| i as f32 * 0.5 - 1.).collect();
        checkpoint.save(&layout(), &params).unwrap();

        assert_eq!(checkpoint.restore(&layout()).unwrap(), params);
    }

    #[test]
    fn layout_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = SafetensorsCheckpoint::new(dir.path().join("model.safetensors"));
        checkpoint.save(&layout(), &[0.; 9]).unwrap();

        let other = ParamLayout::new().push("dense/weights", &[3, 2]).push("dense/bias", &[3]);
        assert!(matches!(
            checkpoint.restore(&other),
            Err(OrchestratorError::CheckpointMismatch { .. })
        ));

        let missing = ParamLayout::new().push("conv/weights", &[9]);
        assert!(matches!(
            checkpoint.restore(&missing),
            Err(OrchestratorError::Checkpoint(_))
        ));
    }

    #[test]
    fn saving_the_wrong_amount_of_params_fails() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = SafetensorsCheckpoint::new(dir.path().join("model.safetensors"));
        assert!(checkpoint.save(&layout(), &[0.; 4]).is_err());
    }
}
