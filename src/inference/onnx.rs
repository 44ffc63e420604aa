//! ONNX Runtime model runner

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::{Tensor, ValueType};
use tracing::{info, warn};

use super::local::{ModelLoader, ModelRunner};
use super::RawInferenceOutput;
use crate::{ArgusError, Result};

pub struct OrtRunner {
    session: Session,
    input_size: u32,
}

impl OrtRunner {
    /// Load `path`; the input side comes from the model, `fallback_size` when dynamic.
    pub fn load(path: &Path, fallback_size: u32) -> Result<Self> {
        let load_err = |e: ort::Error| ArgusError::ModelLoad(format!("{}: {}", path.display(), e));
        let session = Session::builder()
            .map_err(load_err)?
            .with_optimization_level(GraphOptimizationLevel::Level2)
            .map_err(load_err)?
            .commit_from_file(path)
            .map_err(load_err)?;

        let reported = session.inputs.first().and_then(|input| match &input.input_type {
            ValueType::Tensor { shape, .. } => shape.get(2).copied().filter(|&d| d > 0),
            _ => None,
        });
        let input_size = match reported {
            Some(side) => side as u32,
            None => {
                warn!(
                    "Model input size is dynamic, using {}x{}",
                    fallback_size, fallback_size
                );
                fallback_size
            }
        };
        info!("Loaded {} ({}x{} input)", path.display(), input_size, input_size);

        Ok(Self {
            session,
            input_size,
        })
    }

    /// Loader for `ModelHandle`.
    pub fn loader(path: PathBuf, fallback_size: u32) -> ModelLoader {
        Arc::new(move || {
            Ok(Box::new(OrtRunner::load(&path, fallback_size)?) as Box<dyn ModelRunner>)
        })
    }
}

impl ModelRunner for OrtRunner {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn run(&mut self, input: &[f32]) -> Result<RawInferenceOutput> {
        let run_err = |e: ort::Error| ArgusError::Inference(e.to_string());
        let s = self.input_size as i64;
        let tensor = Tensor::from_array((vec![1, 3, s, s], input.to_vec())).map_err(run_err)?;
        let outputs = self.session.run(ort::inputs![tensor]).map_err(run_err)?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(run_err)?;
        Ok(RawInferenceOutput {
            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: data.to_vec(),
        })
    }
}
