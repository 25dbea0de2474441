//! Inference sessions.
//!
use std::{future::Future, path::Path};

use smallvec::SmallVec;
use tract_onnx::prelude::*;

use crate::{Result, ScanError};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Tensors keyed by input or output name.
pub type NamedTensors = SmallVec<[(String, Tensor); 4]>;

/// Model mapping named input tensors to named output tensors.
pub trait InferSession {
    /// Names of the model outputs, in output order.
    fn output_names(&self) -> &[String];

    /// Run the model on `inputs`.
    ///
    /// Callers await the returned future before issuing the next run.
    fn run(&mut self, inputs: NamedTensors) -> impl Future<Output = Result<NamedTensors>> + Send;
}

/// ONNX model executed with tract.
pub struct TractSession {
    model: Arc<NnModel>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl TractSession {
    /// Load an ONNX model whose single input is a `[1, 3, input_size, input_size]` f32 tensor.
    pub fn load(path: impl AsRef<Path>, input_size: u32) -> Result<Self> {
        let path = path.as_ref();
        let session = load_onnx_model(path, input_size as usize)
            .and_then(Self::from_plan)
            .map_err(|err| ScanError::ModelLoad {
                path: path.to_owned(),
                message: format!("{err:#}"),
            })?;

        log::info!(
            "Loaded model {} with inputs {:?} and outputs {:?}",
            path.display(),
            session.input_names,
            session.output_names
        );

        Ok(session)
    }

    /// Wrap a runnable plan, resolving input and output names from its graph.
    pub fn from_plan(plan: NnModel) -> TractResult<Self> {
        let graph = plan.model();
        let input_names = graph
            .input_outlets()?
            .iter()
            .map(|outlet| graph.node(outlet.node).name.clone())
            .collect();
        let output_names = graph
            .output_outlets()?
            .iter()
            .map(|outlet| match graph.outlet_label(*outlet) {
                Some(label) => label.to_owned(),
                None => graph.node(outlet.node).name.clone(),
            })
            .collect();

        Ok(Self {
            model: Arc::new(plan),
            input_names,
            output_names,
        })
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }
}

impl InferSession for TractSession {
    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    async fn run(&mut self, mut inputs: NamedTensors) -> Result<NamedTensors> {
        let mut ordered = Vec::with_capacity(self.input_names.len());
        for name in self.input_names.iter() {
            let position = inputs
                .iter()
                .position(|(input_name, _)| input_name == name)
                .ok_or_else(|| ScanError::Inference(format!("missing input {name}")))?;
            ordered.push(inputs.remove(position).1);
        }
        if !inputs.is_empty() {
            let unknown: Vec<_> = inputs.iter().map(|(name, _)| name.as_str()).collect();
            return Err(ScanError::Inference(format!("unknown inputs {unknown:?}")));
        }

        // Values produced by a plan are not `Send`, convert back to tensors on the blocking pool
        let model = Arc::clone(&self.model);
        let outputs = tokio::task::spawn_blocking(move || -> TractResult<Vec<Tensor>> {
            let inputs: TVec<TValue> = ordered.into_iter().map(TValue::from).collect();
            let outputs = model.run(inputs)?;
            Ok(outputs.into_iter().map(|value| value.into_tensor()).collect())
        })
        .await
        .map_err(|err| ScanError::Inference(err.to_string()))?
        .map_err(|err| ScanError::Inference(format!("{err:#}")))?;

        Ok(self.output_names.iter().cloned().zip(outputs).collect())
    }
}

fn load_onnx_model(path: &Path, input_size: usize) -> TractResult<NnModel> {
    let shape = tvec!(1, 3, input_size, input_size);
    let input_fact = InferenceFact::dt_shape(f32::datum_type(), shape);
    let model = tract_onnx::onnx()
        .model_for_path(path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}
