use std::time::Instant;

use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::backend::{Backend, BackendError};
use crate::encode::{encode_tensor, EncodeError, EncodedTensor, FloatEncoding};
use crate::ir::ModelGraph;
use crate::layout::{as_channel_first_3d, LayoutError};
use crate::tensor::Tensor;

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// One recorded forward pass: random inputs and the outputs the backend
/// produced for them, both in canonical 3-tensor form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestFixture {
    pub inputs: Vec<EncodedTensor>,
    pub outputs: Vec<EncodedTensor>,
}

pub fn generate(
    graph: &ModelGraph,
    backend: &dyn Backend,
    encoding: FloatEncoding,
    rng: &mut StdRng,
) -> Result<TestFixture, FixtureError> {
    let mut inputs = Vec::with_capacity(graph.input_layers.len());
    for name in &graph.input_layers {
        let layer = graph.layer(name).ok_or_else(|| {
            FixtureError::Configuration(format!("graph input {} is not a layer", name))
        })?;
        let declared = layer.input_shape.as_ref().ok_or_else(|| {
            FixtureError::Configuration(format!("input layer {} declares no shape", name))
        })?;
        inputs.push(sample_input(name, declared, rng)?);
    }

    let start = Instant::now();
    let outputs = backend.predict(graph, &inputs)?;
    info!(
        seconds = start.elapsed().as_secs_f64(),
        "forward pass complete"
    );

    Ok(TestFixture {
        inputs: canonicalize(&inputs, encoding)?,
        outputs: canonicalize(&outputs, encoding)?,
    })
}

// The verification batch is always a single sample; every other axis must be
// statically known.
fn sample_input(
    name: &str,
    declared: &[Option<usize>],
    rng: &mut StdRng,
) -> Result<Tensor, FixtureError> {
    if declared.is_empty() {
        return Err(FixtureError::Configuration(format!(
            "input layer {} declares an empty shape",
            name
        )));
    }
    let mut dims = Vec::with_capacity(declared.len());
    for (axis, dim) in declared.iter().enumerate() {
        match (axis, dim) {
            (0, _) => dims.push(1),
            (_, Some(d)) => dims.push(*d),
            (_, None) => {
                return Err(FixtureError::Configuration(format!(
                    "input layer {} has an unresolved dimension on axis {}",
                    name, axis
                )))
            }
        }
    }
    let numel = dims.iter().product();
    let data = (0..numel).map(|_| rng.gen::<f32>()).collect();
    Ok(Tensor::new(dims, data))
}

fn canonicalize(
    tensors: &[Tensor],
    encoding: FloatEncoding,
) -> Result<Vec<EncodedTensor>, FixtureError> {
    tensors
        .iter()
        .map(|tensor| {
            let canonical = as_channel_first_3d(tensor)?;
            Ok(encode_tensor(&canonical, encoding)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceBackend;
    use crate::encode::decode_floats;
    use crate::ir::{DeclaredShape, GraphKind, GraphNode, LayerKind, LayerRecord};
    use rand::SeedableRng;
    use serde_json::json;

    fn input_layer(name: &str, shape: DeclaredShape) -> LayerRecord {
        LayerRecord {
            name: name.to_string(),
            class_name: "InputLayer".to_string(),
            kind: LayerKind::Other,
            config: json!({}),
            inbound: Vec::new(),
            input_shape: Some(shape),
            output_shape: None,
            weights: Vec::new(),
        }
    }

    fn identity_graph(shape: DeclaredShape) -> ModelGraph {
        ModelGraph {
            name: "net".to_string(),
            kind: GraphKind::Functional,
            inbound: Vec::new(),
            nodes: vec![GraphNode::Layer(input_layer("in1", shape))],
            input_layers: vec!["in1".to_string()],
            output_layers: vec!["in1".to_string()],
        }
    }

    #[test]
    fn test_generate_is_deterministic_per_seed() {
        let graph = identity_graph(vec![None, Some(4)]);
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let first = generate(&graph, &ReferenceBackend, FloatEncoding::default(), &mut a).unwrap();
        let second = generate(&graph, &ReferenceBackend, FloatEncoding::default(), &mut b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_identity_graph_echoes_inputs() {
        let graph = identity_graph(vec![None, Some(3)]);
        let mut rng = StdRng::seed_from_u64(1);
        let fixture =
            generate(&graph, &ReferenceBackend, FloatEncoding::default(), &mut rng).unwrap();
        assert_eq!(fixture.inputs.len(), 1);
        assert_eq!(fixture.inputs, fixture.outputs);
        // Rank-2 input (1, 3) canonicalizes to (3, 1, 1).
        assert_eq!(fixture.inputs[0].shape, vec![3, 1, 1]);
    }

    #[test]
    fn test_sampled_values_are_unit_interval() {
        let graph = identity_graph(vec![None, Some(8)]);
        let mut rng = StdRng::seed_from_u64(42);
        let fixture =
            generate(&graph, &ReferenceBackend, FloatEncoding::default(), &mut rng).unwrap();
        let values = decode_floats(&fixture.inputs[0].values).unwrap();
        assert_eq!(values.len(), 8);
        assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_image_input_canonicalizes_channel_first() {
        let graph = identity_graph(vec![None, Some(4), Some(5), Some(2)]);
        let mut rng = StdRng::seed_from_u64(3);
        let fixture =
            generate(&graph, &ReferenceBackend, FloatEncoding::default(), &mut rng).unwrap();
        assert_eq!(fixture.inputs[0].shape, vec![2, 4, 5]);
    }

    #[test]
    fn test_unresolved_inner_dimension_is_rejected() {
        let graph = identity_graph(vec![None, Some(4), None, Some(2)]);
        let mut rng = StdRng::seed_from_u64(0);
        let err = generate(&graph, &ReferenceBackend, FloatEncoding::default(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, FixtureError::Configuration(_)));
        assert!(err.to_string().contains("axis 2"));
    }

    #[test]
    fn test_missing_input_shape_is_rejected() {
        let mut graph = identity_graph(vec![None, Some(2)]);
        if let GraphNode::Layer(layer) = &mut graph.nodes[0] {
            layer.input_shape = None;
        }
        let mut rng = StdRng::seed_from_u64(0);
        let err = generate(&graph, &ReferenceBackend, FloatEncoding::default(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, FixtureError::Configuration(_)));
    }
}
