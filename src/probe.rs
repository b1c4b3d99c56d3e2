use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::backend::{Backend, BackendError, Padding, PoolMode};
use crate::tensor::Tensor;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("numeric consistency: {0}")]
    NumericConsistency(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Offset flags recorded in the emitted document. Backends are free to
/// anchor strided windows at the origin or one cell in; the consuming
/// runtime replays whichever convention these probes observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OffsetProbes {
    pub conv2d_valid_offset_depth_1: bool,
    pub conv2d_same_offset_depth_1: bool,
    pub conv2d_valid_offset_depth_2: bool,
    pub conv2d_same_offset_depth_2: bool,
    pub separable_conv2d_valid_offset_depth_1: bool,
    pub separable_conv2d_same_offset_depth_1: bool,
    pub separable_conv2d_valid_offset_depth_2: bool,
    pub separable_conv2d_same_offset_depth_2: bool,
    pub max_pooling_2d_valid_offset: bool,
    pub max_pooling_2d_same_offset: bool,
    pub average_pooling_2d_valid_offset: bool,
    pub average_pooling_2d_same_offset: bool,
}

const PROBE_WIDTH: usize = 6;
const PROBE_STRIDES: (usize, usize) = (3, 3);

pub fn run_probes(backend: &dyn Backend) -> Result<OffsetProbes, ProbeError> {
    let probes = OffsetProbes {
        conv2d_valid_offset_depth_1: probe_conv2d(backend, 1, Padding::Valid)?,
        conv2d_same_offset_depth_1: probe_conv2d(backend, 1, Padding::Same)?,
        conv2d_valid_offset_depth_2: probe_conv2d(backend, 2, Padding::Valid)?,
        conv2d_same_offset_depth_2: probe_conv2d(backend, 2, Padding::Same)?,
        separable_conv2d_valid_offset_depth_1: probe_separable(backend, 1, Padding::Valid)?,
        separable_conv2d_same_offset_depth_1: probe_separable(backend, 1, Padding::Same)?,
        separable_conv2d_valid_offset_depth_2: probe_separable(backend, 2, Padding::Valid)?,
        separable_conv2d_same_offset_depth_2: probe_separable(backend, 2, Padding::Same)?,
        max_pooling_2d_valid_offset: probe_pool(backend, PoolMode::Max, Padding::Valid)?,
        max_pooling_2d_same_offset: probe_pool(backend, PoolMode::Max, Padding::Same)?,
        average_pooling_2d_valid_offset: probe_pool(backend, PoolMode::Average, Padding::Valid)?,
        average_pooling_2d_same_offset: probe_pool(backend, PoolMode::Average, Padding::Same)?,
    };
    debug!(?probes, "offset probes complete");
    Ok(probes)
}

// A width-6 ramp: position index broadcast across all channels. Sampled at
// stride 3, the surviving values tell us where the backend anchored the
// window.
fn ramp_input(depth: usize) -> Tensor {
    let mut data = Vec::with_capacity(PROBE_WIDTH * depth);
    for i in 0..PROBE_WIDTH {
        data.extend(std::iter::repeat(i as f32).take(depth));
    }
    Tensor::new(vec![1, 1, PROBE_WIDTH, depth], data)
}

// 1x1 kernel reading only the first input channel.
fn first_channel_selector(depth: usize) -> Tensor {
    let mut data = vec![0.0; depth];
    data[0] = 1.0;
    Tensor::new(vec![1, 1, depth, 1], data)
}

fn ones_depthwise(depth: usize) -> Tensor {
    Tensor::new(vec![1, 1, depth, 1], vec![1.0; depth])
}

fn probe_conv2d(backend: &dyn Backend, depth: usize, padding: Padding) -> Result<bool, ProbeError> {
    let output = backend.conv2d(
        &ramp_input(depth),
        &first_channel_selector(depth),
        PROBE_STRIDES,
        padding,
    )?;
    classify("conv2d", padding, &output)
}

fn probe_separable(
    backend: &dyn Backend,
    depth: usize,
    padding: Padding,
) -> Result<bool, ProbeError> {
    let output = backend.separable_conv2d(
        &ramp_input(depth),
        &ones_depthwise(depth),
        &first_channel_selector(depth),
        PROBE_STRIDES,
        padding,
    )?;
    classify("separable_conv2d", padding, &output)
}

fn probe_pool(backend: &dyn Backend, mode: PoolMode, padding: Padding) -> Result<bool, ProbeError> {
    let output = backend.pool2d(&ramp_input(1), mode, (1, 1), PROBE_STRIDES, padding)?;
    let operation = match mode {
        PoolMode::Max => "max_pooling_2d",
        PoolMode::Average => "average_pooling_2d",
    };
    classify(operation, padding, &output)
}

// Only two outcomes are admissible: the window anchored at the origin
// ([0, 3]) or shifted one cell in ([1, 4]). Anything else means the backend
// computes convolutions we cannot describe to the consuming runtime.
fn classify(operation: &str, padding: Padding, output: &Tensor) -> Result<bool, ProbeError> {
    match output.data.as_slice() {
        [a, b] if *a == 0.0 && *b == 3.0 => Ok(false),
        [a, b] if *a == 1.0 && *b == 4.0 => Ok(true),
        other => Err(ProbeError::NumericConsistency(format!(
            "{} {} probe returned {:?}, expected [0, 3] or [1, 4]",
            operation,
            padding.as_str(),
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ImageDataFormat, ReferenceBackend};
    use crate::ir::ModelGraph;

    #[test]
    fn test_reference_backend_reports_no_offsets() {
        let probes = run_probes(&ReferenceBackend).unwrap();
        let expected = OffsetProbes {
            conv2d_valid_offset_depth_1: false,
            conv2d_same_offset_depth_1: false,
            conv2d_valid_offset_depth_2: false,
            conv2d_same_offset_depth_2: false,
            separable_conv2d_valid_offset_depth_1: false,
            separable_conv2d_same_offset_depth_1: false,
            separable_conv2d_valid_offset_depth_2: false,
            separable_conv2d_same_offset_depth_2: false,
            max_pooling_2d_valid_offset: false,
            max_pooling_2d_same_offset: false,
            average_pooling_2d_valid_offset: false,
            average_pooling_2d_same_offset: false,
        };
        assert_eq!(probes, expected);
    }

    #[test]
    fn test_probes_are_deterministic() {
        let first = run_probes(&ReferenceBackend).unwrap();
        let second = run_probes(&ReferenceBackend).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ramp_input_broadcasts_position_over_channels() {
        let ramp = ramp_input(2);
        assert_eq!(ramp.shape, vec![1, 1, 6, 2]);
        assert_eq!(
            ramp.data,
            vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 5.0, 5.0]
        );
    }

    #[test]
    fn test_classify_accepts_shifted_pattern() {
        let shifted = Tensor::new(vec![1, 1, 2, 1], vec![1.0, 4.0]);
        assert!(classify("conv2d", Padding::Valid, &shifted).unwrap());
    }

    struct SkewedBackend;

    impl Backend for SkewedBackend {
        fn name(&self) -> &'static str {
            "skewed"
        }

        fn float_width(&self) -> usize {
            32
        }

        fn image_data_format(&self) -> ImageDataFormat {
            ImageDataFormat::ChannelsLast
        }

        fn materialize(&self, graph: ModelGraph) -> Result<ModelGraph, BackendError> {
            Ok(graph)
        }

        fn predict(
            &self,
            _graph: &ModelGraph,
            _inputs: &[Tensor],
        ) -> Result<Vec<Tensor>, BackendError> {
            Ok(Vec::new())
        }

        fn conv2d(
            &self,
            _input: &Tensor,
            _kernel: &Tensor,
            _strides: (usize, usize),
            _padding: Padding,
        ) -> Result<Tensor, BackendError> {
            Ok(Tensor::new(vec![1, 1, 2, 1], vec![2.0, 5.0]))
        }

        fn separable_conv2d(
            &self,
            _input: &Tensor,
            _depthwise: &Tensor,
            _pointwise: &Tensor,
            _strides: (usize, usize),
            _padding: Padding,
        ) -> Result<Tensor, BackendError> {
            Ok(Tensor::new(vec![1, 1, 2, 1], vec![2.0, 5.0]))
        }

        fn pool2d(
            &self,
            _input: &Tensor,
            _mode: PoolMode,
            _pool: (usize, usize),
            _strides: (usize, usize),
            _padding: Padding,
        ) -> Result<Tensor, BackendError> {
            Ok(Tensor::new(vec![1, 1, 2, 1], vec![2.0, 5.0]))
        }
    }

    #[test]
    fn test_inadmissible_pattern_is_fatal() {
        let err = run_probes(&SkewedBackend).unwrap_err();
        assert!(matches!(err, ProbeError::NumericConsistency(_)));
        assert!(err.to_string().contains("expected [0, 3] or [1, 4]"));
    }
}
