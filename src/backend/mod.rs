use serde::Serialize;
use thiserror::Error;

use crate::ir::ModelGraph;
use crate::tensor::Tensor;

pub mod reference;

pub use reference::ReferenceBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDataFormat {
    ChannelsLast,
    ChannelsFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Valid,
    Same,
}

impl Padding {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "valid" => Some(Padding::Valid),
            "same" => Some(Padding::Same),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Padding::Valid => "valid",
            Padding::Same => "same",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Average,
}

// The source framework, consumed as a capability set: identity and numeric
// configuration, deferred-graph materialization, whole-graph forward passes,
// and the raw strided operations the offset probes exercise.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn float_width(&self) -> usize;
    fn image_data_format(&self) -> ImageDataFormat;

    /// Wires up connectivity the saved representation leaves implicit.
    fn materialize(&self, graph: ModelGraph) -> Result<ModelGraph, BackendError>;

    /// One forward pass over a flat graph; inputs pair up with the graph's
    /// declared input layers in order.
    fn predict(&self, graph: &ModelGraph, inputs: &[Tensor]) -> Result<Vec<Tensor>, BackendError>;

    fn conv2d(
        &self,
        input: &Tensor,
        kernel: &Tensor,
        strides: (usize, usize),
        padding: Padding,
    ) -> Result<Tensor, BackendError>;

    fn separable_conv2d(
        &self,
        input: &Tensor,
        depthwise: &Tensor,
        pointwise: &Tensor,
        strides: (usize, usize),
        padding: Padding,
    ) -> Result<Tensor, BackendError>;

    fn pool2d(
        &self,
        input: &Tensor,
        mode: PoolMode,
        pool: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
    ) -> Result<Tensor, BackendError>;
}
