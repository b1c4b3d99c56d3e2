use serde_json::Value;
use thiserror::Error;

use crate::tensor::Tensor;

pub mod normalize;

pub use normalize::normalize;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("duplicate layer name: {0}")]
    DuplicateName(String),
    #[error("non-ascii layer name: {0}")]
    NonAsciiName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Conv1D,
    Conv2D,
    Conv2DTranspose,
    SeparableConv2D,
    Dense,
    BatchNorm,
    Other,
}

impl LayerKind {
    pub fn from_class_name(class_name: &str) -> Self {
        match class_name {
            "Conv1D" => LayerKind::Conv1D,
            "Conv2D" => LayerKind::Conv2D,
            "Conv2DTranspose" => LayerKind::Conv2DTranspose,
            "SeparableConv2D" => LayerKind::SeparableConv2D,
            "Dense" => LayerKind::Dense,
            "BatchNormalization" => LayerKind::BatchNorm,
            _ => LayerKind::Other,
        }
    }
}

// Declared framework shape; None marks the batch (or otherwise dynamic) dimension.
pub type DeclaredShape = Vec<Option<usize>>;

#[derive(Debug, Clone, PartialEq)]
pub struct LayerRecord {
    pub name: String,
    pub class_name: String,
    pub kind: LayerKind,
    pub config: Value,
    pub inbound: Vec<Vec<String>>,
    pub input_shape: Option<DeclaredShape>,
    pub output_shape: Option<DeclaredShape>,
    pub weights: Vec<Tensor>,
}

impl LayerRecord {
    // At most one inbound node group is supported; layer sharing produces more
    // and is outside the conversion contract.
    pub fn single_inbound(&self) -> Result<&[String], GraphError> {
        match self.inbound.len() {
            0 => Ok(&[]),
            1 => Ok(&self.inbound[0]),
            n => Err(GraphError::InvariantViolation(format!(
                "layer {} has {} inbound node groups",
                self.name, n
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Functional,
    Sequential,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    Layer(LayerRecord),
    Composite(ModelGraph),
}

impl GraphNode {
    pub fn name(&self) -> &str {
        match self {
            GraphNode::Layer(layer) => &layer.name,
            GraphNode::Composite(graph) => &graph.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelGraph {
    pub name: String,
    pub kind: GraphKind,
    pub inbound: Vec<Vec<String>>,
    pub nodes: Vec<GraphNode>,
    pub input_layers: Vec<String>,
    pub output_layers: Vec<String>,
}

impl ModelGraph {
    pub fn is_flat(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| matches!(node, GraphNode::Layer(_)))
    }

    pub fn layer(&self, name: &str) -> Option<&LayerRecord> {
        self.nodes.iter().find_map(|node| match node {
            GraphNode::Layer(layer) if layer.name == name => Some(layer),
            _ => None,
        })
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name()).collect()
    }

    // Names must be unique and ASCII across the whole flattened graph.
    pub fn validate_names(&self) -> Result<(), GraphError> {
        let mut seen = std::collections::HashSet::new();
        self.validate_names_into(&mut seen)
    }

    fn validate_names_into<'a>(
        &'a self,
        seen: &mut std::collections::HashSet<&'a str>,
    ) -> Result<(), GraphError> {
        for node in &self.nodes {
            let name = node.name();
            if !name.is_ascii() {
                return Err(GraphError::NonAsciiName(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(GraphError::DuplicateName(name.to_string()));
            }
            if let GraphNode::Composite(graph) = node {
                graph.validate_names_into(seen)?;
            }
        }
        Ok(())
    }
}
