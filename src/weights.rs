use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::backend::Padding;
use crate::encode::{encode_floats, EncodeError, EncodedValues, FloatEncoding};
use crate::ir::{GraphNode, LayerKind, LayerRecord, ModelGraph};
use crate::layout::{self, LayoutError};

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("duplicate layer name {0}")]
    DuplicateName(String),
    #[error("non-ascii layer name {0}")]
    NonAsciiName(String),
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Per-layer parameter payload as the consuming runtime reads it. Filters are
/// stored pre-permuted and flattened; batch norm statistics keep their
/// framework names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WeightPayload {
    Separable {
        slice_weights: EncodedValues,
        stack_weights: EncodedValues,
        #[serde(skip_serializing_if = "Option::is_none")]
        bias: Option<EncodedValues>,
    },
    BatchNorm {
        moving_mean: EncodedValues,
        moving_variance: EncodedValues,
        #[serde(skip_serializing_if = "Option::is_none")]
        beta: Option<EncodedValues>,
        #[serde(skip_serializing_if = "Option::is_none")]
        gamma: Option<EncodedValues>,
    },
    Filter {
        weights: EncodedValues,
        #[serde(skip_serializing_if = "Option::is_none")]
        bias: Option<EncodedValues>,
    },
}

/// Walk the graph and build the name-to-payload map for every
/// parameter-bearing layer. Names must be ascii and unique against every
/// previously seen payload; layers without parameters contribute nothing but
/// still participate in the collision check.
pub fn collect(
    graph: &ModelGraph,
    encoding: FloatEncoding,
) -> Result<BTreeMap<String, WeightPayload>, WeightError> {
    let mut result = BTreeMap::new();
    collect_into(graph, encoding, &mut result)?;
    Ok(result)
}

fn collect_into(
    graph: &ModelGraph,
    encoding: FloatEncoding,
    result: &mut BTreeMap<String, WeightPayload>,
) -> Result<(), WeightError> {
    for node in &graph.nodes {
        match node {
            GraphNode::Composite(sub) => collect_into(sub, encoding, result)?,
            GraphNode::Layer(layer) => {
                if !layer.name.is_ascii() {
                    return Err(WeightError::NonAsciiName(layer.name.clone()));
                }
                if result.contains_key(&layer.name) {
                    return Err(WeightError::DuplicateName(layer.name.clone()));
                }
                if let Some(payload) = payload_for(layer, encoding)? {
                    result.insert(layer.name.clone(), payload);
                }
            }
        }
    }
    Ok(())
}

fn payload_for(
    layer: &LayerRecord,
    encoding: FloatEncoding,
) -> Result<Option<WeightPayload>, WeightError> {
    match layer.kind {
        LayerKind::Conv1D => conv1d_payload(layer, encoding).map(Some),
        LayerKind::Conv2D | LayerKind::Conv2DTranspose => {
            conv2d_payload(layer, encoding).map(Some)
        }
        LayerKind::SeparableConv2D => separable_payload(layer, encoding).map(Some),
        LayerKind::BatchNorm => batch_norm_payload(layer, encoding).map(Some),
        LayerKind::Dense => dense_payload(layer, encoding).map(Some),
        LayerKind::Other => Ok(None),
    }
}

fn conv1d_payload(
    layer: &LayerRecord,
    encoding: FloatEncoding,
) -> Result<WeightPayload, WeightError> {
    expect_weight_count(layer, 1..=2)?;
    check_padding(layer)?;
    check_conv_input_shape(layer, 3)?;
    let kernel = layout::conv1d_kernel(&layer.weights[0])?;
    Ok(WeightPayload::Filter {
        weights: encode_floats(&kernel.data, encoding)?,
        bias: bias_values(layer, 1, encoding)?,
    })
}

fn conv2d_payload(
    layer: &LayerRecord,
    encoding: FloatEncoding,
) -> Result<WeightPayload, WeightError> {
    expect_weight_count(layer, 1..=2)?;
    check_padding(layer)?;
    check_conv_input_shape(layer, 4)?;
    let kernel = layout::conv2d_kernel(&layer.weights[0])?;
    Ok(WeightPayload::Filter {
        weights: encode_floats(&kernel.data, encoding)?,
        bias: bias_values(layer, 1, encoding)?,
    })
}

fn separable_payload(
    layer: &LayerRecord,
    encoding: FloatEncoding,
) -> Result<WeightPayload, WeightError> {
    expect_weight_count(layer, 2..=3)?;
    check_padding(layer)?;
    check_conv_input_shape(layer, 4)?;
    let (depthwise, pointwise) = layout::separable_kernels(&layer.weights[0], &layer.weights[1])?;
    Ok(WeightPayload::Separable {
        slice_weights: encode_floats(&depthwise.data, encoding)?,
        stack_weights: encode_floats(&pointwise.data, encoding)?,
        bias: bias_values(layer, 2, encoding)?,
    })
}

fn batch_norm_payload(
    layer: &LayerRecord,
    encoding: FloatEncoding,
) -> Result<WeightPayload, WeightError> {
    let center = cfg_flag(layer, "center");
    let scale = cfg_flag(layer, "scale");
    let expected = 2 + usize::from(center) + usize::from(scale);
    if layer.weights.len() != expected {
        return Err(WeightError::UnsupportedShape(format!(
            "batch norm layer {} carries {} weight tensors, expected {}",
            layer.name,
            layer.weights.len(),
            expected
        )));
    }
    // Framework order: gamma (iff scale), beta (iff center), mean, variance.
    let (gamma, next) = if scale {
        (Some(&layer.weights[0]), 1)
    } else {
        (None, 0)
    };
    let (beta, next) = if center {
        (Some(&layer.weights[next]), next + 1)
    } else {
        (None, next)
    };
    Ok(WeightPayload::BatchNorm {
        moving_mean: encode_floats(&layer.weights[next].data, encoding)?,
        moving_variance: encode_floats(&layer.weights[next + 1].data, encoding)?,
        beta: encode_optional(beta, encoding)?,
        gamma: encode_optional(gamma, encoding)?,
    })
}

fn dense_payload(
    layer: &LayerRecord,
    encoding: FloatEncoding,
) -> Result<WeightPayload, WeightError> {
    expect_weight_count(layer, 1..=2)?;
    let declared = layer.input_shape.as_ref().ok_or_else(|| {
        WeightError::UnsupportedShape(format!(
            "dense layer {} declares no input shape",
            layer.name
        ))
    })?;
    let matrix = layout::dense_matrix(&layer.weights[0], declared)?;
    Ok(WeightPayload::Filter {
        weights: encode_floats(&matrix.data, encoding)?,
        bias: bias_values(layer, 1, encoding)?,
    })
}

fn expect_weight_count(
    layer: &LayerRecord,
    expected: RangeInclusive<usize>,
) -> Result<(), WeightError> {
    if !expected.contains(&layer.weights.len()) {
        return Err(WeightError::UnsupportedShape(format!(
            "layer {} carries {} weight tensors",
            layer.name,
            layer.weights.len()
        )));
    }
    Ok(())
}

fn check_padding(layer: &LayerRecord) -> Result<(), WeightError> {
    let raw = layer
        .config
        .get("padding")
        .and_then(Value::as_str)
        .unwrap_or("valid");
    if Padding::parse(raw).is_none() {
        return Err(WeightError::UnsupportedFeature(format!(
            "layer {} uses padding mode {}",
            layer.name, raw
        )));
    }
    Ok(())
}

// Archives may omit inferred shapes on inner layers; when one is declared it
// must be a channels-last image shape with an open batch axis.
fn check_conv_input_shape(layer: &LayerRecord, rank: usize) -> Result<(), WeightError> {
    if let Some(shape) = &layer.input_shape {
        if shape.len() != rank || shape.first() != Some(&None) {
            return Err(WeightError::UnsupportedShape(format!(
                "layer {} declares input shape {:?}, expected rank {} with open batch",
                layer.name, shape, rank
            )));
        }
    }
    Ok(())
}

fn cfg_flag(layer: &LayerRecord, key: &str) -> bool {
    layer
        .config
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

fn bias_values(
    layer: &LayerRecord,
    index: usize,
    encoding: FloatEncoding,
) -> Result<Option<EncodedValues>, WeightError> {
    encode_optional(layer.weights.get(index), encoding)
}

fn encode_optional(
    tensor: Option<&crate::tensor::Tensor>,
    encoding: FloatEncoding,
) -> Result<Option<EncodedValues>, WeightError> {
    tensor
        .map(|t| encode_floats(&t.data, encoding))
        .transpose()
        .map_err(WeightError::from)
}
