use std::collections::HashMap;

use serde_json::Value;

use crate::backend::{Backend, BackendError, ImageDataFormat, Padding, PoolMode};
use crate::ir::{GraphKind, GraphNode, LayerRecord, ModelGraph};
use crate::tensor::Tensor;

// Single-threaded CPU evaluator implementing the layer semantics the
// consuming runtime defines: channel-last tensors, floor-split "same"
// padding, inference-mode batch norm.
pub struct ReferenceBackend;

impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn float_width(&self) -> usize {
        32
    }

    fn image_data_format(&self) -> ImageDataFormat {
        ImageDataFormat::ChannelsLast
    }

    fn materialize(&self, mut graph: ModelGraph) -> Result<ModelGraph, BackendError> {
        let mut nodes = Vec::with_capacity(graph.nodes.len());
        for node in graph.nodes {
            nodes.push(match node {
                GraphNode::Composite(sub) => GraphNode::Composite(self.materialize(sub)?),
                layer => layer,
            });
        }
        graph.nodes = nodes;

        // A Sequential save without declared inputs is a deferred linear
        // chain: wire each node to its predecessor, first in, last out.
        if graph.kind == GraphKind::Sequential
            && graph.input_layers.is_empty()
            && !graph.nodes.is_empty()
        {
            let names: Vec<String> = graph.nodes.iter().map(|n| n.name().to_string()).collect();
            for (i, node) in graph.nodes.iter_mut().enumerate().skip(1) {
                let inbound = match node {
                    GraphNode::Layer(layer) => &mut layer.inbound,
                    GraphNode::Composite(sub) => &mut sub.inbound,
                };
                if inbound.is_empty() {
                    *inbound = vec![vec![names[i - 1].clone()]];
                }
            }
            graph.input_layers = vec![names[0].clone()];
            graph.output_layers = vec![names[names.len() - 1].clone()];
        }
        Ok(graph)
    }

    fn predict(&self, graph: &ModelGraph, inputs: &[Tensor]) -> Result<Vec<Tensor>, BackendError> {
        if inputs.len() != graph.input_layers.len() {
            return Err(BackendError::InvariantViolation(format!(
                "graph {} declares {} inputs, received {}",
                graph.name,
                graph.input_layers.len(),
                inputs.len()
            )));
        }
        let mut layers = Vec::new();
        for node in &graph.nodes {
            match node {
                GraphNode::Layer(layer) => layers.push(layer),
                GraphNode::Composite(sub) => {
                    return Err(BackendError::InvariantViolation(format!(
                        "graph {} still nests composite {}",
                        graph.name, sub.name
                    )))
                }
            }
        }
        let provided: HashMap<&str, &Tensor> = graph
            .input_layers
            .iter()
            .map(String::as_str)
            .zip(inputs)
            .collect();

        let mut computed: HashMap<&str, Tensor> = HashMap::new();
        while computed.len() < layers.len() {
            let mut progressed = false;
            for layer in &layers {
                if computed.contains_key(layer.name.as_str()) {
                    continue;
                }
                let group = layer
                    .single_inbound()
                    .map_err(|e| BackendError::InvariantViolation(e.to_string()))?;
                let operands: Vec<Tensor> = if group.is_empty() {
                    match provided.get(layer.name.as_str()) {
                        Some(tensor) => vec![(*tensor).clone()],
                        None => {
                            return Err(BackendError::InvariantViolation(format!(
                                "layer {} has no inbound connection and is not a graph input",
                                layer.name
                            )))
                        }
                    }
                } else {
                    let mut resolved = Vec::with_capacity(group.len());
                    for name in group {
                        match computed.get(name.as_str()) {
                            Some(tensor) => resolved.push(tensor.clone()),
                            None => break,
                        }
                    }
                    if resolved.len() != group.len() {
                        continue;
                    }
                    resolved
                };
                let output = self.eval_layer(layer, &operands)?;
                computed.insert(layer.name.as_str(), output);
                progressed = true;
            }
            if !progressed {
                return Err(BackendError::InvariantViolation(format!(
                    "graph {} evaluation cannot make progress",
                    graph.name
                )));
            }
        }

        graph
            .output_layers
            .iter()
            .map(|name| {
                computed.get(name.as_str()).cloned().ok_or_else(|| {
                    BackendError::InvariantViolation(format!(
                        "graph output {} was never computed",
                        name
                    ))
                })
            })
            .collect()
    }

    fn conv2d(
        &self,
        input: &Tensor,
        kernel: &Tensor,
        strides: (usize, usize),
        padding: Padding,
    ) -> Result<Tensor, BackendError> {
        conv2d_raw(input, kernel, strides, padding)
    }

    fn separable_conv2d(
        &self,
        input: &Tensor,
        depthwise: &Tensor,
        pointwise: &Tensor,
        strides: (usize, usize),
        padding: Padding,
    ) -> Result<Tensor, BackendError> {
        separable_conv2d_raw(input, depthwise, pointwise, strides, padding)
    }

    fn pool2d(
        &self,
        input: &Tensor,
        mode: PoolMode,
        pool: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
    ) -> Result<Tensor, BackendError> {
        pool2d_raw(input, mode, pool, strides, padding)
    }
}

impl ReferenceBackend {
    fn eval_layer(&self, layer: &LayerRecord, operands: &[Tensor]) -> Result<Tensor, BackendError> {
        match layer.class_name.as_str() {
            "InputLayer" | "Dropout" => Ok(single(layer, operands)?.clone()),
            "Activation" => {
                let input = single(layer, operands)?.clone();
                apply_activation(cfg_str(&layer.config, "activation").unwrap_or("linear"), input)
            }
            "Flatten" => {
                let input = single(layer, operands)?;
                if input.shape.first() != Some(&1) {
                    return Err(BackendError::UnsupportedShape(format!(
                        "flatten layer {} expects a single-batch tensor, got {:?}",
                        layer.name, input.shape
                    )));
                }
                Ok(input.reshaped(vec![1, input.numel()]))
            }
            "Add" => {
                if operands.len() < 2 {
                    return Err(BackendError::InvariantViolation(format!(
                        "add layer {} needs at least two upstream tensors",
                        layer.name
                    )));
                }
                let mut out = operands[0].clone();
                for other in &operands[1..] {
                    if other.shape != out.shape {
                        return Err(BackendError::UnsupportedShape(format!(
                            "add layer {} mixes shapes {:?} and {:?}",
                            layer.name, out.shape, other.shape
                        )));
                    }
                    for (o, v) in out.data.iter_mut().zip(&other.data) {
                        *o += v;
                    }
                }
                Ok(out)
            }
            "Conv1D" => self.eval_conv1d(layer, single(layer, operands)?),
            "Conv2D" => self.eval_conv2d(layer, single(layer, operands)?, false),
            "Conv2DTranspose" => self.eval_conv2d(layer, single(layer, operands)?, true),
            "SeparableConv2D" => self.eval_separable(layer, single(layer, operands)?),
            "Dense" => self.eval_dense(layer, single(layer, operands)?),
            "BatchNormalization" => self.eval_batch_norm(layer, single(layer, operands)?),
            "MaxPooling2D" => self.eval_pool(layer, single(layer, operands)?, PoolMode::Max),
            "AveragePooling2D" => {
                self.eval_pool(layer, single(layer, operands)?, PoolMode::Average)
            }
            other => Err(BackendError::UnsupportedFeature(format!(
                "cannot evaluate layer {} of type {}",
                layer.name, other
            ))),
        }
    }

    fn eval_conv2d(
        &self,
        layer: &LayerRecord,
        input: &Tensor,
        transpose: bool,
    ) -> Result<Tensor, BackendError> {
        let kernel = kernel_of(layer)?;
        let strides = cfg_pair(&layer.config, "strides").unwrap_or((1, 1));
        let padding = padding_from(&layer.config)?;
        let mut out = if transpose {
            conv2d_transpose_raw(input, kernel, strides, padding)?
        } else {
            conv2d_raw(input, kernel, strides, padding)?
        };
        if let Some(bias) = layer.weights.get(1) {
            add_channel_bias(&mut out, bias)?;
        }
        apply_activation(cfg_str(&layer.config, "activation").unwrap_or("linear"), out)
    }

    // A 1D convolution is a 2D convolution over a unit-height image.
    fn eval_conv1d(&self, layer: &LayerRecord, input: &Tensor) -> Result<Tensor, BackendError> {
        if input.rank() != 3 || input.shape[0] != 1 {
            return Err(BackendError::UnsupportedShape(format!(
                "conv1d layer {} expects a single-batch rank-3 tensor, got {:?}",
                layer.name, input.shape
            )));
        }
        let kernel = kernel_of(layer)?;
        if kernel.rank() != 3 {
            return Err(BackendError::UnsupportedShape(format!(
                "conv1d layer {} has a rank-{} kernel",
                layer.name,
                kernel.rank()
            )));
        }
        let stride = cfg_pair(&layer.config, "strides").map(|(s, _)| s).unwrap_or(1);
        let padding = padding_from(&layer.config)?;

        let lifted_in = input.reshaped(vec![1, 1, input.shape[1], input.shape[2]]);
        let mut lifted_kernel_shape = vec![1];
        lifted_kernel_shape.extend_from_slice(&kernel.shape);
        let lifted_kernel = kernel.reshaped(lifted_kernel_shape);

        let mut out = conv2d_raw(&lifted_in, &lifted_kernel, (1, stride), padding)?;
        if let Some(bias) = layer.weights.get(1) {
            add_channel_bias(&mut out, bias)?;
        }
        let out = out.reshaped(vec![1, out.shape[2], out.shape[3]]);
        apply_activation(cfg_str(&layer.config, "activation").unwrap_or("linear"), out)
    }

    fn eval_separable(&self, layer: &LayerRecord, input: &Tensor) -> Result<Tensor, BackendError> {
        if layer.weights.len() < 2 {
            return Err(BackendError::InvariantViolation(format!(
                "separable conv layer {} carries {} weight tensors, expected at least 2",
                layer.name,
                layer.weights.len()
            )));
        }
        let strides = cfg_pair(&layer.config, "strides").unwrap_or((1, 1));
        let padding = padding_from(&layer.config)?;
        let mut out =
            separable_conv2d_raw(input, &layer.weights[0], &layer.weights[1], strides, padding)?;
        if let Some(bias) = layer.weights.get(2) {
            add_channel_bias(&mut out, bias)?;
        }
        apply_activation(cfg_str(&layer.config, "activation").unwrap_or("linear"), out)
    }

    fn eval_dense(&self, layer: &LayerRecord, input: &Tensor) -> Result<Tensor, BackendError> {
        let weights = kernel_of(layer)?;
        let mut out = dense_raw(input, weights)?;
        if let Some(bias) = layer.weights.get(1) {
            add_channel_bias(&mut out, bias)?;
        }
        apply_activation(cfg_str(&layer.config, "activation").unwrap_or("linear"), out)
    }

    fn eval_batch_norm(&self, layer: &LayerRecord, input: &Tensor) -> Result<Tensor, BackendError> {
        let center = cfg_bool(&layer.config, "center", true);
        let scale = cfg_bool(&layer.config, "scale", true);
        let epsilon = cfg_f32(&layer.config, "epsilon", 1e-3);
        let expected = 2 + usize::from(center) + usize::from(scale);
        if layer.weights.len() != expected {
            return Err(BackendError::UnsupportedFeature(format!(
                "batch norm layer {} carries {} weight tensors, expected {}",
                layer.name,
                layer.weights.len(),
                expected
            )));
        }
        // Framework weight order: gamma (iff scale), beta (iff center),
        // moving mean, moving variance.
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
        batch_norm_raw(
            input,
            &layer.weights[next],
            &layer.weights[next + 1],
            beta,
            gamma,
            epsilon,
        )
    }

    fn eval_pool(
        &self,
        layer: &LayerRecord,
        input: &Tensor,
        mode: PoolMode,
    ) -> Result<Tensor, BackendError> {
        let pool = cfg_pair(&layer.config, "pool_size").unwrap_or((2, 2));
        let strides = cfg_pair(&layer.config, "strides").unwrap_or(pool);
        let padding = padding_from(&layer.config)?;
        pool2d_raw(input, mode, pool, strides, padding)
    }
}

fn single<'a>(layer: &LayerRecord, operands: &'a [Tensor]) -> Result<&'a Tensor, BackendError> {
    match operands {
        [one] => Ok(one),
        _ => Err(BackendError::InvariantViolation(format!(
            "layer {} expects one upstream tensor, got {}",
            layer.name,
            operands.len()
        ))),
    }
}

fn kernel_of(layer: &LayerRecord) -> Result<&Tensor, BackendError> {
    layer.weights.first().ok_or_else(|| {
        BackendError::InvariantViolation(format!("layer {} carries no kernel tensor", layer.name))
    })
}

fn spatial_dims(input: &Tensor) -> Result<(usize, usize, usize), BackendError> {
    if input.rank() != 4 || input.shape[0] != 1 {
        return Err(BackendError::UnsupportedShape(format!(
            "expected a single-batch rank-4 tensor, got shape {:?}",
            input.shape
        )));
    }
    Ok((input.shape[1], input.shape[2], input.shape[3]))
}

// Output extent and leading pad for one axis. "Same" padding splits the total
// by flooring the leading side, matching the probed backend convention.
fn window_dims(
    extent: usize,
    window: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize), BackendError> {
    match padding {
        Padding::Valid => {
            if extent < window {
                return Err(BackendError::UnsupportedShape(format!(
                    "window {} exceeds input extent {} under valid padding",
                    window, extent
                )));
            }
            Ok(((extent - window) / stride + 1, 0))
        }
        Padding::Same => {
            let out = (extent + stride - 1) / stride;
            let total = ((out - 1) * stride + window).saturating_sub(extent);
            Ok((out, total / 2))
        }
    }
}

fn conv2d_raw(
    input: &Tensor,
    kernel: &Tensor,
    strides: (usize, usize),
    padding: Padding,
) -> Result<Tensor, BackendError> {
    let (h, w, cin) = spatial_dims(input)?;
    if kernel.rank() != 4 || kernel.shape[2] != cin {
        return Err(BackendError::UnsupportedShape(format!(
            "kernel shape {:?} does not fit input with {} channels",
            kernel.shape, cin
        )));
    }
    let (kh, kw, cout) = (kernel.shape[0], kernel.shape[1], kernel.shape[3]);
    let (sh, sw) = strides;
    let (oh, pad_top) = window_dims(h, kh, sh, padding)?;
    let (ow, pad_left) = window_dims(w, kw, sw, padding)?;

    let mut out = Tensor::zeros(vec![1, oh, ow, cout]);
    for oy in 0..oh {
        for ox in 0..ow {
            for ky in 0..kh {
                let iy = (oy * sh + ky) as isize - pad_top as isize;
                if iy < 0 || iy >= h as isize {
                    continue;
                }
                for kx in 0..kw {
                    let ix = (ox * sw + kx) as isize - pad_left as isize;
                    if ix < 0 || ix >= w as isize {
                        continue;
                    }
                    let in_base = (iy as usize * w + ix as usize) * cin;
                    let k_base = (ky * kw + kx) * cin;
                    let out_base = (oy * ow + ox) * cout;
                    for ic in 0..cin {
                        let iv = input.data[in_base + ic];
                        for oc in 0..cout {
                            out.data[out_base + oc] += iv * kernel.data[(k_base + ic) * cout + oc];
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

// Fractionally-strided convolution: scatter each input value through the
// kernel, then crop to the "same" extent where requested.
fn conv2d_transpose_raw(
    input: &Tensor,
    kernel: &Tensor,
    strides: (usize, usize),
    padding: Padding,
) -> Result<Tensor, BackendError> {
    let (h, w, cin) = spatial_dims(input)?;
    if kernel.rank() != 4 || kernel.shape[2] != cin {
        return Err(BackendError::UnsupportedShape(format!(
            "transpose kernel shape {:?} does not fit input with {} channels",
            kernel.shape, cin
        )));
    }
    let (kh, kw, cout) = (kernel.shape[0], kernel.shape[1], kernel.shape[3]);
    let (sh, sw) = strides;
    let full_h = (h - 1) * sh + kh;
    let full_w = (w - 1) * sw + kw;
    let (oh, crop_top) = match padding {
        Padding::Valid => (full_h, 0),
        Padding::Same => (h * sh, full_h.saturating_sub(h * sh) / 2),
    };
    let (ow, crop_left) = match padding {
        Padding::Valid => (full_w, 0),
        Padding::Same => (w * sw, full_w.saturating_sub(w * sw) / 2),
    };

    let mut out = Tensor::zeros(vec![1, oh, ow, cout]);
    for iy in 0..h {
        for ix in 0..w {
            let in_base = (iy * w + ix) * cin;
            for ky in 0..kh {
                let oy = (iy * sh + ky) as isize - crop_top as isize;
                if oy < 0 || oy >= oh as isize {
                    continue;
                }
                for kx in 0..kw {
                    let ox = (ix * sw + kx) as isize - crop_left as isize;
                    if ox < 0 || ox >= ow as isize {
                        continue;
                    }
                    let k_base = (ky * kw + kx) * cin;
                    let out_base = (oy as usize * ow + ox as usize) * cout;
                    for ic in 0..cin {
                        let iv = input.data[in_base + ic];
                        for oc in 0..cout {
                            out.data[out_base + oc] += iv * kernel.data[(k_base + ic) * cout + oc];
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

fn separable_conv2d_raw(
    input: &Tensor,
    depthwise: &Tensor,
    pointwise: &Tensor,
    strides: (usize, usize),
    padding: Padding,
) -> Result<Tensor, BackendError> {
    let (h, w, cin) = spatial_dims(input)?;
    if depthwise.rank() != 4 || depthwise.shape[2] != cin {
        return Err(BackendError::UnsupportedShape(format!(
            "depthwise kernel shape {:?} does not fit input with {} channels",
            depthwise.shape, cin
        )));
    }
    if depthwise.shape[3] != 1 {
        return Err(BackendError::UnsupportedFeature(format!(
            "separable conv depth multiplier {} (only 1 is supported)",
            depthwise.shape[3]
        )));
    }
    let (kh, kw) = (depthwise.shape[0], depthwise.shape[1]);
    let (sh, sw) = strides;
    let (oh, pad_top) = window_dims(h, kh, sh, padding)?;
    let (ow, pad_left) = window_dims(w, kw, sw, padding)?;

    // Stride and padding apply to the depthwise stage; the pointwise 1x1
    // convolution then mixes channels at stride one.
    let mut mixed = Tensor::zeros(vec![1, oh, ow, cin]);
    for oy in 0..oh {
        for ox in 0..ow {
            for ky in 0..kh {
                let iy = (oy * sh + ky) as isize - pad_top as isize;
                if iy < 0 || iy >= h as isize {
                    continue;
                }
                for kx in 0..kw {
                    let ix = (ox * sw + kx) as isize - pad_left as isize;
                    if ix < 0 || ix >= w as isize {
                        continue;
                    }
                    let in_base = (iy as usize * w + ix as usize) * cin;
                    let k_base = (ky * kw + kx) * cin;
                    let out_base = (oy * ow + ox) * cin;
                    for c in 0..cin {
                        mixed.data[out_base + c] +=
                            input.data[in_base + c] * depthwise.data[k_base + c];
                    }
                }
            }
        }
    }
    conv2d_raw(&mixed, pointwise, (1, 1), Padding::Valid)
}

fn pool2d_raw(
    input: &Tensor,
    mode: PoolMode,
    pool: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
) -> Result<Tensor, BackendError> {
    let (h, w, c) = spatial_dims(input)?;
    let (ph, pw) = pool;
    let (sh, sw) = strides;
    let (oh, pad_top) = window_dims(h, ph, sh, padding)?;
    let (ow, pad_left) = window_dims(w, pw, sw, padding)?;

    let mut out = Tensor::zeros(vec![1, oh, ow, c]);
    for oy in 0..oh {
        for ox in 0..ow {
            for ch in 0..c {
                let mut acc: Option<f32> = None;
                let mut count = 0usize;
                for ky in 0..ph {
                    let iy = (oy * sh + ky) as isize - pad_top as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kx in 0..pw {
                        let ix = (ox * sw + kx) as isize - pad_left as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        let value = input.data[(iy as usize * w + ix as usize) * c + ch];
                        acc = Some(match (mode, acc) {
                            (_, None) => value,
                            (PoolMode::Max, Some(prev)) => prev.max(value),
                            (PoolMode::Average, Some(prev)) => prev + value,
                        });
                        count += 1;
                    }
                }
                // Padded cells never participate; averages divide by the
                // number of in-bounds cells only.
                let pooled = match (mode, acc) {
                    (_, None) => {
                        return Err(BackendError::InvariantViolation(format!(
                            "pool window at ({}, {}) covers no input cells",
                            oy, ox
                        )))
                    }
                    (PoolMode::Max, Some(value)) => value,
                    (PoolMode::Average, Some(sum)) => sum / count as f32,
                };
                out.data[(oy * ow + ox) * c + ch] = pooled;
            }
        }
    }
    Ok(out)
}

fn dense_raw(input: &Tensor, weights: &Tensor) -> Result<Tensor, BackendError> {
    if input.rank() < 2 || input.shape[0] != 1 {
        return Err(BackendError::UnsupportedShape(format!(
            "dense input must be a single-batch tensor, got shape {:?}",
            input.shape
        )));
    }
    if weights.rank() != 2 || weights.shape[0] != input.numel() {
        return Err(BackendError::UnsupportedShape(format!(
            "dense weights {:?} do not fit flattened input of {} values",
            weights.shape,
            input.numel()
        )));
    }
    let (n, units) = (weights.shape[0], weights.shape[1]);
    let mut out = Tensor::zeros(vec![1, units]);
    for i in 0..n {
        let x = input.data[i];
        for j in 0..units {
            out.data[j] += x * weights.data[i * units + j];
        }
    }
    Ok(out)
}

fn batch_norm_raw(
    input: &Tensor,
    mean: &Tensor,
    variance: &Tensor,
    beta: Option<&Tensor>,
    gamma: Option<&Tensor>,
    epsilon: f32,
) -> Result<Tensor, BackendError> {
    let channels = *input.shape.last().ok_or_else(|| {
        BackendError::UnsupportedShape("batch norm input has no axes".to_string())
    })?;
    for (name, vector) in [("mean", Some(mean)), ("variance", Some(variance)), ("beta", beta), ("gamma", gamma)] {
        if let Some(vector) = vector {
            if vector.numel() != channels {
                return Err(BackendError::UnsupportedShape(format!(
                    "batch norm {} has {} values for {} channels",
                    name,
                    vector.numel(),
                    channels
                )));
            }
        }
    }
    let mut out = input.clone();
    for (i, value) in out.data.iter_mut().enumerate() {
        let c = i % channels;
        let normalized = (*value - mean.data[c]) / (variance.data[c] + epsilon).sqrt();
        let scaled = gamma.map_or(normalized, |g| normalized * g.data[c]);
        *value = beta.map_or(scaled, |b| scaled + b.data[c]);
    }
    Ok(out)
}

fn add_channel_bias(tensor: &mut Tensor, bias: &Tensor) -> Result<(), BackendError> {
    let channels = *tensor.shape.last().ok_or_else(|| {
        BackendError::UnsupportedShape("bias target has no axes".to_string())
    })?;
    if bias.numel() != channels {
        return Err(BackendError::UnsupportedShape(format!(
            "bias of {} values does not fit {} output channels",
            bias.numel(),
            channels
        )));
    }
    for (i, value) in tensor.data.iter_mut().enumerate() {
        *value += bias.data[i % channels];
    }
    Ok(())
}

fn apply_activation(name: &str, mut tensor: Tensor) -> Result<Tensor, BackendError> {
    match name {
        "linear" => Ok(tensor),
        "relu" => {
            for v in &mut tensor.data {
                *v = v.max(0.0);
            }
            Ok(tensor)
        }
        "sigmoid" => {
            for v in &mut tensor.data {
                *v = 1.0 / (1.0 + (-*v).exp());
            }
            Ok(tensor)
        }
        "tanh" => {
            for v in &mut tensor.data {
                *v = v.tanh();
            }
            Ok(tensor)
        }
        "softmax" => {
            let width = tensor.shape.last().copied().unwrap_or(1).max(1);
            for row in tensor.data.chunks_mut(width) {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for v in row.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                for v in row.iter_mut() {
                    *v /= sum;
                }
            }
            Ok(tensor)
        }
        other => Err(BackendError::UnsupportedFeature(format!(
            "activation {}",
            other
        ))),
    }
}

fn cfg_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

fn cfg_bool(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn cfg_f32(config: &Value, key: &str, default: f32) -> f32 {
    config
        .get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .unwrap_or(default)
}

// Window parameters: either a bare integer or a one/two-element list.
fn cfg_pair(config: &Value, key: &str) -> Option<(usize, usize)> {
    match config.get(key)? {
        Value::Number(n) => {
            let v = n.as_u64()? as usize;
            Some((v, v))
        }
        Value::Array(items) => match items.as_slice() {
            [a] => {
                let v = a.as_u64()? as usize;
                Some((v, v))
            }
            [a, b] => Some((a.as_u64()? as usize, b.as_u64()? as usize)),
            _ => None,
        },
        _ => None,
    }
}

fn padding_from(config: &Value) -> Result<Padding, BackendError> {
    match cfg_str(config, "padding") {
        None => Ok(Padding::Valid),
        Some(raw) => Padding::parse(raw)
            .ok_or_else(|| BackendError::UnsupportedFeature(format!("padding mode {}", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::LayerKind;
    use serde_json::json;

    fn image(h: usize, w: usize, c: usize, data: Vec<f32>) -> Tensor {
        Tensor::new(vec![1, h, w, c], data)
    }

    fn layer(name: &str, class_name: &str, config: Value, weights: Vec<Tensor>) -> LayerRecord {
        LayerRecord {
            name: name.to_string(),
            class_name: class_name.to_string(),
            kind: LayerKind::from_class_name(class_name),
            config,
            inbound: Vec::new(),
            input_shape: None,
            output_shape: None,
            weights,
        }
    }

    #[test]
    fn test_conv2d_valid() {
        // 3x3 ramp, kernel picking top-left and bottom-right of a 2x2 window.
        let input = image(3, 3, 1, (1..=9).map(|v| v as f32).collect());
        let kernel = Tensor::new(vec![2, 2, 1, 1], vec![1.0, 0.0, 0.0, 1.0]);
        let out = conv2d_raw(&input, &kernel, (1, 1), Padding::Valid).unwrap();
        assert_eq!(out.shape, vec![1, 2, 2, 1]);
        assert_eq!(out.data, vec![6.0, 8.0, 12.0, 14.0]);
    }

    #[test]
    fn test_conv2d_same_pads_trailing_side_first() {
        // Even total padding splits 0 before / 1 after, so the top-left
        // window is never shifted.
        let input = image(3, 3, 1, (1..=9).map(|v| v as f32).collect());
        let kernel = Tensor::new(vec![2, 2, 1, 1], vec![1.0, 0.0, 0.0, 1.0]);
        let out = conv2d_raw(&input, &kernel, (1, 1), Padding::Same).unwrap();
        assert_eq!(out.shape, vec![1, 3, 3, 1]);
        assert_eq!(
            out.data,
            vec![6.0, 8.0, 3.0, 12.0, 14.0, 6.0, 7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn test_conv2d_same_odd_kernel_centers_window() {
        // 3x3 kernel over 2x2 input: one pad cell on every side.
        let input = image(2, 2, 1, vec![1.0, 2.0, 3.0, 4.0]);
        let kernel = Tensor::new(vec![3, 3, 1, 1], vec![1.0; 9]);
        let out = conv2d_raw(&input, &kernel, (1, 1), Padding::Same).unwrap();
        assert_eq!(out.shape, vec![1, 2, 2, 1]);
        assert_eq!(out.data, vec![10.0, 10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_conv2d_valid_rejects_oversized_kernel() {
        let input = image(2, 2, 1, vec![0.0; 4]);
        let kernel = Tensor::new(vec![3, 3, 1, 1], vec![0.0; 9]);
        assert!(matches!(
            conv2d_raw(&input, &kernel, (1, 1), Padding::Valid),
            Err(BackendError::UnsupportedShape(_))
        ));
    }

    #[test]
    fn test_conv2d_multi_channel_mixing() {
        // Two input channels summed into one output channel at a single site.
        let input = image(1, 1, 2, vec![3.0, 5.0]);
        let kernel = Tensor::new(vec![1, 1, 2, 1], vec![1.0, 10.0]);
        let out = conv2d_raw(&input, &kernel, (1, 1), Padding::Valid).unwrap();
        assert_eq!(out.data, vec![53.0]);
    }

    #[test]
    fn test_conv2d_transpose_disjoint_scatter() {
        let input = image(2, 2, 1, vec![1.0, 2.0, 3.0, 4.0]);
        let kernel = Tensor::new(vec![2, 2, 1, 1], vec![1.0; 4]);
        let out = conv2d_transpose_raw(&input, &kernel, (2, 2), Padding::Valid).unwrap();
        assert_eq!(out.shape, vec![1, 4, 4, 1]);
        assert_eq!(
            out.data,
            vec![
                1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0
            ]
        );
    }

    #[test]
    fn test_conv2d_transpose_same_crops_leading_edge() {
        let input = image(2, 2, 1, vec![1.0, 2.0, 3.0, 4.0]);
        let kernel = Tensor::new(vec![3, 3, 1, 1], vec![1.0; 9]);
        let out = conv2d_transpose_raw(&input, &kernel, (1, 1), Padding::Same).unwrap();
        assert_eq!(out.shape, vec![1, 2, 2, 1]);
        assert_eq!(out.data, vec![10.0, 10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_separable_identity_passthrough() {
        // All-ones depthwise plus first-channel pointwise reads back the ramp.
        let mut data = Vec::new();
        for i in 0..6 {
            data.extend_from_slice(&[i as f32, i as f32]);
        }
        let input = image(1, 6, 2, data);
        let depthwise = Tensor::new(vec![1, 1, 2, 1], vec![1.0, 1.0]);
        let pointwise = Tensor::new(vec![1, 1, 2, 1], vec![1.0, 0.0]);
        let out =
            separable_conv2d_raw(&input, &depthwise, &pointwise, (3, 3), Padding::Valid).unwrap();
        assert_eq!(out.shape, vec![1, 1, 2, 1]);
        assert_eq!(out.data, vec![0.0, 3.0]);
    }

    #[test]
    fn test_separable_rejects_depth_multiplier() {
        let input = image(2, 2, 2, vec![0.0; 8]);
        let depthwise = Tensor::new(vec![1, 1, 2, 2], vec![0.0; 4]);
        let pointwise = Tensor::new(vec![1, 1, 4, 1], vec![0.0; 4]);
        assert!(matches!(
            separable_conv2d_raw(&input, &depthwise, &pointwise, (1, 1), Padding::Valid),
            Err(BackendError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_max_pool_valid() {
        let input = image(3, 3, 1, (1..=9).map(|v| v as f32).collect());
        let out = pool2d_raw(&input, PoolMode::Max, (2, 2), (1, 1), Padding::Valid).unwrap();
        assert_eq!(out.shape, vec![1, 2, 2, 1]);
        assert_eq!(out.data, vec![5.0, 6.0, 8.0, 9.0]);
    }

    #[test]
    fn test_average_pool_same_ignores_padding() {
        let input = image(3, 3, 1, (1..=9).map(|v| v as f32).collect());
        let out = pool2d_raw(&input, PoolMode::Average, (2, 2), (2, 2), Padding::Same).unwrap();
        assert_eq!(out.shape, vec![1, 2, 2, 1]);
        assert_eq!(out.data, vec![3.0, 4.5, 7.5, 9.0]);
    }

    #[test]
    fn test_dense_matmul() {
        let input = Tensor::new(vec![1, 2], vec![1.0, 2.0]);
        let weights = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = dense_raw(&input, &weights).unwrap();
        assert_eq!(out.shape, vec![1, 3]);
        assert_eq!(out.data, vec![9.0, 12.0, 15.0]);
    }

    #[test]
    fn test_dense_rejects_mismatched_width() {
        let input = Tensor::new(vec![1, 3], vec![0.0; 3]);
        let weights = Tensor::new(vec![2, 3], vec![0.0; 6]);
        assert!(matches!(
            dense_raw(&input, &weights),
            Err(BackendError::UnsupportedShape(_))
        ));
    }

    #[test]
    fn test_batch_norm_numerics() {
        let input = image(1, 1, 2, vec![3.0, 5.0]);
        let mean = Tensor::new(vec![2], vec![1.0, 2.0]);
        let variance = Tensor::new(vec![2], vec![4.0, 9.0]);
        let beta = Tensor::new(vec![2], vec![1.0, 1.0]);
        let gamma = Tensor::new(vec![2], vec![2.0, 2.0]);
        let out =
            batch_norm_raw(&input, &mean, &variance, Some(&beta), Some(&gamma), 0.0).unwrap();
        assert_eq!(out.data, vec![3.0, 3.0]);
    }

    #[test]
    fn test_batch_norm_without_beta_gamma() {
        let input = image(1, 1, 1, vec![5.0]);
        let mean = Tensor::new(vec![1], vec![1.0]);
        let variance = Tensor::new(vec![1], vec![4.0]);
        let out = batch_norm_raw(&input, &mean, &variance, None, None, 0.0).unwrap();
        assert_eq!(out.data, vec![2.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let out = apply_activation("softmax", Tensor::new(vec![1, 2], vec![0.0, 0.0])).unwrap();
        assert_eq!(out.data, vec![0.5, 0.5]);
    }

    #[test]
    fn test_relu_clamps_negatives() {
        let out = apply_activation("relu", Tensor::new(vec![3], vec![-1.0, 0.0, 2.0])).unwrap();
        assert_eq!(out.data, vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_unknown_activation_is_rejected() {
        assert!(matches!(
            apply_activation("gelu", Tensor::new(vec![1], vec![0.0])),
            Err(BackendError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_eval_conv1d_lifts_to_2d() {
        let input = Tensor::new(vec![1, 4, 1], vec![1.0, 2.0, 3.0, 4.0]);
        let conv = layer(
            "c1",
            "Conv1D",
            json!({"strides": [1], "padding": "valid", "activation": "linear"}),
            vec![Tensor::new(vec![2, 1, 1], vec![1.0, 1.0])],
        );
        let out = ReferenceBackend.eval_layer(&conv, &[input]).unwrap();
        assert_eq!(out.shape, vec![1, 3, 1]);
        assert_eq!(out.data, vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_eval_dense_with_bias_and_relu() {
        let input = Tensor::new(vec![1, 2], vec![1.0, -3.0]);
        let dense = layer(
            "d1",
            "Dense",
            json!({"activation": "relu"}),
            vec![
                Tensor::new(vec![2, 2], vec![1.0, 1.0, 1.0, 1.0]),
                Tensor::new(vec![2], vec![0.5, -10.0]),
            ],
        );
        let out = ReferenceBackend.eval_layer(&dense, &[input]).unwrap();
        assert_eq!(out.data, vec![0.0, 0.0]);
    }

    #[test]
    fn test_eval_flatten_keeps_row_major_order() {
        let input = image(2, 2, 2, (0..8).map(|v| v as f32).collect());
        let flatten = layer("f1", "Flatten", json!({}), Vec::new());
        let out = ReferenceBackend.eval_layer(&flatten, &[input]).unwrap();
        assert_eq!(out.shape, vec![1, 8]);
        assert_eq!(out.data, (0..8).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_eval_unknown_layer_is_unsupported() {
        let lstm = layer("l1", "LSTM", json!({}), Vec::new());
        let input = Tensor::new(vec![1, 1], vec![0.0]);
        assert!(matches!(
            ReferenceBackend.eval_layer(&lstm, &[input]),
            Err(BackendError::UnsupportedFeature(_))
        ));
    }

    fn chain_graph() -> ModelGraph {
        let mut input = layer("in1", "InputLayer", json!({}), Vec::new());
        input.input_shape = Some(vec![None, Some(2)]);
        let mut dense = layer(
            "d1",
            "Dense",
            json!({"activation": "linear"}),
            vec![Tensor::new(vec![2, 1], vec![1.0, 1.0])],
        );
        dense.inbound = vec![vec!["in1".to_string()]];
        ModelGraph {
            name: "net".to_string(),
            kind: GraphKind::Functional,
            inbound: Vec::new(),
            nodes: vec![GraphNode::Layer(input), GraphNode::Layer(dense)],
            input_layers: vec!["in1".to_string()],
            output_layers: vec!["d1".to_string()],
        }
    }

    #[test]
    fn test_predict_chain() {
        let graph = chain_graph();
        let out = ReferenceBackend
            .predict(&graph, &[Tensor::new(vec![1, 2], vec![2.0, 3.0])])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, vec![5.0]);
    }

    #[test]
    fn test_predict_add_join() {
        let mut input = layer("in1", "InputLayer", json!({}), Vec::new());
        input.input_shape = Some(vec![None, Some(2)]);
        let mut left = layer("drop", "Dropout", json!({}), Vec::new());
        left.inbound = vec![vec!["in1".to_string()]];
        let mut add = layer("sum", "Add", json!({}), Vec::new());
        add.inbound = vec![vec!["in1".to_string(), "drop".to_string()]];
        let graph = ModelGraph {
            name: "net".to_string(),
            kind: GraphKind::Functional,
            inbound: Vec::new(),
            nodes: vec![
                GraphNode::Layer(input),
                GraphNode::Layer(left),
                GraphNode::Layer(add),
            ],
            input_layers: vec!["in1".to_string()],
            output_layers: vec!["sum".to_string()],
        };
        let out = ReferenceBackend
            .predict(&graph, &[Tensor::new(vec![1, 2], vec![1.0, 4.0])])
            .unwrap();
        assert_eq!(out[0].data, vec![2.0, 8.0]);
    }

    #[test]
    fn test_predict_rejects_input_arity_mismatch() {
        let graph = chain_graph();
        assert!(matches!(
            ReferenceBackend.predict(&graph, &[]),
            Err(BackendError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_predict_detects_stuck_graph() {
        let mut graph = chain_graph();
        if let GraphNode::Layer(dense) = &mut graph.nodes[1] {
            dense.inbound = vec![vec!["ghost".to_string()]];
        }
        assert!(matches!(
            ReferenceBackend.predict(&graph, &[Tensor::new(vec![1, 2], vec![0.0, 0.0])]),
            Err(BackendError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_materialize_wires_sequential_chain() {
        let graph = ModelGraph {
            name: "net".to_string(),
            kind: GraphKind::Sequential,
            inbound: Vec::new(),
            nodes: vec![
                GraphNode::Layer(layer("d1", "Dense", json!({}), Vec::new())),
                GraphNode::Layer(layer("d2", "Dense", json!({}), Vec::new())),
                GraphNode::Layer(layer("d3", "Dense", json!({}), Vec::new())),
            ],
            input_layers: Vec::new(),
            output_layers: Vec::new(),
        };
        let wired = ReferenceBackend.materialize(graph).unwrap();
        assert_eq!(wired.input_layers, vec!["d1"]);
        assert_eq!(wired.output_layers, vec!["d3"]);
        let d2 = wired.layer("d2").unwrap();
        assert_eq!(d2.inbound, vec![vec!["d1".to_string()]]);
        let d3 = wired.layer("d3").unwrap();
        assert_eq!(d3.inbound, vec![vec!["d2".to_string()]]);
    }

    #[test]
    fn test_materialize_leaves_functional_graph_alone() {
        let graph = chain_graph();
        let same = ReferenceBackend.materialize(graph.clone()).unwrap();
        assert_eq!(same, graph);
    }
}
