use thiserror::Error;

use crate::ir::DeclaredShape;
use crate::tensor::Tensor;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
}

// Kernel axis permutations from the channel-last source layout to the layout
// the consuming runtime indexes. The 2D rule is the three-step rotation
// (kh, kw, in, out) -> (out, in, kh, kw).
pub const CONV1D_KERNEL_PERM: [usize; 3] = [2, 1, 0];
pub const CONV2D_KERNEL_PERM: [usize; 4] = [3, 2, 0, 1];
pub const CONV2D_KERNEL_PERM_INV: [usize; 4] = [2, 3, 1, 0];

pub fn conv1d_kernel(kernel: &Tensor) -> Result<Tensor, LayoutError> {
    if kernel.rank() != 3 {
        return Err(LayoutError::UnsupportedShape(format!(
            "1d conv kernel has shape {:?}, expected rank 3",
            kernel.shape
        )));
    }
    Ok(kernel.permuted(&CONV1D_KERNEL_PERM))
}

pub fn conv2d_kernel(kernel: &Tensor) -> Result<Tensor, LayoutError> {
    if kernel.rank() != 4 {
        return Err(LayoutError::UnsupportedShape(format!(
            "2d conv kernel has shape {:?}, expected rank 4",
            kernel.shape
        )));
    }
    Ok(kernel.permuted(&CONV2D_KERNEL_PERM))
}

// The depthwise "slice" kernel and the pointwise "stack" kernel each follow
// the 2D rule. A depth multiplier other than one changes the weight layout in
// ways the runtime does not model.
pub fn separable_kernels(
    depthwise: &Tensor,
    pointwise: &Tensor,
) -> Result<(Tensor, Tensor), LayoutError> {
    if depthwise.rank() == 4 && depthwise.shape[3] != 1 {
        return Err(LayoutError::UnsupportedFeature(format!(
            "separable conv depth multiplier {} (only 1 is supported)",
            depthwise.shape[3]
        )));
    }
    Ok((conv2d_kernel(depthwise)?, conv2d_kernel(pointwise)?))
}

// A (in, out) dense matrix flattens in natural row-major order, but only when
// the layer sees flat data; anything else would need an axis shuffle the
// runtime does not perform.
pub fn dense_matrix(matrix: &Tensor, input_shape: &DeclaredShape) -> Result<Tensor, LayoutError> {
    if !is_flat_shape(input_shape) {
        return Err(LayoutError::UnsupportedShape(format!(
            "dense layer input shape {:?} is not flat",
            input_shape
        )));
    }
    if matrix.rank() != 2 {
        return Err(LayoutError::UnsupportedShape(format!(
            "dense matrix has shape {:?}, expected rank 2",
            matrix.shape
        )));
    }
    Ok(matrix.reshaped(vec![matrix.numel()]))
}

// Flat means: leading batch dimension, then at most one non-unit dimension.
// A rank-3 declared shape always carries spatial structure and is never flat.
pub fn is_flat_shape(shape: &DeclaredShape) -> bool {
    if shape.first() != Some(&None) {
        return false;
    }
    match shape.len() {
        2 => true,
        4 => shape[1] == Some(1) && shape[2] == Some(1),
        _ => false,
    }
}

// Generic canonicalization to the runtime's three-axis (channel, height,
// width) form, used for test fixtures. Rank 2 is a true transpose into
// (cols, 1, rows); rank 4 must carry a unit batch, which is dropped.
pub fn as_channel_first_3d(tensor: &Tensor) -> Result<Tensor, LayoutError> {
    match tensor.rank() {
        1 => Ok(tensor.reshaped(vec![tensor.shape[0], 1, 1])),
        2 => {
            let (rows, cols) = (tensor.shape[0], tensor.shape[1]);
            Ok(tensor.permuted(&[1, 0]).reshaped(vec![cols, 1, rows]))
        }
        3 => Ok(tensor.permuted(&[2, 0, 1])),
        4 if tensor.shape[0] == 1 => {
            let inner = tensor.reshaped(tensor.shape[1..].to_vec());
            Ok(inner.permuted(&[2, 0, 1]))
        }
        _ => Err(LayoutError::UnsupportedShape(format!(
            "cannot reduce shape {:?} to three axes",
            tensor.shape
        ))),
    }
}
