#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "tensor data length must match shape"
        );
        Self { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn reshaped(&self, shape: Vec<usize>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            self.numel(),
            "reshape must preserve element count"
        );
        Self {
            shape,
            data: self.data.clone(),
        }
    }

    // Row-major axis permutation: output axis k takes input axis perm[k].
    pub fn permuted(&self, perm: &[usize]) -> Self {
        assert_eq!(perm.len(), self.rank(), "permutation must cover every axis");

        let out_shape: Vec<usize> = perm.iter().map(|&p| self.shape[p]).collect();
        let in_strides = row_major_strides(&self.shape);
        let out_strides = row_major_strides(&out_shape);

        let mut out = vec![0.0f32; self.data.len()];
        for (flat, &value) in self.data.iter().enumerate() {
            let mut remaining = flat;
            let mut coords = vec![0usize; self.rank()];
            for axis in 0..self.rank() {
                coords[axis] = remaining / in_strides[axis];
                remaining %= in_strides[axis];
            }

            let mut out_idx = 0;
            for (axis, &p) in perm.iter().enumerate() {
                out_idx += coords[p] * out_strides[axis];
            }
            out[out_idx] = value;
        }

        Self {
            shape: out_shape,
            data: out,
        }
    }
}

pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}
