use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;

use crate::tensor::Tensor;

// The consuming runtime reassembles weight text in fixed-size pieces; the
// chunk length is part of the document contract.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("non-finite value at index {0}")]
    NonFinite(usize),
    #[error("malformed encoding: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatEncoding {
    #[default]
    Base64Chunks,
    HumanReadable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EncodedValues {
    Chunks(Vec<String>),
    Raw(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedTensor {
    pub shape: Vec<usize>,
    pub values: EncodedValues,
}

// Serializes a float sequence. NaN and infinity are rejected here, which
// guards the whole document: every float it contains passes through this
// function.
pub fn encode_floats(values: &[f32], encoding: FloatEncoding) -> Result<EncodedValues, EncodeError> {
    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(EncodeError::NonFinite(index));
    }
    match encoding {
        FloatEncoding::HumanReadable => Ok(EncodedValues::Raw(values.to_vec())),
        FloatEncoding::Base64Chunks => {
            let mut bytes = Vec::with_capacity(values.len() * 4);
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            Ok(EncodedValues::Chunks(split_every(CHUNK_SIZE, &STANDARD.encode(bytes))))
        }
    }
}

pub fn encode_tensor(tensor: &Tensor, encoding: FloatEncoding) -> Result<EncodedTensor, EncodeError> {
    Ok(EncodedTensor {
        shape: tensor.shape.clone(),
        values: encode_floats(&tensor.data, encoding)?,
    })
}

// Inverse of encode_floats: concatenate the chunks, base64-decode, and
// reinterpret the bytes as little-endian f32 values.
pub fn decode_floats(values: &EncodedValues) -> Result<Vec<f32>, EncodeError> {
    match values {
        EncodedValues::Raw(raw) => Ok(raw.clone()),
        EncodedValues::Chunks(chunks) => {
            let text: String = chunks.concat();
            let bytes = STANDARD
                .decode(text.as_bytes())
                .map_err(|e| EncodeError::Malformed(e.to_string()))?;
            if bytes.len() % 4 != 0 {
                return Err(EncodeError::Malformed(format!(
                    "byte count {} is not a multiple of 4",
                    bytes.len()
                )));
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect())
        }
    }
}

fn split_every(size: usize, text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let (head, tail) = rest.split_at(size.min(rest.len()));
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}
