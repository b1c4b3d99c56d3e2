pub mod backend;
pub mod convert;
pub mod encode;
pub mod exporter;
pub mod fixture;
pub mod ir;
pub mod layout;
pub mod loader;
pub mod probe;
pub mod tensor;
pub mod weights;

pub use convert::{convert, convert_with, ConvertError, ConvertOptions};
pub use tensor::Tensor;
