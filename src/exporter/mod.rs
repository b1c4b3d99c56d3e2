use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub trait ModelExporter {
    fn export(document: &ConversionDocument, path: &Path) -> Result<(), ExportError>;
}

pub mod document;

pub use document::{ConversionDocument, JsonExporter};
