use std::path::Path;

use thiserror::Error;

use crate::ir::ModelGraph;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("Missing entry: {0}")]
    MissingEntry(String),
}

pub trait ModelLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<ModelGraph, LoaderError>;
}

pub mod archive;

pub use archive::ArchiveLoader;
