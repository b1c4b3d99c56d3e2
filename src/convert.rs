use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::info;

use crate::backend::{Backend, BackendError, ImageDataFormat, ReferenceBackend};
use crate::encode::FloatEncoding;
use crate::exporter::{ConversionDocument, ExportError, JsonExporter, ModelExporter};
use crate::fixture::{self, FixtureError};
use crate::ir::{normalize, GraphError};
use crate::loader::{ArchiveLoader, LoaderError, ModelLoader};
use crate::probe::{run_probes, ProbeError};
use crate::weights::{self, WeightError};

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    #[error(transparent)]
    Weights(#[from] WeightError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    pub encoding: FloatEncoding,
    /// Seed for the verification inputs; fixed so repeated conversions of the
    /// same archive produce identical documents.
    pub seed: u64,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            encoding: FloatEncoding::default(),
            seed: 0,
        }
    }
}

/// Convert a trained model archive into the runtime's JSON document using the
/// bundled reference backend.
pub fn convert<P: AsRef<Path>, Q: AsRef<Path>>(
    model_path: P,
    output_path: Q,
) -> Result<(), ConvertError> {
    convert_with(
        model_path,
        output_path,
        &ReferenceBackend,
        ConvertOptions::default(),
    )
}

pub fn convert_with<P: AsRef<Path>, Q: AsRef<Path>>(
    model_path: P,
    output_path: Q,
    backend: &dyn Backend,
    options: ConvertOptions,
) -> Result<(), ConvertError> {
    check_preconditions(backend)?;

    let model_path = model_path.as_ref();
    info!(path = %model_path.display(), "loading model archive");
    let graph = ArchiveLoader::load(model_path)?;
    let graph = backend.materialize(graph)?;
    let graph = normalize(graph)?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let fixture = fixture::generate(&graph, backend, options.encoding, &mut rng)?;
    let probes = run_probes(backend)?;
    let trainable_params = weights::collect(&graph, options.encoding)?;

    let document = ConversionDocument::assemble(
        &graph,
        backend.image_data_format(),
        probes,
        fixture,
        trainable_params,
    );

    let output_path = output_path.as_ref();
    info!(path = %output_path.display(), "writing document");
    JsonExporter::export(&document, output_path)?;
    Ok(())
}

// The emitted document bakes in the backend's numeric conventions, so we only
// accept the configuration the probes and layout rules were written for.
fn check_preconditions(backend: &dyn Backend) -> Result<(), ConvertError> {
    if backend.name() != "reference" {
        return Err(ConvertError::Configuration(format!(
            "backend {} is not supported (expected reference)",
            backend.name()
        )));
    }
    if backend.float_width() != 32 {
        return Err(ConvertError::Configuration(format!(
            "backend computes {}-bit floats (expected 32)",
            backend.float_width()
        )));
    }
    if backend.image_data_format() != ImageDataFormat::ChannelsLast {
        return Err(ConvertError::Configuration(
            "backend image data format must be channels_last".to_string(),
        ));
    }
    Ok(())
}
