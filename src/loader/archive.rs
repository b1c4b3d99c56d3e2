use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::ir::{DeclaredShape, GraphKind, GraphNode, LayerKind, LayerRecord, ModelGraph};
use crate::loader::{LoaderError, ModelLoader};
use crate::tensor::Tensor;

pub const FORMAT_MARKER: &str = "modelport";
pub const FORMAT_VERSION: u32 = 1;

const MANIFEST_ENTRY: &str = "model.json";

/// Reads a trained-model archive: a ZIP holding a `model.json` manifest that
/// describes the (possibly nested) layer graph, plus one entry of raw
/// little-endian f32 bytes per weight tensor.
pub struct ArchiveLoader;

impl ModelLoader for ArchiveLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<ModelGraph, LoaderError> {
        let file = File::open(path)?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;

        let manifest_bytes = read_entry(&mut archive, MANIFEST_ENTRY)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| LoaderError::InvalidFormat(e.to_string()))?;

        if manifest.format != FORMAT_MARKER {
            return Err(LoaderError::UnsupportedVersion(format!(
                "format marker {}",
                manifest.format
            )));
        }
        if manifest.version != FORMAT_VERSION {
            return Err(LoaderError::UnsupportedVersion(format!(
                "{} (supported: {})",
                manifest.version, FORMAT_VERSION
            )));
        }
        build_graph(manifest.model, &mut archive)
    }
}

#[derive(Deserialize)]
struct Manifest {
    format: String,
    version: u32,
    model: ModelEntry,
}

#[derive(Deserialize)]
struct ModelEntry {
    class_name: String,
    name: String,
    #[serde(default)]
    inbound_nodes: Vec<Vec<String>>,
    #[serde(default)]
    input_layers: Vec<String>,
    #[serde(default)]
    output_layers: Vec<String>,
    // Required: this is what distinguishes a composite from a plain layer.
    layers: Vec<NodeEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NodeEntry {
    Model(Box<ModelEntry>),
    Layer(LayerEntry),
}

#[derive(Deserialize)]
struct LayerEntry {
    class_name: String,
    name: String,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    inbound_nodes: Vec<Vec<String>>,
    #[serde(default)]
    input_shape: Option<DeclaredShape>,
    #[serde(default)]
    output_shape: Option<DeclaredShape>,
    #[serde(default)]
    weights: Vec<WeightEntry>,
}

#[derive(Deserialize)]
struct WeightEntry {
    file: String,
    shape: Vec<usize>,
}

fn build_graph(
    entry: ModelEntry,
    archive: &mut ZipArchive<File>,
) -> Result<ModelGraph, LoaderError> {
    let kind = match entry.class_name.as_str() {
        "Model" => GraphKind::Functional,
        "Sequential" => GraphKind::Sequential,
        other => {
            return Err(LoaderError::InvalidFormat(format!(
                "unknown model class {}",
                other
            )))
        }
    };
    let mut nodes = Vec::with_capacity(entry.layers.len());
    for node in entry.layers {
        nodes.push(match node {
            NodeEntry::Model(sub) => GraphNode::Composite(build_graph(*sub, archive)?),
            NodeEntry::Layer(layer) => GraphNode::Layer(build_layer(layer, archive)?),
        });
    }
    Ok(ModelGraph {
        name: entry.name,
        kind,
        inbound: entry.inbound_nodes,
        nodes,
        input_layers: entry.input_layers,
        output_layers: entry.output_layers,
    })
}

fn build_layer(
    entry: LayerEntry,
    archive: &mut ZipArchive<File>,
) -> Result<LayerRecord, LoaderError> {
    // A composite without its layer list deserializes as a plain layer;
    // reject it rather than silently dropping the subgraph.
    if matches!(entry.class_name.as_str(), "Model" | "Sequential") {
        return Err(LoaderError::InvalidFormat(format!(
            "composite entry {} is missing its layers",
            entry.name
        )));
    }
    let mut weights = Vec::with_capacity(entry.weights.len());
    for descriptor in &entry.weights {
        weights.push(read_tensor(archive, descriptor)?);
    }
    let kind = LayerKind::from_class_name(&entry.class_name);
    Ok(LayerRecord {
        name: entry.name,
        class_name: entry.class_name,
        kind,
        config: entry.config,
        inbound: entry.inbound_nodes,
        input_shape: entry.input_shape,
        output_shape: entry.output_shape,
        weights,
    })
}

fn read_tensor(
    archive: &mut ZipArchive<File>,
    descriptor: &WeightEntry,
) -> Result<Tensor, LoaderError> {
    let bytes = read_entry(archive, &descriptor.file)?;
    let numel: usize = descriptor.shape.iter().product();
    if bytes.len() != numel * 4 {
        return Err(LoaderError::InvalidFormat(format!(
            "weight entry {} holds {} bytes, expected {}",
            descriptor.file,
            bytes.len(),
            numel * 4
        )));
    }
    let data = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(Tensor::new(descriptor.shape.clone(), data))
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>, LoaderError> {
    let mut entry = archive.by_name(name).map_err(|e| match e {
        ZipError::FileNotFound => LoaderError::MissingEntry(name.to_string()),
        other => LoaderError::InvalidFormat(other.to_string()),
    })?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}
