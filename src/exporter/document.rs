use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;

use crate::backend::ImageDataFormat;
use crate::encode::EncodedTensor;
use crate::exporter::{ExportError, ModelExporter};
use crate::fixture::TestFixture;
use crate::ir::{GraphKind, GraphNode, ModelGraph};
use crate::probe::OffsetProbes;
use crate::weights::WeightPayload;

/// The complete output document. Serialized with sorted keys so the result is
/// byte-stable across runs; the offset flags sit at the top level next to the
/// named fields.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionDocument {
    pub architecture: Value,
    pub image_data_format: ImageDataFormat,
    #[serde(flatten)]
    pub probes: OffsetProbes,
    pub input_shapes: Vec<Vec<usize>>,
    pub output_shapes: Vec<Vec<usize>>,
    pub tests: Vec<TestFixture>,
    pub trainable_params: BTreeMap<String, WeightPayload>,
}

impl ConversionDocument {
    pub fn assemble(
        graph: &ModelGraph,
        image_data_format: ImageDataFormat,
        probes: OffsetProbes,
        fixture: TestFixture,
        trainable_params: BTreeMap<String, WeightPayload>,
    ) -> Self {
        ConversionDocument {
            architecture: architecture_value(graph),
            image_data_format,
            probes,
            input_shapes: shapes_of(&fixture.inputs),
            output_shapes: shapes_of(&fixture.outputs),
            tests: vec![fixture],
            trainable_params,
        }
    }
}

fn shapes_of(tensors: &[EncodedTensor]) -> Vec<Vec<usize>> {
    tensors.iter().map(|t| t.shape.clone()).collect()
}

/// Architecture description in the source framework's serialization shape:
/// each inbound producer becomes a `[name, 0, 0, {}]` node reference and the
/// graph endpoints become `[name, 0, 0]` triples.
pub fn architecture_value(graph: &ModelGraph) -> Value {
    let layers: Vec<Value> = graph.nodes.iter().map(node_value).collect();
    json!({
        "class_name": class_of(graph.kind),
        "config": {
            "name": graph.name,
            "layers": layers,
            "input_layers": endpoint_list(&graph.input_layers),
            "output_layers": endpoint_list(&graph.output_layers),
        }
    })
}

fn class_of(kind: GraphKind) -> &'static str {
    match kind {
        GraphKind::Functional => "Model",
        GraphKind::Sequential => "Sequential",
    }
}

fn node_value(node: &GraphNode) -> Value {
    match node {
        GraphNode::Layer(layer) => json!({
            "class_name": layer.class_name,
            "name": layer.name,
            "config": layer.config,
            "inbound_nodes": inbound_value(&layer.inbound),
        }),
        GraphNode::Composite(sub) => {
            let mut value = architecture_value(sub);
            if let Value::Object(map) = &mut value {
                map.insert("name".to_string(), json!(sub.name));
                map.insert("inbound_nodes".to_string(), inbound_value(&sub.inbound));
            }
            value
        }
    }
}

fn inbound_value(inbound: &[Vec<String>]) -> Value {
    Value::Array(
        inbound
            .iter()
            .map(|group| {
                Value::Array(
                    group
                        .iter()
                        .map(|producer| json!([producer, 0, 0, {}]))
                        .collect(),
                )
            })
            .collect(),
    )
}

fn endpoint_list(names: &[String]) -> Value {
    Value::Array(names.iter().map(|name| json!([name, 0, 0])).collect())
}

pub struct JsonExporter;

impl ModelExporter for JsonExporter {
    fn export(document: &ConversionDocument, path: &Path) -> Result<(), ExportError> {
        let value = serde_json::to_value(document)
            .map_err(|e| ExportError::Serialization(e.to_string()))?;
        let mut text = serde_json::to_string_pretty(&value)
            .map_err(|e| ExportError::Serialization(e.to_string()))?;
        text.push('\n');

        // Write-then-rename so a failed run never leaves a half-written
        // document at the target path.
        let parent = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(text.as_bytes())?;
        staged.persist(path).map_err(|e| ExportError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::EncodedValues;
    use crate::ir::{LayerKind, LayerRecord};
    use std::fs;
    use tempfile::tempdir;

    fn no_offsets() -> OffsetProbes {
        OffsetProbes {
            conv2d_valid_offset_depth_1: false,
            conv2d_same_offset_depth_1: false,
            conv2d_valid_offset_depth_2: false,
            conv2d_same_offset_depth_2: false,
            separable_conv2d_valid_offset_depth_1: false,
            separable_conv2d_same_offset_depth_1: false,
            separable_conv2d_valid_offset_depth_2: false,
            separable_conv2d_same_offset_depth_2: false,
            max_pooling_2d_valid_offset: false,
            max_pooling_2d_same_offset: false,
            average_pooling_2d_valid_offset: false,
            average_pooling_2d_same_offset: false,
        }
    }

    fn sample_graph() -> ModelGraph {
        let input = LayerRecord {
            name: "in1".to_string(),
            class_name: "InputLayer".to_string(),
            kind: LayerKind::Other,
            config: json!({"dtype": "float32"}),
            inbound: Vec::new(),
            input_shape: Some(vec![None, Some(2)]),
            output_shape: None,
            weights: Vec::new(),
        };
        let mut flatten = input.clone();
        flatten.name = "f1".to_string();
        flatten.class_name = "Flatten".to_string();
        flatten.inbound = vec![vec!["in1".to_string()]];
        flatten.input_shape = None;
        ModelGraph {
            name: "net".to_string(),
            kind: GraphKind::Functional,
            inbound: Vec::new(),
            nodes: vec![GraphNode::Layer(input), GraphNode::Layer(flatten)],
            input_layers: vec!["in1".to_string()],
            output_layers: vec!["f1".to_string()],
        }
    }

    fn sample_document() -> ConversionDocument {
        let tensor = EncodedTensor {
            shape: vec![2, 1, 1],
            values: EncodedValues::Raw(vec![0.5, 0.25]),
        };
        let fixture = TestFixture {
            inputs: vec![tensor.clone()],
            outputs: vec![tensor],
        };
        ConversionDocument::assemble(
            &sample_graph(),
            ImageDataFormat::ChannelsLast,
            no_offsets(),
            fixture,
            BTreeMap::new(),
        )
    }

    fn export_to_string(document: &ConversionDocument) -> String {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        JsonExporter::export(document, &path).unwrap();
        fs::read_to_string(&path).unwrap()
    }

    #[test]
    fn test_document_ends_with_newline() {
        let text = export_to_string(&sample_document());
        assert!(text.ends_with('\n'));
        assert!(!text.ends_with("\n\n"));
    }

    #[test]
    fn test_document_keys_are_sorted() {
        let text = export_to_string(&sample_document());
        let keys = [
            "\"architecture\"",
            "\"average_pooling_2d_same_offset\"",
            "\"conv2d_same_offset_depth_1\"",
            "\"image_data_format\"",
            "\"input_shapes\"",
            "\"max_pooling_2d_valid_offset\"",
            "\"output_shapes\"",
            "\"tests\"",
            "\"trainable_params\"",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|key| text.find(key).unwrap_or_else(|| panic!("missing {}", key)))
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_probe_flags_are_flattened_to_top_level() {
        let value: Value = serde_json::from_str(&export_to_string(&sample_document())).unwrap();
        assert_eq!(value["max_pooling_2d_valid_offset"], json!(false));
        assert_eq!(value["image_data_format"], json!("channels_last"));
        assert_eq!(value["input_shapes"], json!([[2, 1, 1]]));
    }

    #[test]
    fn test_architecture_uses_framework_node_references() {
        let architecture = architecture_value(&sample_graph());
        assert_eq!(architecture["class_name"], json!("Model"));
        assert_eq!(
            architecture["config"]["layers"][1]["inbound_nodes"],
            json!([[["in1", 0, 0, {}]]])
        );
        assert_eq!(
            architecture["config"]["input_layers"],
            json!([["in1", 0, 0]])
        );
        assert_eq!(
            architecture["config"]["output_layers"],
            json!([["f1", 0, 0]])
        );
    }

    #[test]
    fn test_export_replaces_existing_file_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        fs::write(&path, "stale").unwrap();
        JsonExporter::export(&sample_document(), &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('{'));
        // The staging file is gone; only the target remains.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
