use std::collections::HashMap;

use crate::ir::{GraphError, GraphKind, GraphNode, LayerRecord, ModelGraph};

// Flattens nested composite models into a single flat graph. A Sequential
// wrapper holding exactly one inner model is unwrapped first, with the inner
// model inheriting the wrapper's name and inbound bookkeeping, never the
// reverse. Nested composites are normalized depth-first, then spliced into
// the parent node list.
pub fn normalize(graph: ModelGraph) -> Result<ModelGraph, GraphError> {
    let graph = unwrap_wrapper(graph)?;

    if graph.input_layers.is_empty() {
        return Err(GraphError::Configuration(format!(
            "model {} declares no input layers",
            graph.name
        )));
    }
    if graph.nodes.is_empty() {
        return Err(GraphError::Configuration(format!(
            "model {} contains no layers",
            graph.name
        )));
    }

    let mut flat = ModelGraph {
        name: graph.name,
        kind: GraphKind::Functional,
        inbound: graph.inbound,
        nodes: Vec::with_capacity(graph.nodes.len()),
        input_layers: graph.input_layers,
        output_layers: graph.output_layers,
    };

    // Producer names that must be rewritten once all nodes are in place:
    // a spliced composite's name maps to its output layers.
    let mut rewrites: HashMap<String, Vec<String>> = HashMap::new();

    for node in graph.nodes {
        match node {
            GraphNode::Layer(layer) => flat.nodes.push(GraphNode::Layer(layer)),
            GraphNode::Composite(sub) => {
                let spliced = splice(sub)?;
                rewrites.insert(spliced.name, spliced.outputs);
                flat.nodes
                    .extend(spliced.layers.into_iter().map(GraphNode::Layer));
            }
        }
    }

    for node in &mut flat.nodes {
        if let GraphNode::Layer(layer) = node {
            for group in &mut layer.inbound {
                *group = rewrite_refs(group, &rewrites);
            }
        }
    }
    flat.output_layers = rewrite_refs(&flat.output_layers, &rewrites);

    check_endpoints(&flat)?;
    flat.validate_names()?;
    Ok(flat)
}

struct Spliced {
    name: String,
    outputs: Vec<String>,
    layers: Vec<LayerRecord>,
}

// Normalizes a nested composite and rewires it for splicing: its input layers
// are matched pairwise against the producers feeding the composite in the
// parent graph. InputLayer records vanish; anything else adopts the producer
// as its inbound connection.
fn splice(sub: ModelGraph) -> Result<Spliced, GraphError> {
    let inbound = sub.inbound.clone();
    let sub = normalize(sub)?;

    let producers = match inbound.len() {
        1 => inbound.into_iter().next().unwrap_or_default(),
        n => {
            return Err(GraphError::InvariantViolation(format!(
                "nested model {} has {} inbound node groups, expected exactly one",
                sub.name, n
            )))
        }
    };
    if producers.len() != sub.input_layers.len() {
        return Err(GraphError::InvariantViolation(format!(
            "nested model {} has {} input layers but {} inbound producers",
            sub.name,
            sub.input_layers.len(),
            producers.len()
        )));
    }

    let mut dropped: HashMap<String, Vec<String>> = HashMap::new();
    let mut attached: HashMap<String, String> = HashMap::new();
    for (input_name, producer) in sub.input_layers.iter().zip(&producers) {
        let layer = sub.layer(input_name).ok_or_else(|| {
            GraphError::InvariantViolation(format!(
                "nested model {} names missing input layer {}",
                sub.name, input_name
            ))
        })?;
        if layer.class_name == "InputLayer" {
            dropped.insert(input_name.clone(), vec![producer.clone()]);
        } else {
            attached.insert(input_name.clone(), producer.clone());
        }
    }

    let mut layers = Vec::with_capacity(sub.nodes.len());
    for node in sub.nodes {
        let mut layer = match node {
            GraphNode::Layer(layer) => layer,
            GraphNode::Composite(_) => unreachable!("normalized graphs are flat"),
        };
        if dropped.contains_key(&layer.name) {
            continue;
        }
        if let Some(producer) = attached.get(&layer.name) {
            layer.inbound = vec![vec![producer.clone()]];
        } else {
            for group in &mut layer.inbound {
                *group = rewrite_refs(group, &dropped);
            }
        }
        layers.push(layer);
    }

    Ok(Spliced {
        name: sub.name,
        outputs: sub.output_layers,
        layers,
    })
}

// A Sequential save holding exactly one inner model is a wrapper: unwrap it,
// handing the wrapper's name and inbound bookkeeping to the inner model.
fn unwrap_wrapper(graph: ModelGraph) -> Result<ModelGraph, GraphError> {
    if graph.kind != GraphKind::Sequential || graph.nodes.len() != 1 {
        return Ok(graph);
    }
    match graph.nodes.into_iter().next() {
        Some(GraphNode::Composite(mut inner)) => {
            inner.name = graph.name;
            inner.inbound = graph.inbound;
            normalize(inner)
        }
        Some(node) => Ok(ModelGraph {
            name: graph.name,
            kind: GraphKind::Sequential,
            inbound: graph.inbound,
            nodes: vec![node],
            input_layers: graph.input_layers,
            output_layers: graph.output_layers,
        }),
        None => unreachable!("length checked above"),
    }
}

fn rewrite_refs(group: &[String], map: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut out = Vec::with_capacity(group.len());
    for name in group {
        match map.get(name) {
            Some(replacements) => out.extend(replacements.iter().cloned()),
            None => out.push(name.clone()),
        }
    }
    out
}

fn check_endpoints(graph: &ModelGraph) -> Result<(), GraphError> {
    for name in graph.input_layers.iter().chain(&graph.output_layers) {
        if graph.layer(name).is_none() {
            return Err(GraphError::InvariantViolation(format!(
                "graph endpoint {} does not name a layer",
                name
            )));
        }
    }
    Ok(())
}
