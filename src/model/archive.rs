//! Versioned JSON archive for models and maps.
//!
//! Nodes are written in dependency order and reconstructed through a
//! [`NodeRegistry`] keyed by the node kind in their type name, so
//! `"BinaryOperationNode<double>"` dispatches to the `BinaryOperationNode`
//! factory with a `Real` element type.

use std::collections::HashMap;
use std::io::{Read, Write};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::map::Map;
use super::model_impl::Model;
use super::node::Node;
use super::port::{PortElements, PortRange};
use super::types::{NodeId, NodeKey, PortType, PropertyBag};
use crate::error::{ModelError, ModelResult};

pub const ARCHIVE_VERSION: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeArchive {
    pub node: NodeId,
    pub output: String,
    pub start: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputArchive {
    pub name: String,
    pub ranges: Vec<RangeArchive>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeArchive {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: NodeId,
    #[serde(default)]
    pub inputs: Vec<InputArchive>,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub metadata: PropertyBag,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelArchive {
    pub nodes: Vec<NodeArchive>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapArchive {
    pub version: u32,
    pub model: ModelArchive,
    pub input_names: Vec<String>,
    pub input_ids: Vec<NodeId>,
    pub output_names: Vec<String>,
    pub output_elements: Vec<Vec<RangeArchive>>,
    #[serde(default)]
    pub metadata: PropertyBag,
}

/// Named input elements of a node being read back, already resolved against
/// the model under construction.
#[derive(Debug, Default)]
pub struct ArchivedInputs {
    inputs: Vec<(String, PortElements)>,
}

impl ArchivedInputs {
    pub fn get(&self, name: &str) -> ModelResult<PortElements> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| ModelError::PortNotFound(name.to_string()))
    }

    /// All inputs whose name starts with `prefix`, in archive order.
    pub fn with_prefix(&self, prefix: &str) -> Vec<PortElements> {
        self.inputs
            .iter()
            .filter(|(n, _)| n.starts_with(prefix))
            .map(|(_, e)| e.clone())
            .collect()
    }
}

/// A node type that can be rebuilt from its archived form.
pub trait ArchivableNode: Node + Sized {
    /// Kind part of the type name, e.g. `"UnaryOperationNode"`.
    const KIND: &'static str;

    fn from_archive(
        port_type: Option<PortType>,
        properties: &Value,
        inputs: &ArchivedInputs,
    ) -> ModelResult<Self>;
}

pub type NodeFactory = fn(Option<PortType>, &Value, &ArchivedInputs) -> ModelResult<Box<dyn Node>>;

fn make<T: ArchivableNode>(
    port_type: Option<PortType>,
    properties: &Value,
    inputs: &ArchivedInputs,
) -> ModelResult<Box<dyn Node>> {
    Ok(Box::new(T::from_archive(port_type, properties, inputs)?))
}

/// Maps node kinds to factories.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    factories: HashMap<&'static str, NodeFactory>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("NodeRegistry").field("kinds", &kinds).finish()
    }
}

static STANDARD_REGISTRY: Lazy<NodeRegistry> = Lazy::new(|| {
    let mut registry = NodeRegistry::new();
    crate::nodes::register_standard_nodes(&mut registry);
    registry
});

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every node type this crate defines.
    pub fn standard() -> &'static NodeRegistry {
        &STANDARD_REGISTRY
    }

    pub fn register<T: ArchivableNode>(&mut self) {
        self.factories.insert(T::KIND, make::<T>);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Builds a node from its full type name. Unknown kinds are an invalid
    /// argument.
    pub fn create(
        &self,
        type_name: &str,
        properties: &Value,
        inputs: &ArchivedInputs,
    ) -> ModelResult<Box<dyn Node>> {
        let (kind, port_type) = split_type_name(type_name)?;
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ModelError::InvalidArgument(format!("unknown node type '{}'", type_name)))?;
        factory(port_type, properties, inputs)
    }
}

/// Splits `Kind<elem>` into its kind and element type.
pub fn split_type_name(type_name: &str) -> ModelResult<(&str, Option<PortType>)> {
    match type_name.split_once('<') {
        None => Ok((type_name, None)),
        Some((kind, rest)) => {
            let element = rest.strip_suffix('>').ok_or_else(|| {
                ModelError::InvalidArgument(format!("malformed node type '{}'", type_name))
            })?;
            let port_type = PortType::from_type_name(element).ok_or_else(|| {
                ModelError::InvalidArgument(format!("unknown element type in '{}'", type_name))
            })?;
            Ok((kind, Some(port_type)))
        }
    }
}

/// Reads an optional property, failing with a descriptive error when it is
/// present but malformed.
pub fn property<T: serde::de::DeserializeOwned>(properties: &Value, name: &str) -> ModelResult<Option<T>> {
    match properties.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| ModelError::InvalidArgument(format!("property '{}': {}", name, e))),
    }
}

/// Reads a required property.
pub fn required_property<T: serde::de::DeserializeOwned>(properties: &Value, name: &str) -> ModelResult<T> {
    property(properties, name)?
        .ok_or_else(|| ModelError::InvalidArgument(format!("missing property '{}'", name)))
}

/// Requires the element type part of a type name.
pub fn required_port_type(port_type: Option<PortType>, kind: &str) -> ModelResult<PortType> {
    port_type.ok_or_else(|| ModelError::InvalidArgument(format!("{} needs an element type", kind)))
}

fn archive_elements(model: &Model, elements: &PortElements) -> ModelResult<Vec<RangeArchive>> {
    elements
        .ranges()
        .iter()
        .map(|r| {
            let entry = model.entry(r.node)?;
            let port = entry.node.output_ports().get(r.output).ok_or_else(|| {
                ModelError::PortNotFound(format!("output #{} of node {}", r.output, entry.id))
            })?;
            Ok(RangeArchive {
                node: entry.id,
                output: port.name.clone(),
                start: r.start,
                count: r.count,
            })
        })
        .collect()
}

fn restore_elements(
    model: &Model,
    keys: &HashMap<NodeId, NodeKey>,
    ranges: &[RangeArchive],
) -> ModelResult<PortElements> {
    let ranges = ranges
        .iter()
        .map(|r| {
            let key = *keys
                .get(&r.node)
                .ok_or_else(|| ModelError::NodeNotFound(r.node.to_string()))?;
            let node = model.node(key)?;
            let output = node.ports().output_index(&r.output)?;
            Ok(PortRange {
                node: key,
                output,
                port_type: node.output_ports()[output].port_type,
                start: r.start,
                count: r.count,
            })
        })
        .collect::<ModelResult<Vec<_>>>()?;
    PortElements::from_ranges(ranges)
}

/// Captures `model` as an archive, nodes in dependency order.
pub fn archive_model(model: &Model) -> ModelResult<ModelArchive> {
    let mut nodes = Vec::with_capacity(model.size());
    for key in model.nodes()? {
        let entry = model.entry(key)?;
        let inputs = entry
            .node
            .input_ports()
            .iter()
            .map(|p| {
                Ok(InputArchive {
                    name: p.name.clone(),
                    ranges: archive_elements(model, &p.elements)?,
                })
            })
            .collect::<ModelResult<Vec<_>>>()?;
        nodes.push(NodeArchive {
            type_name: entry.node.type_name(),
            id: entry.id,
            inputs,
            properties: entry.node.properties()?,
            metadata: entry.metadata.clone(),
        });
    }
    Ok(ModelArchive { nodes })
}

/// Rebuilds a model. Nothing is returned if any node fails to load.
pub fn restore_model(
    archive: &ModelArchive,
    registry: &NodeRegistry,
) -> ModelResult<(Model, HashMap<NodeId, NodeKey>)> {
    let mut model = Model::new();
    let mut keys = HashMap::with_capacity(archive.nodes.len());
    for archived in &archive.nodes {
        let inputs = archived
            .inputs
            .iter()
            .map(|i| Ok((i.name.clone(), restore_elements(&model, &keys, &i.ranges)?)))
            .collect::<ModelResult<Vec<_>>>()?;
        let node = registry.create(
            &archived.type_name,
            &archived.properties,
            &ArchivedInputs { inputs },
        )?;
        let key = model.add_boxed_node(node, Some(archived.id), archived.metadata.clone())?;
        keys.insert(archived.id, key);
    }
    Ok((model, keys))
}

pub fn archive_map(map: &Map) -> ModelResult<MapArchive> {
    let model = map.model();
    Ok(MapArchive {
        version: ARCHIVE_VERSION,
        model: archive_model(model)?,
        input_names: map.inputs().iter().map(|(n, _)| n.clone()).collect(),
        input_ids: map
            .inputs()
            .iter()
            .map(|(_, k)| model.node_id(*k))
            .collect::<ModelResult<_>>()?,
        output_names: map.outputs().iter().map(|(n, _)| n.clone()).collect(),
        output_elements: map
            .outputs()
            .iter()
            .map(|(_, e)| archive_elements(model, e))
            .collect::<ModelResult<_>>()?,
        metadata: map.metadata().clone(),
    })
}

pub fn restore_map(archive: &MapArchive, registry: &NodeRegistry) -> ModelResult<Map> {
    if archive.version != ARCHIVE_VERSION {
        return Err(ModelError::InvalidArgument(format!(
            "unsupported archive version {} (expected {})",
            archive.version, ARCHIVE_VERSION
        )));
    }
    if archive.input_names.len() != archive.input_ids.len()
        || archive.output_names.len() != archive.output_elements.len()
    {
        return Err(ModelError::InvalidArgument("map bindings are inconsistent".into()));
    }
    let (model, keys) = restore_model(&archive.model, registry)?;
    let inputs = archive
        .input_names
        .iter()
        .zip(&archive.input_ids)
        .map(|(name, id)| {
            let key = *keys
                .get(id)
                .ok_or_else(|| ModelError::NodeNotFound(id.to_string()))?;
            Ok((name.clone(), key))
        })
        .collect::<ModelResult<Vec<_>>>()?;
    let outputs = archive
        .output_names
        .iter()
        .zip(&archive.output_elements)
        .map(|(name, ranges)| Ok((name.clone(), restore_elements(&model, &keys, ranges)?)))
        .collect::<ModelResult<Vec<_>>>()?;
    Ok(Map::from_parts(model, inputs, outputs, archive.metadata.clone()))
}

pub fn save_map<W: Write>(map: &Map, writer: W) -> ModelResult<()> {
    serde_json::to_writer_pretty(writer, &archive_map(map)?)?;
    Ok(())
}

pub fn load_map<R: Read>(reader: R) -> ModelResult<Map> {
    let archive: MapArchive = serde_json::from_reader(reader)?;
    restore_map(&archive, NodeRegistry::standard())
}

pub fn map_to_string(map: &Map) -> ModelResult<String> {
    Ok(serde_json::to_string_pretty(&archive_map(map)?)?)
}

pub fn map_from_str(text: &str) -> ModelResult<Map> {
    let archive: MapArchive = serde_json::from_str(text)?;
    restore_map(&archive, NodeRegistry::standard())
}

pub fn model_to_string(model: &Model) -> ModelResult<String> {
    Ok(serde_json::to_string_pretty(&archive_model(model)?)?)
}

pub fn model_from_str(text: &str) -> ModelResult<Model> {
    let archive: ModelArchive = serde_json::from_str(text)?;
    Ok(restore_model(&archive, NodeRegistry::standard())?.0)
}
