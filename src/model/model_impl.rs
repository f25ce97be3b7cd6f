use std::fmt;

use slotmap::{SecondaryMap, SlotMap};

use super::node::Node;
use super::port::{PortElements, PortRange};
use super::topology::{topological_sort, Cycle};
use super::types::{NodeId, NodeKey, PortValues, PropertyBag};
use crate::error::{ModelError, ModelResult};

/// A node together with the bookkeeping the model keeps for it.
pub struct NodeEntry {
    pub id: NodeId,
    pub node: Box<dyn Node>,
    pub metadata: PropertyBag,
}

impl Clone for NodeEntry {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            node: self.node.clone_node(),
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEntry")
            .field("id", &self.id)
            .field("type", &self.node.type_name())
            .finish()
    }
}

/// Owning container of a node graph.
///
/// Nodes can only reference ports of nodes already in the model, so the graph
/// is acyclic by construction. Dependents are registered when a node is added
/// and are plain keys, never owning references.
#[derive(Clone, Debug, Default)]
pub struct Model {
    nodes: SlotMap<NodeKey, NodeEntry>,
    order: Vec<NodeKey>,
    dependents: SecondaryMap<NodeKey, Vec<NodeKey>>,
    values: SecondaryMap<NodeKey, Vec<PortValues>>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node after validating every range its input ports reference.
    /// On failure the model is left unchanged.
    pub fn add_node<N: Node>(&mut self, node: N) -> ModelResult<NodeKey> {
        self.add_boxed_node(Box::new(node), None, PropertyBag::new())
    }

    pub(crate) fn add_boxed_node(
        &mut self,
        node: Box<dyn Node>,
        id: Option<NodeId>,
        metadata: PropertyBag,
    ) -> ModelResult<NodeKey> {
        for input in node.input_ports() {
            for range in input.elements.ranges() {
                self.validate_range(range)?;
            }
        }

        let parents = distinct_parents(node.as_ref());
        let key = self.nodes.insert(NodeEntry {
            id: id.unwrap_or_else(NodeId::next),
            node,
            metadata,
        });
        self.order.push(key);
        self.dependents.insert(key, Vec::new());
        for parent in parents {
            if let Some(list) = self.dependents.get_mut(parent) {
                list.push(key);
            }
        }
        Ok(key)
    }

    fn validate_range(&self, range: &PortRange) -> ModelResult<()> {
        let entry = self
            .nodes
            .get(range.node)
            .ok_or_else(|| ModelError::NodeNotFound(format!("{:?}", range.node)))?;
        let port = entry.node.output_ports().get(range.output).ok_or_else(|| {
            ModelError::PortNotFound(format!("output #{} of node {}", range.output, entry.id))
        })?;
        if port.port_type != range.port_type {
            return Err(ModelError::TypeMismatch {
                expected: port.port_type,
                found: range.port_type,
            });
        }
        if range.end() > port.size {
            return Err(ModelError::OutOfRange(format!(
                "range {}..{} of port '{}' (size {}) on node {}",
                range.start,
                range.end(),
                port.name,
                port.size,
                entry.id
            )));
        }
        Ok(())
    }

    /// Number of nodes.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn entry(&self, key: NodeKey) -> ModelResult<&NodeEntry> {
        self.nodes
            .get(key)
            .ok_or_else(|| ModelError::NodeNotFound(format!("{:?}", key)))
    }

    pub fn entry_mut(&mut self, key: NodeKey) -> ModelResult<&mut NodeEntry> {
        self.nodes
            .get_mut(key)
            .ok_or_else(|| ModelError::NodeNotFound(format!("{:?}", key)))
    }

    pub fn node(&self, key: NodeKey) -> ModelResult<&dyn Node> {
        self.entry(key).map(|e| e.node.as_ref())
    }

    pub fn node_as<T: Node>(&self, key: NodeKey) -> Option<&T> {
        self.nodes.get(key).and_then(|e| e.node.downcast_ref::<T>())
    }

    pub fn node_as_mut<T: Node>(&mut self, key: NodeKey) -> Option<&mut T> {
        self.nodes.get_mut(key).and_then(|e| e.node.downcast_mut::<T>())
    }

    pub fn node_id(&self, key: NodeKey) -> ModelResult<NodeId> {
        self.entry(key).map(|e| e.id)
    }

    pub fn key_of(&self, id: NodeId) -> Option<NodeKey> {
        self.nodes.iter().find(|(_, e)| e.id == id).map(|(k, _)| k)
    }

    pub fn metadata(&self, key: NodeKey) -> ModelResult<&PropertyBag> {
        self.entry(key).map(|e| &e.metadata)
    }

    pub fn metadata_mut(&mut self, key: NodeKey) -> ModelResult<&mut PropertyBag> {
        self.entry_mut(key).map(|e| &mut e.metadata)
    }

    /// Keys in the order nodes were added.
    pub fn insertion_order(&self) -> &[NodeKey] {
        &self.order
    }

    /// A fresh dependency-ordered pass over all nodes.
    pub fn nodes(&self) -> ModelResult<NodeIterator> {
        self.sorted(self.order.iter().copied())
    }

    /// A dependency-ordered pass over `roots` and everything they depend on.
    pub fn nodes_for(&self, roots: &[NodeKey]) -> ModelResult<NodeIterator> {
        self.sorted(roots.iter().copied())
    }

    fn sorted(&self, roots: impl IntoIterator<Item = NodeKey>) -> ModelResult<NodeIterator> {
        let order = topological_sort(roots, |key| self.parent_nodes(*key)).map_err(|Cycle(keys)| {
            ModelError::CycleDetected(keys.iter().filter_map(|k| self.nodes.get(*k).map(|e| e.id)).collect())
        })?;
        Ok(NodeIterator { order, position: 0 })
    }

    /// Distinct nodes referenced by `key`'s input ports.
    pub fn parent_nodes(&self, key: NodeKey) -> Vec<NodeKey> {
        self.nodes
            .get(key)
            .map(|e| distinct_parents(e.node.as_ref()))
            .unwrap_or_default()
    }

    /// Nodes registered as reading one of `key`'s outputs.
    pub fn dependent_nodes(&self, key: NodeKey) -> &[NodeKey] {
        self.dependents.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True if any other node reads output `output` of `key`.
    pub fn is_output_referenced(&self, key: NodeKey, output: usize) -> bool {
        self.dependent_nodes(key).iter().any(|&dependent| {
            self.nodes.get(dependent).is_some_and(|e| {
                e.node.input_ports().iter().any(|p| {
                    p.elements
                        .ranges()
                        .iter()
                        .any(|r| r.node == key && r.output == output)
                })
            })
        })
    }

    /// Elements covering the whole output port `name` of `key`.
    pub fn output_elements(&self, key: NodeKey, name: &str) -> ModelResult<PortElements> {
        let node = self.node(key)?;
        let index = node.ports().output_index(name)?;
        let port = &node.output_ports()[index];
        Ok(PortElements::whole(key, index, port.port_type, port.size))
    }

    /// Elements covering the first output port of `key`.
    pub fn output(&self, key: NodeKey) -> ModelResult<PortElements> {
        let node = self.node(key)?;
        let port = node
            .output_ports()
            .first()
            .ok_or_else(|| ModelError::PortNotFound(format!("{} has no outputs", node.type_name())))?;
        Ok(PortElements::whole(key, 0, port.port_type, port.size))
    }

    /// Keys of every node of concrete type `T`, in insertion order.
    pub fn nodes_of_type<T: Node>(&self) -> Vec<NodeKey> {
        self.order
            .iter()
            .copied()
            .filter(|&k| self.nodes.get(k).is_some_and(|e| e.node.is::<T>()))
            .collect()
    }

    /// Interprets the nodes `elements` depend on and returns the selected values.
    pub fn compute_output(&mut self, elements: &PortElements) -> ModelResult<PortValues> {
        let roots: Vec<NodeKey> = elements.ranges().iter().map(|r| r.node).collect();
        self.compute_nodes(&roots)?;
        self.gather(elements)
    }

    /// Interprets `roots` and their ancestors in dependency order.
    pub fn compute_nodes(&mut self, roots: &[NodeKey]) -> ModelResult<()> {
        let order: Vec<NodeKey> = self.nodes_for(roots)?.collect();
        for key in order {
            let inputs = {
                let node = self.node(key)?;
                node.input_ports()
                    .iter()
                    .map(|p| self.gather(&p.elements))
                    .collect::<ModelResult<Vec<_>>>()?
            };
            let entry = self.entry_mut(key)?;
            let outputs = entry.node.compute(&inputs)?;
            check_outputs(entry, &outputs)?;
            self.values.insert(key, outputs);
        }
        Ok(())
    }

    /// Reads the cached values `elements` select. Every referenced node must
    /// have been computed.
    pub fn gather(&self, elements: &PortElements) -> ModelResult<PortValues> {
        let mut result = PortValues::zeros(elements.port_type(), 0);
        for range in elements.ranges() {
            let values = self
                .values
                .get(range.node)
                .and_then(|outputs| outputs.get(range.output))
                .ok_or_else(|| {
                    ModelError::InvalidArgument(format!(
                        "output #{} of {:?} read before it was computed",
                        range.output, range.node
                    ))
                })?;
            result.extend_from(&values.slice(range.start, range.count));
        }
        Ok(result)
    }

    /// Resets every stateful node and drops cached values.
    pub fn reset(&mut self) {
        for entry in self.nodes.values_mut() {
            entry.node.reset();
        }
        self.values.clear();
    }
}

fn distinct_parents(node: &dyn Node) -> Vec<NodeKey> {
    let mut parents = Vec::new();
    for input in node.input_ports() {
        for range in input.elements.ranges() {
            if !parents.contains(&range.node) {
                parents.push(range.node);
            }
        }
    }
    parents
}

fn check_outputs(entry: &NodeEntry, outputs: &[PortValues]) -> ModelResult<()> {
    let declared = entry.node.output_ports();
    if outputs.len() != declared.len() {
        return Err(ModelError::InvalidArgument(format!(
            "{} produced {} outputs, declares {}",
            entry.node.type_name(),
            outputs.len(),
            declared.len()
        )));
    }
    for (port, values) in declared.iter().zip(outputs) {
        if values.port_type() != port.port_type {
            return Err(ModelError::TypeMismatch {
                expected: port.port_type,
                found: values.port_type(),
            });
        }
        if values.len() != port.size {
            return Err(ModelError::InvalidArgument(format!(
                "{} output '{}' has {} values, declares {}",
                entry.node.type_name(),
                port.name,
                values.len(),
                port.size
            )));
        }
    }
    Ok(())
}

/// Restartable, finite pass over node keys in dependency order.
#[derive(Debug, Clone)]
pub struct NodeIterator {
    order: Vec<NodeKey>,
    position: usize,
}

impl NodeIterator {
    pub fn is_valid(&self) -> bool {
        self.position < self.order.len()
    }

    /// Current node; out of range once the pass is exhausted.
    pub fn get(&self) -> ModelResult<NodeKey> {
        self.order
            .get(self.position)
            .copied()
            .ok_or_else(|| ModelError::OutOfRange("node iterator exhausted".into()))
    }

    /// Moves to the next node; advancing an exhausted pass is out of range.
    pub fn advance(&mut self) -> ModelResult<()> {
        if !self.is_valid() {
            return Err(ModelError::OutOfRange("node iterator exhausted".into()));
        }
        self.position += 1;
        Ok(())
    }

    pub fn restart(&mut self) {
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Iterator for NodeIterator {
    type Item = NodeKey;

    fn next(&mut self) -> Option<NodeKey> {
        let key = self.order.get(self.position).copied();
        if key.is_some() {
            self.position += 1;
        }
        key
    }
}
