use std::collections::HashMap;

use super::model_impl::Model;
use super::node::Node;
use super::port::PortElements;
use super::types::{NodeId, NodeKey, PropertyBag};
use crate::error::{ModelError, ModelResult};

/// Builds a new model out of an existing one, node by node.
///
/// While a source node is being transformed the transformer remembers which
/// node that is, so the outputs a refinement produces can be mapped back to
/// the source node's output ports. The mapping composes across passes, so
/// after `refine_model` a port of the original model still resolves to its
/// counterpart in the final model.
#[derive(Debug, Default)]
pub struct ModelTransformer {
    model: Model,
    port_map: HashMap<(NodeKey, usize), PortElements>,
    current: Option<Current>,
    modified: bool,
}

#[derive(Debug, Clone)]
struct Current {
    key: NodeKey,
    id: NodeId,
    metadata: PropertyBag,
}

impl ModelTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The model being built.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// True if any node added during the last transform was not a plain copy.
    pub fn is_model_modified(&self) -> bool {
        self.modified
    }

    /// Rewrites source-model elements into target-model elements.
    pub fn transform_elements(&self, elements: &PortElements) -> ModelResult<PortElements> {
        elements.map_ranges(|range| {
            let target = self.port_map.get(&(range.node, range.output)).ok_or_else(|| {
                ModelError::NodeNotFound(format!(
                    "output #{} of {:?} has no counterpart in the transformed model",
                    range.output, range.node
                ))
            })?;
            target.sub_range(range.start, range.count)
        })
    }

    /// Alias of `transform_elements` for callers resolving map outputs.
    pub fn corresponding_outputs(&self, elements: &PortElements) -> ModelResult<PortElements> {
        self.transform_elements(elements)
    }

    /// Target node standing in for a source input node.
    pub fn corresponding_input_node(&self, key: NodeKey) -> ModelResult<NodeKey> {
        self.port_map
            .get(&(key, 0))
            .and_then(PortElements::as_single_range)
            .map(|r| r.node)
            .ok_or_else(|| ModelError::NodeNotFound(format!("input node {:?} was not carried over", key)))
    }

    /// Adds a new node whose inputs already reference target-model elements.
    /// The node inherits the metadata of the node being transformed.
    pub fn add_node<N: Node>(&mut self, node: N) -> ModelResult<NodeKey> {
        let metadata = self
            .current
            .as_ref()
            .map(|c| c.metadata.clone())
            .unwrap_or_default();
        self.modified = true;
        self.model.add_boxed_node(Box::new(node), None, metadata)
    }

    /// Metadata of a node already added to the target model.
    pub fn metadata_mut(&mut self, key: NodeKey) -> ModelResult<&mut PropertyBag> {
        self.model.metadata_mut(key)
    }

    /// Declares that output `output` of the node being transformed is now
    /// computed by `elements` in the target model.
    pub fn map_output(&mut self, output: usize, elements: PortElements) -> ModelResult<()> {
        let current = self
            .current
            .as_ref()
            .ok_or_else(|| ModelError::InvalidArgument("map_output outside of a transform".into()))?;
        self.port_map.insert((current.key, output), elements);
        Ok(())
    }

    /// Copies a node (cloned from the source model) into the target model,
    /// rewriting its inputs and mapping all of its outputs.
    pub fn copy_node(&mut self, mut node: Box<dyn Node>) -> ModelResult<NodeKey> {
        let current = self
            .current
            .clone()
            .ok_or_else(|| ModelError::InvalidArgument("copy_node outside of a transform".into()))?;
        for input in node.ports_mut().inputs.iter_mut() {
            input.elements = self.transform_elements(&input.elements)?;
        }
        let outputs: Vec<_> = node
            .output_ports()
            .iter()
            .map(|p| (p.port_type, p.size))
            .collect();
        let key = self
            .model
            .add_boxed_node(node, Some(current.id), current.metadata)?;
        for (index, (port_type, size)) in outputs.into_iter().enumerate() {
            self.port_map
                .insert((current.key, index), PortElements::whole(key, index, port_type, size));
        }
        Ok(key)
    }

    /// Runs `f` on every node of `model` in dependency order and returns the
    /// model it built.
    pub fn transform_model<F>(&mut self, model: &Model, f: F) -> ModelResult<Model>
    where
        F: FnMut(&Model, NodeKey, &dyn Node, &mut ModelTransformer) -> ModelResult<()>,
    {
        let order: Vec<NodeKey> = model.nodes()?.collect();
        self.transform_nodes(model, order, f)
    }

    fn transform_nodes<F>(&mut self, model: &Model, order: Vec<NodeKey>, mut f: F) -> ModelResult<Model>
    where
        F: FnMut(&Model, NodeKey, &dyn Node, &mut ModelTransformer) -> ModelResult<()>,
    {
        self.model = Model::new();
        self.port_map.clear();
        self.modified = false;
        for key in order {
            let entry = model.entry(key)?;
            self.current = Some(Current {
                key,
                id: entry.id,
                metadata: entry.metadata.clone(),
            });
            let result = f(model, key, entry.node.as_ref(), self);
            self.current = None;
            result?;
        }
        Ok(std::mem::take(&mut self.model))
    }

    /// Copies every node of `model`.
    pub fn copy_model(&mut self, model: &Model) -> ModelResult<Model> {
        self.transform_model(model, |_, _, node, t| t.copy_node(node.clone_node()).map(|_| ()))
    }

    /// Copies `roots` and everything they depend on.
    pub fn copy_model_subset(&mut self, model: &Model, roots: &[NodeKey]) -> ModelResult<Model> {
        let order: Vec<NodeKey> = model.nodes_for(roots)?.collect();
        self.transform_nodes(model, order, |_, _, node, t| {
            t.copy_node(node.clone_node()).map(|_| ())
        })
    }

    /// One refinement pass: nodes accepted by `predicate` refine themselves,
    /// the rest are copied.
    pub fn refine_pass(
        &mut self,
        model: &Model,
        predicate: &dyn Fn(&dyn Node) -> bool,
    ) -> ModelResult<(Model, bool)> {
        let mut changed = false;
        let refined = self.transform_model(model, |_, _, node, t| {
            if predicate(node) {
                changed |= node.refine(t)?;
            } else {
                t.copy_node(node.clone_node())?;
            }
            Ok(())
        })?;
        Ok((refined, changed))
    }

    /// Refines `model` until nothing changes or `max_iterations` passes ran.
    /// Running out of iterations is not an error. Afterwards the transformer
    /// maps ports of `model` to ports of the returned model.
    pub fn refine_model(
        &mut self,
        model: &Model,
        max_iterations: usize,
        predicate: &dyn Fn(&dyn Node) -> bool,
    ) -> ModelResult<Model> {
        let mut current = self.copy_model(model)?;
        let mut modified = false;
        for iteration in 0..max_iterations {
            let mut pass = ModelTransformer::new();
            let (refined, changed) = pass.refine_pass(&current, predicate)?;
            self.compose(&pass)?;
            current = refined;
            log::debug!(
                "refinement pass {} produced {} nodes (changed: {})",
                iteration + 1,
                current.size(),
                changed
            );
            if !changed {
                break;
            }
            modified = true;
        }
        self.modified = modified;
        Ok(current)
    }

    /// Chains `next` after this transformer's mapping. Ports `next` dropped
    /// lose their counterpart.
    pub fn compose(&mut self, next: &ModelTransformer) -> ModelResult<()> {
        let mut composed = HashMap::with_capacity(self.port_map.len());
        for (port, elements) in &self.port_map {
            match next.transform_elements(elements) {
                Ok(target) => {
                    composed.insert(*port, target);
                }
                Err(ModelError::NodeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.port_map = composed;
        Ok(())
    }
}
