use std::sync::Arc;

use parking_lot::Mutex;

use super::model_impl::Model;
use super::node::Node;
use super::port::PortElements;
use super::transformer::ModelTransformer;
use super::types::{Element, NodeKey, PortType, PortValues, PropertyBag, TensorShape};
use crate::error::{ModelError, ModelResult};
use crate::nodes::{InputNode, SinkNode, SourceNode};
use crate::optimizer::ModelOptimizer;

/// Selects one of a map's inputs or outputs, by name or position.
#[derive(Debug, Clone, Copy)]
pub enum MapPort<'a> {
    Name(&'a str),
    Index(usize),
}

impl<'a> From<&'a str> for MapPort<'a> {
    fn from(name: &'a str) -> Self {
        MapPort::Name(name)
    }
}

impl From<usize> for MapPort<'_> {
    fn from(index: usize) -> Self {
        MapPort::Index(index)
    }
}

/// Binds a model to named inputs and outputs.
///
/// The map owns its model: refinement and optimization rewrite the map's copy
/// and carry the bindings over, leaving the caller's model untouched.
#[derive(Debug, Clone)]
pub struct Map {
    model: Model,
    inputs: Vec<(String, NodeKey)>,
    outputs: Vec<(String, PortElements)>,
    metadata: PropertyBag,
}

impl Map {
    /// Creates a map over a copy of `model`, keeping only what the bindings
    /// and any sink nodes need.
    pub fn new<S: Into<String>, T: Into<String>>(
        model: &Model,
        inputs: Vec<(S, NodeKey)>,
        outputs: Vec<(T, PortElements)>,
    ) -> ModelResult<Self> {
        let inputs: Vec<(String, NodeKey)> = inputs.into_iter().map(|(n, k)| (n.into(), k)).collect();
        let outputs: Vec<(String, PortElements)> =
            outputs.into_iter().map(|(n, e)| (n.into(), e)).collect();

        for (name, key) in &inputs {
            let node = model.node(*key)?;
            if !node.is::<InputNode>() {
                return Err(ModelError::InvalidArgument(format!(
                    "map input '{}' is bound to a {}, not an input node",
                    name,
                    node.type_name()
                )));
            }
        }
        for (name, elements) in &outputs {
            for range in elements.ranges() {
                let node = model.node(range.node)?;
                let port = node.output_ports().get(range.output).ok_or_else(|| {
                    ModelError::PortNotFound(format!("output #{} for map output '{}'", range.output, name))
                })?;
                if range.end() > port.size {
                    return Err(ModelError::OutOfRange(format!(
                        "map output '{}' selects past the end of '{}'",
                        name, port.name
                    )));
                }
            }
        }

        let mut map = Self {
            model: model.clone(),
            inputs,
            outputs,
            metadata: PropertyBag::new(),
        };
        map.prune()?;
        Ok(map)
    }

    /// Rebuilds a map from parts that already share one model, as the
    /// archive does.
    pub(crate) fn from_parts(
        model: Model,
        inputs: Vec<(String, NodeKey)>,
        outputs: Vec<(String, PortElements)>,
        metadata: PropertyBag,
    ) -> Self {
        Self {
            model,
            inputs,
            outputs,
            metadata,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn metadata(&self) -> &PropertyBag {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut PropertyBag {
        &mut self.metadata
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(n, _)| n.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(n, _)| n.as_str())
    }

    pub fn inputs(&self) -> &[(String, NodeKey)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(String, PortElements)] {
        &self.outputs
    }

    fn input_index<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<usize> {
        match port.into() {
            MapPort::Index(i) if i < self.inputs.len() => Ok(i),
            MapPort::Index(i) => Err(ModelError::OutOfRange(format!(
                "input index {} (map has {})",
                i,
                self.inputs.len()
            ))),
            MapPort::Name(name) => self
                .inputs
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| ModelError::InvalidArgument(format!("no map input named '{}'", name))),
        }
    }

    fn output_index<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<usize> {
        match port.into() {
            MapPort::Index(i) if i < self.outputs.len() => Ok(i),
            MapPort::Index(i) => Err(ModelError::OutOfRange(format!(
                "output index {} (map has {})",
                i,
                self.outputs.len()
            ))),
            MapPort::Name(name) => self
                .outputs
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| ModelError::InvalidArgument(format!("no map output named '{}'", name))),
        }
    }

    pub fn input_node<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<NodeKey> {
        let index = self.input_index(port)?;
        Ok(self.inputs[index].1)
    }

    pub fn output_elements<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<&PortElements> {
        let index = self.output_index(port)?;
        Ok(&self.outputs[index].1)
    }

    /// The source node fed by input `index`, if any.
    fn source_for_input(&self, index: usize) -> Option<&SourceNode> {
        let input = self.inputs.get(index)?.1;
        self.model
            .dependent_nodes(input)
            .iter()
            .find_map(|&k| self.model.node_as::<SourceNode>(k))
    }

    /// Element type of the buffer an input is set from.
    pub fn input_type<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<PortType> {
        let node = self.model.node(self.input_node(port)?)?;
        Ok(node.output_ports()[0].port_type)
    }

    /// Shape of the buffer an input is set from.
    pub fn input_shape<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<TensorShape> {
        let node = self.model.node(self.input_node(port)?)?;
        Ok(node.output_ports()[0].shape())
    }

    /// Shape of the data an input delivers. For a source-driven input this is
    /// the source's sample shape, not the clock the input itself carries.
    pub fn data_input_shape<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<TensorShape> {
        let index = self.input_index(port)?;
        match self.source_for_input(index) {
            Some(source) => Ok(source.output_ports()[0].shape()),
            None => self.input_shape(index),
        }
    }

    pub fn input_size<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<usize> {
        Ok(self.input_shape(port)?.size())
    }

    pub fn output_type<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<PortType> {
        Ok(self.output_elements(port)?.port_type())
    }

    /// Shape of an output: the producing port's shape when the output is one
    /// whole port, otherwise a flat vector.
    pub fn output_shape<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<TensorShape> {
        let elements = self.output_elements(port)?;
        if let Some(range) = elements.as_single_range() {
            let node = self.model.node(range.node)?;
            let output = &node.output_ports()[range.output];
            if range.start == 0 && range.count == output.size {
                return Ok(output.shape());
            }
        }
        Ok(TensorShape::vector(elements.size()))
    }

    pub fn output_size<'a>(&self, port: impl Into<MapPort<'a>>) -> ModelResult<usize> {
        Ok(self.output_elements(port)?.size())
    }

    /// Feeds one input. Values of the wrong element type are rejected, as are
    /// values of the wrong length.
    pub fn set_input_value<'a>(&mut self, port: impl Into<MapPort<'a>>, values: PortValues) -> ModelResult<()> {
        let key = self.input_node(port)?;
        let input = self
            .model
            .node_as_mut::<InputNode>(key)
            .ok_or_else(|| ModelError::InvalidArgument("map input is not an input node".into()))?;
        input.set_input(values)
    }

    /// Interprets the nodes one output needs and returns its values.
    pub fn compute_output<'a>(&mut self, port: impl Into<MapPort<'a>>) -> ModelResult<PortValues> {
        let index = self.output_index(port)?;
        let elements = self.outputs[index].1.clone();
        // Sinks run on every evaluation even though no output reads them.
        // One pass over sinks and output producers keeps each node to a
        // single evaluation.
        let mut roots = self.model.nodes_of_type::<SinkNode>();
        roots.extend(elements.ranges().iter().map(|r| r.node));
        self.model.compute_nodes(&roots)?;
        self.model.gather(&elements)
    }

    /// Sets input 0 and reads output 0, converting between element types
    /// through `f64` where they differ.
    pub fn compute<I: Element, O: Element>(&mut self, input: &[I]) -> ModelResult<Vec<O>> {
        let input_type = self.input_type(0usize)?;
        let values = PortValues::from(input.to_vec()).convert(input_type);
        self.set_input_value(0, values)?;
        let output = self.compute_output(0)?.convert(O::PORT_TYPE);
        O::view(&output)
            .map(<[O]>::to_vec)
            .ok_or_else(|| ModelError::InvalidArgument("output conversion failed".into()))
    }

    /// Resets every stateful node.
    pub fn reset(&mut self) {
        self.model.reset();
    }

    /// Installs the interpreter's source callback on every source node.
    pub fn set_source_callback<T, F>(&mut self, callback: F) -> ModelResult<()>
    where
        T: Element,
        F: FnMut(&mut [T]) -> bool + Send + 'static,
    {
        let callback = Arc::new(Mutex::new(callback));
        for key in self.model.nodes_of_type::<SourceNode>() {
            let Some(source) = self.model.node_as_mut::<SourceNode>(key) else {
                continue;
            };
            if source.output_type() != T::PORT_TYPE {
                return Err(ModelError::TypeMismatch {
                    expected: source.output_type(),
                    found: T::PORT_TYPE,
                });
            }
            let callback = Arc::clone(&callback);
            source.set_callback(Arc::new(Mutex::new(move |values: &mut PortValues| {
                match T::view_mut(values) {
                    Some(buffer) => (&mut *callback.lock())(buffer),
                    None => false,
                }
            })));
        }
        Ok(())
    }

    /// Installs the interpreter's sink callback on every sink node.
    pub fn set_sink_callback<T, F>(&mut self, callback: F) -> ModelResult<()>
    where
        T: Element,
        F: FnMut(&[T]) + Send + 'static,
    {
        let callback = Arc::new(Mutex::new(callback));
        for key in self.model.nodes_of_type::<SinkNode>() {
            let Some(sink) = self.model.node_as_mut::<SinkNode>(key) else {
                continue;
            };
            if sink.value_type() != T::PORT_TYPE {
                return Err(ModelError::TypeMismatch {
                    expected: sink.value_type(),
                    found: T::PORT_TYPE,
                });
            }
            let callback = Arc::clone(&callback);
            sink.set_callback(Arc::new(Mutex::new(move |values: &PortValues| {
                if let Some(buffer) = T::view(values) {
                    (&mut *callback.lock())(buffer);
                }
            })));
        }
        Ok(())
    }

    /// Renames the callbacks source and sink nodes call in compiled code.
    pub fn rename_callbacks(&mut self, source_name: &str, sink_name: &str) {
        for key in self.model.nodes_of_type::<SourceNode>() {
            if let Some(source) = self.model.node_as_mut::<SourceNode>(key) {
                source.set_callback_name(source_name);
            }
        }
        for key in self.model.nodes_of_type::<SinkNode>() {
            if let Some(sink) = self.model.node_as_mut::<SinkNode>(key) {
                sink.set_callback_name(sink_name);
            }
        }
    }

    /// Refines the map's model for at most `max_iterations` passes. Stopping
    /// because nothing changed and stopping because the budget ran out are
    /// both success.
    pub fn refine(&mut self, max_iterations: usize) -> ModelResult<()> {
        if max_iterations == 0 {
            return Ok(());
        }
        let mut transformer = ModelTransformer::new();
        let refined = transformer.refine_model(&self.model, max_iterations, &|_| true)?;
        self.adopt(refined, &transformer)?;
        self.prune()
    }

    /// Refines only the nodes `predicate` accepts, once.
    pub fn refine_where(&mut self, predicate: &dyn Fn(&dyn Node) -> bool) -> ModelResult<bool> {
        let mut transformer = ModelTransformer::new();
        let (refined, changed) = transformer.refine_pass(&self.model, predicate)?;
        if changed {
            self.adopt(refined, &transformer)?;
        }
        Ok(changed)
    }

    /// Runs every optimizer pass over the map's model.
    pub fn optimize(&mut self, optimizer: &ModelOptimizer) -> ModelResult<()> {
        let mut model = self.model.clone();
        let mut overall = ModelTransformer::new();
        let mut first = true;
        for pass in optimizer.passes() {
            let mut transformer = ModelTransformer::new();
            let optimized = pass.run(&model, &mut transformer)?;
            log::debug!("optimizer pass '{}': {} -> {} nodes", pass.name(), model.size(), optimized.size());
            if first {
                overall = transformer;
                first = false;
            } else {
                overall.compose(&transformer)?;
            }
            model = optimized;
        }
        if first {
            return Ok(());
        }
        self.adopt(model, &overall)?;
        self.prune()
    }

    /// Rebuilds the map's model node by node through `f`.
    pub fn transform<F>(&mut self, f: F) -> ModelResult<()>
    where
        F: FnMut(&Model, NodeKey, &dyn Node, &mut ModelTransformer) -> ModelResult<()>,
    {
        let mut transformer = ModelTransformer::new();
        let model = transformer.transform_model(&self.model, f)?;
        self.adopt(model, &transformer)
    }

    /// Drops nodes no output depends on. Sink nodes and their inputs stay.
    pub fn prune(&mut self) -> ModelResult<()> {
        let mut roots: Vec<NodeKey> = self.inputs.iter().map(|(_, k)| *k).collect();
        for (_, elements) in &self.outputs {
            roots.extend(elements.ranges().iter().map(|r| r.node));
        }
        roots.extend(self.model.nodes_of_type::<SinkNode>());
        let mut transformer = ModelTransformer::new();
        let pruned = transformer.copy_model_subset(&self.model, &roots)?;
        self.adopt(pruned, &transformer)
    }

    /// Swaps in a transformed model and moves the bindings through the
    /// transformer's mapping. On failure the map is unchanged.
    fn adopt(&mut self, model: Model, transformer: &ModelTransformer) -> ModelResult<()> {
        let inputs = self
            .inputs
            .iter()
            .map(|(n, k)| Ok((n.clone(), transformer.corresponding_input_node(*k)?)))
            .collect::<ModelResult<Vec<_>>>()?;
        let outputs = self
            .outputs
            .iter()
            .map(|(n, e)| Ok((n.clone(), transformer.corresponding_outputs(e)?)))
            .collect::<ModelResult<Vec<_>>>()?;
        self.model = model;
        self.inputs = inputs;
        self.outputs = outputs;
        Ok(())
    }
}
