use serde_json::{json, Value};

use super::codegen::emit_copy;
use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileResult, ModelError, ModelResult};
use crate::model::archive::{property, required_port_type, required_property};
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, OutputPort, PortElements, PortType,
    PortValues, TensorShape,
};
use crate::node_boilerplate;

/// Entry point of a model. Its values are set from outside before each
/// evaluation; compiled code reads them from a predict argument.
#[derive(Debug, Clone)]
pub struct InputNode {
    ports: NodePorts,
    values: PortValues,
}

impl InputNode {
    pub fn new(port_type: PortType, size: usize) -> Self {
        Self::with_shape(port_type, TensorShape::vector(size))
    }

    pub fn with_shape(port_type: PortType, shape: TensorShape) -> Self {
        let output = OutputPort::new("output", port_type, shape.size()).with_shape(shape);
        Self {
            ports: NodePorts::new(Vec::new(), vec![output]),
            values: PortValues::zeros(port_type, shape.size()),
        }
    }

    pub fn port_type(&self) -> PortType {
        self.ports.outputs[0].port_type
    }

    pub fn size(&self) -> usize {
        self.ports.outputs[0].size
    }

    /// Stages the next input. Type and length must match the port.
    pub fn set_input(&mut self, values: PortValues) -> ModelResult<()> {
        if values.port_type() != self.port_type() {
            return Err(ModelError::TypeMismatch {
                expected: self.port_type(),
                found: values.port_type(),
            });
        }
        if values.len() != self.size() {
            return Err(ModelError::InvalidArgument(format!(
                "input takes {} values, got {}",
                self.size(),
                values.len()
            )));
        }
        self.values = values;
        Ok(())
    }
}

impl Node for InputNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        Ok(vec![self.values.clone()])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    /// Map inputs are bound to predict arguments before emission starts.
    fn compile(&self, _compiler: &mut MapCompiler, _function: &mut FunctionEmitter) -> CompileResult<()> {
        Ok(())
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({ "shape": self.ports.outputs[0].shape() }))
    }
}

impl ArchivableNode for InputNode {
    const KIND: &'static str = "InputNode";

    fn from_archive(port_type: Option<PortType>, properties: &Value, _inputs: &ArchivedInputs) -> ModelResult<Self> {
        let port_type = required_port_type(port_type, Self::KIND)?;
        let shape: TensorShape = required_property(properties, "shape")?;
        Ok(Self::with_shape(port_type, shape))
    }
}

/// Marks the values a map exposes. Passes its input through unchanged.
#[derive(Debug, Clone)]
pub struct OutputNode {
    ports: NodePorts,
}

impl OutputNode {
    pub fn new(input: PortElements) -> Self {
        let shape = TensorShape::vector(input.size());
        Self::with_shape(input, shape)
    }

    /// `shape` must cover exactly the input's elements; otherwise the output
    /// is flat.
    pub fn with_shape(input: PortElements, shape: TensorShape) -> Self {
        let shape = if shape.size() == input.size() {
            shape
        } else {
            TensorShape::vector(input.size())
        };
        let output = OutputPort::new("output", input.port_type(), input.size()).with_shape(shape);
        Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
        }
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }
}

impl Node for OutputNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        Ok(vec![inputs[0].clone()])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        emit_copy(compiler, function, self.input())
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({ "shape": self.ports.outputs[0].shape() }))
    }
}

impl ArchivableNode for OutputNode {
    const KIND: &'static str = "OutputNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        let input = inputs.get("input")?;
        Ok(match property::<TensorShape>(properties, "shape")? {
            Some(shape) => Self::with_shape(input, shape),
            None => Self::new(input),
        })
    }
}
