use serde_json::Value;

use super::codegen::emit_copy;
use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileResult, ModelError, ModelResult};
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, OutputPort, PortElements, PortType,
    PortValues,
};
use crate::node_boilerplate;

/// Joins several element selections into one output, in order.
#[derive(Debug, Clone)]
pub struct ConcatenationNode {
    ports: NodePorts,
}

impl ConcatenationNode {
    /// All parts must share an element type; an empty list is rejected.
    pub fn new(parts: &[PortElements]) -> ModelResult<Self> {
        if parts.is_empty() {
            return Err(ModelError::InvalidArgument("nothing to concatenate".into()));
        }
        Self::from_elements(PortElements::concat(parts)?)
    }

    fn from_elements(input: PortElements) -> ModelResult<Self> {
        if input.is_empty() {
            return Err(ModelError::InvalidArgument("nothing to concatenate".into()));
        }
        let output = OutputPort::new("output", input.port_type(), input.size());
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
        })
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }
}

impl Node for ConcatenationNode {
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
}

impl ArchivableNode for ConcatenationNode {
    const KIND: &'static str = "ConcatenationNode";

    fn from_archive(_port_type: Option<PortType>, _properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        Self::from_elements(inputs.get("input")?)
    }
}
