use serde_json::Value;

use super::codegen::{accumulate, accumulator};
use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, Numeric, OutputPort, PortElements,
    PortType, PortValues,
};
use crate::node_boilerplate;

/// Adds up every element of its input into a single value.
#[derive(Debug, Clone)]
pub struct SumNode {
    ports: NodePorts,
}

impl SumNode {
    pub fn new(input: PortElements) -> ModelResult<Self> {
        if input.port_type() == PortType::Boolean {
            return Err(ModelError::InvalidArgument("cannot sum boolean values".into()));
        }
        let output = OutputPort::new("output", input.port_type(), 1);
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
        })
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }
}

fn total<T: Numeric>(values: &[T]) -> Vec<T> {
    vec![values.iter().fold(T::zero(), |acc, &v| acc.plus(v))]
}

impl Node for SumNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let output = match &inputs[0] {
            PortValues::Integer(v) => total(v).into(),
            PortValues::BigInt(v) => total(v).into(),
            PortValues::SmallReal(v) => total(v).into(),
            PortValues::Real(v) => total(v).into(),
            PortValues::Boolean(_) => {
                return Err(ModelError::InvalidArgument("cannot sum boolean values".into()));
            }
        };
        Ok(vec![output])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let port_type = self.input().port_type();
        let input = compiler.input_address(function, self.input())?;
        let sum = accumulator(function, port_type)?;
        function.for_range(self.input().size(), |f, i| {
            let value = f.load_element(port_type, input, i);
            accumulate(f, port_type, sum, value);
            Ok::<(), CompileError>(())
        })?;
        let result = function.load(port_type, sum, 0);
        compiler.store_output(function, 0, 0, result)
    }
}

impl ArchivableNode for SumNode {
    const KIND: &'static str = "SumNode";

    fn from_archive(_port_type: Option<PortType>, _properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        Self::new(inputs.get("input")?)
    }
}
