use cranelift::prelude::InstBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::codegen::emit_elementwise;
use crate::compiler::MapCompiler;
use crate::emitters::{FunctionEmitter, MathFunction};
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};
use crate::model::archive::required_property;
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, Numeric, OutputPort, PortElements,
    PortType, PortValues, Real,
};
use crate::node_boilerplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnaryOperation {
    Negate,
    Abs,
    Square,
    Sqrt,
    Exp,
    Log,
    Tanh,
    Sin,
    Cos,
    LogicalNot,
}

impl UnaryOperation {
    fn math_function(self) -> Option<MathFunction> {
        match self {
            UnaryOperation::Exp => Some(MathFunction::Exp),
            UnaryOperation::Log => Some(MathFunction::Log),
            UnaryOperation::Tanh => Some(MathFunction::Tanh),
            UnaryOperation::Sin => Some(MathFunction::Sin),
            UnaryOperation::Cos => Some(MathFunction::Cos),
            _ => None,
        }
    }

    fn accepts(self, port_type: PortType) -> bool {
        match self {
            UnaryOperation::LogicalNot => port_type == PortType::Boolean,
            UnaryOperation::Negate | UnaryOperation::Abs | UnaryOperation::Square => port_type != PortType::Boolean,
            _ => port_type.is_real(),
        }
    }
}

/// Applies one operation to every element.
#[derive(Debug, Clone)]
pub struct UnaryOperationNode {
    ports: NodePorts,
    operation: UnaryOperation,
}

impl UnaryOperationNode {
    pub fn new(input: PortElements, operation: UnaryOperation) -> ModelResult<Self> {
        let port_type = input.port_type();
        if !operation.accepts(port_type) {
            return Err(ModelError::InvalidArgument(format!(
                "{:?} is not defined for {} values",
                operation, port_type
            )));
        }
        let output = OutputPort::new("output", port_type, input.size());
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            operation,
        })
    }

    pub fn operation(&self) -> UnaryOperation {
        self.operation
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }
}

fn numeric_kernel<T: Numeric>(operation: UnaryOperation, x: &[T]) -> ModelResult<Vec<T>> {
    let f: fn(T) -> T = match operation {
        UnaryOperation::Negate => T::negate,
        UnaryOperation::Abs => T::abs_value,
        UnaryOperation::Square => |v| v.times(v),
        other => {
            return Err(ModelError::InvalidArgument(format!("{:?} needs real values", other)));
        }
    };
    Ok(x.iter().map(|&v| f(v)).collect())
}

fn real_kernel<T: Real>(operation: UnaryOperation, x: &[T]) -> ModelResult<Vec<T>> {
    let f: fn(T) -> T = match operation {
        UnaryOperation::Sqrt => T::sqrt,
        UnaryOperation::Exp => T::exp,
        UnaryOperation::Log => T::ln,
        UnaryOperation::Tanh => T::tanh,
        UnaryOperation::Sin => T::sin,
        UnaryOperation::Cos => T::cos,
        _ => return numeric_kernel(operation, x),
    };
    Ok(x.iter().map(|&v| f(v)).collect())
}

impl Node for UnaryOperationNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let operation = self.operation;
        let output = match &inputs[0] {
            PortValues::Boolean(v) => PortValues::Boolean(v.iter().map(|x| !x).collect()),
            PortValues::Integer(v) => numeric_kernel(operation, v)?.into(),
            PortValues::BigInt(v) => numeric_kernel(operation, v)?.into(),
            PortValues::SmallReal(v) => real_kernel(operation, v)?.into(),
            PortValues::Real(v) => real_kernel(operation, v)?.into(),
        };
        Ok(vec![output])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let port_type = self.input().port_type();
        let operation = self.operation;
        emit_elementwise(compiler, function, &[self.input()], port_type, |f, module, x| {
            let x = x[0];
            Ok(match operation {
                UnaryOperation::Negate => f.neg(port_type, x),
                UnaryOperation::Abs => f.abs(port_type, x),
                UnaryOperation::Square => f.mul(port_type, x, x),
                UnaryOperation::Sqrt => f.sqrt(x),
                UnaryOperation::LogicalNot => f.ins().bxor_imm(x, 1),
                UnaryOperation::Exp
                | UnaryOperation::Log
                | UnaryOperation::Tanh
                | UnaryOperation::Sin
                | UnaryOperation::Cos => {
                    let math = operation
                        .math_function()
                        .ok_or_else(|| CompileError::Unsupported(format!("{:?}", operation)))?;
                    f.call_math(module, math, port_type, x)?
                }
            })
        })
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({ "operation": self.operation }))
    }
}

impl ArchivableNode for UnaryOperationNode {
    const KIND: &'static str = "UnaryOperationNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        Self::new(inputs.get("input")?, required_property(properties, "operation")?)
    }
}
