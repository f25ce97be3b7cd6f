use cranelift::prelude::InstBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::codegen::emit_elementwise;
use crate::compiler::MapCompiler;
use crate::emitters::{Comparison, FunctionEmitter};
use crate::error::{CompileResult, ModelError, ModelResult};
use crate::model::archive::required_property;
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, Element, InputPort, Node, NodePorts, Numeric, OutputPort,
    PortElements, PortType, PortValues,
};
use crate::node_boilerplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
}

impl BinaryOperation {
    fn is_logical(self) -> bool {
        matches!(
            self,
            BinaryOperation::LogicalAnd | BinaryOperation::LogicalOr | BinaryOperation::LogicalXor
        )
    }
}

/// Checks that two operands line up element for element.
fn check_operands(input1: &PortElements, input2: &PortElements) -> ModelResult<()> {
    if input1.port_type() != input2.port_type() {
        return Err(ModelError::InvalidArgument(format!(
            "operand types differ: {} and {}",
            input1.port_type(),
            input2.port_type()
        )));
    }
    if input1.size() != input2.size() {
        return Err(ModelError::InvalidArgument(format!(
            "operand sizes differ: {} and {}",
            input1.size(),
            input2.size()
        )));
    }
    Ok(())
}

/// Combines two equally sized inputs element by element.
#[derive(Debug, Clone)]
pub struct BinaryOperationNode {
    ports: NodePorts,
    operation: BinaryOperation,
}

impl BinaryOperationNode {
    pub fn new(input1: PortElements, input2: PortElements, operation: BinaryOperation) -> ModelResult<Self> {
        check_operands(&input1, &input2)?;
        let port_type = input1.port_type();
        if operation.is_logical() != (port_type == PortType::Boolean) {
            return Err(ModelError::InvalidArgument(format!(
                "{:?} is not defined for {} values",
                operation, port_type
            )));
        }
        let output = OutputPort::new("output", port_type, input1.size());
        Ok(Self {
            ports: NodePorts::new(
                vec![InputPort::new("input1", input1), InputPort::new("input2", input2)],
                vec![output],
            ),
            operation,
        })
    }

    pub fn operation(&self) -> BinaryOperation {
        self.operation
    }

    fn operands(&self) -> (&PortElements, &PortElements) {
        (&self.ports.inputs[0].elements, &self.ports.inputs[1].elements)
    }
}

fn arithmetic<T: Numeric>(operation: BinaryOperation, a: &[T], b: &[T]) -> ModelResult<Vec<T>> {
    let f: fn(T, T) -> T = match operation {
        BinaryOperation::Add => T::plus,
        BinaryOperation::Subtract => T::minus,
        BinaryOperation::Multiply => T::times,
        BinaryOperation::Divide => T::divide,
        other => return Err(ModelError::InvalidArgument(format!("{:?} needs boolean values", other))),
    };
    Ok(a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect())
}

fn logical(operation: BinaryOperation, a: &[bool], b: &[bool]) -> ModelResult<Vec<bool>> {
    let f: fn(bool, bool) -> bool = match operation {
        BinaryOperation::LogicalAnd => |x, y| x && y,
        BinaryOperation::LogicalOr => |x, y| x || y,
        BinaryOperation::LogicalXor => |x, y| x != y,
        other => return Err(ModelError::InvalidArgument(format!("{:?} needs numeric values", other))),
    };
    Ok(a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect())
}

impl Node for BinaryOperationNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.operands().0.port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let operation = self.operation;
        let output = match (&inputs[0], &inputs[1]) {
            (PortValues::Boolean(a), PortValues::Boolean(b)) => logical(operation, a, b)?.into(),
            (PortValues::Integer(a), PortValues::Integer(b)) => arithmetic(operation, a, b)?.into(),
            (PortValues::BigInt(a), PortValues::BigInt(b)) => arithmetic(operation, a, b)?.into(),
            (PortValues::SmallReal(a), PortValues::SmallReal(b)) => arithmetic(operation, a, b)?.into(),
            (PortValues::Real(a), PortValues::Real(b)) => arithmetic(operation, a, b)?.into(),
            (a, b) => {
                return Err(ModelError::TypeMismatch {
                    expected: a.port_type(),
                    found: b.port_type(),
                })
            }
        };
        Ok(vec![output])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let (input1, input2) = self.operands();
        let port_type = input1.port_type();
        let operation = self.operation;
        emit_elementwise(compiler, function, &[input1, input2], port_type, |f, _, v| {
            let (a, b) = (v[0], v[1]);
            Ok(match operation {
                BinaryOperation::Add => f.add(port_type, a, b),
                BinaryOperation::Subtract => f.sub(port_type, a, b),
                BinaryOperation::Multiply => f.mul(port_type, a, b),
                BinaryOperation::Divide => f.div(port_type, a, b),
                BinaryOperation::LogicalAnd => f.ins().band(a, b),
                BinaryOperation::LogicalOr => f.ins().bor(a, b),
                BinaryOperation::LogicalXor => f.ins().bxor(a, b),
            })
        })
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({ "operation": self.operation }))
    }
}

impl ArchivableNode for BinaryOperationNode {
    const KIND: &'static str = "BinaryOperationNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        Self::new(
            inputs.get("input1")?,
            inputs.get("input2")?,
            required_property(properties, "operation")?,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryPredicate {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl BinaryPredicate {
    fn comparison(self) -> Comparison {
        match self {
            BinaryPredicate::Equal => Comparison::Equal,
            BinaryPredicate::NotEqual => Comparison::NotEqual,
            BinaryPredicate::Less => Comparison::Less,
            BinaryPredicate::LessOrEqual => Comparison::LessOrEqual,
            BinaryPredicate::Greater => Comparison::Greater,
            BinaryPredicate::GreaterOrEqual => Comparison::GreaterOrEqual,
        }
    }

    fn test<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            BinaryPredicate::Equal => a == b,
            BinaryPredicate::NotEqual => a != b,
            BinaryPredicate::Less => a < b,
            BinaryPredicate::LessOrEqual => a <= b,
            BinaryPredicate::Greater => a > b,
            BinaryPredicate::GreaterOrEqual => a >= b,
        }
    }
}

/// Compares two equally sized inputs element by element; the output is boolean.
#[derive(Debug, Clone)]
pub struct BinaryPredicateNode {
    ports: NodePorts,
    predicate: BinaryPredicate,
}

impl BinaryPredicateNode {
    pub fn new(input1: PortElements, input2: PortElements, predicate: BinaryPredicate) -> ModelResult<Self> {
        check_operands(&input1, &input2)?;
        let output = OutputPort::new("output", PortType::Boolean, input1.size());
        Ok(Self {
            ports: NodePorts::new(
                vec![InputPort::new("input1", input1), InputPort::new("input2", input2)],
                vec![output],
            ),
            predicate,
        })
    }

    pub fn predicate(&self) -> BinaryPredicate {
        self.predicate
    }

    fn operands(&self) -> (&PortElements, &PortElements) {
        (&self.ports.inputs[0].elements, &self.ports.inputs[1].elements)
    }
}

fn compare<T: Element + PartialOrd>(predicate: BinaryPredicate, a: &[T], b: &[T]) -> Vec<bool> {
    a.iter().zip(b).map(|(&x, &y)| predicate.test(x, y)).collect()
}

impl Node for BinaryPredicateNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.operands().0.port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let p = self.predicate;
        let output = match (&inputs[0], &inputs[1]) {
            (PortValues::Boolean(a), PortValues::Boolean(b)) => compare(p, a, b),
            (PortValues::Integer(a), PortValues::Integer(b)) => compare(p, a, b),
            (PortValues::BigInt(a), PortValues::BigInt(b)) => compare(p, a, b),
            (PortValues::SmallReal(a), PortValues::SmallReal(b)) => compare(p, a, b),
            (PortValues::Real(a), PortValues::Real(b)) => compare(p, a, b),
            (a, b) => {
                return Err(ModelError::TypeMismatch {
                    expected: a.port_type(),
                    found: b.port_type(),
                })
            }
        };
        Ok(vec![PortValues::Boolean(output)])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let (input1, input2) = self.operands();
        let operand_type = input1.port_type();
        let comparison = self.predicate.comparison();
        emit_elementwise(compiler, function, &[input1, input2], PortType::Boolean, |f, _, v| {
            Ok(f.compare(comparison, operand_type, v[0], v[1]))
        })
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({ "predicate": self.predicate }))
    }
}

impl ArchivableNode for BinaryPredicateNode {
    const KIND: &'static str = "BinaryPredicateNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        Self::new(
            inputs.get("input1")?,
            inputs.get("input2")?,
            required_property(properties, "predicate")?,
        )
    }
}
