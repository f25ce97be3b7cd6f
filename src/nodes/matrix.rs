use cranelift::prelude::InstBuilder;
use serde_json::{json, Value};

use super::codegen::{accumulate, constant_table};
use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};
use crate::model::archive::required_property;
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, Numeric, OutputPort, PortElements,
    PortType, PortValues,
};
use crate::node_boilerplate;

/// `y = W x` for a constant row-major `rows × columns` matrix `W`.
#[derive(Debug, Clone)]
pub struct MatrixVectorProductNode {
    ports: NodePorts,
    weights: PortValues,
    rows: usize,
}

impl MatrixVectorProductNode {
    pub fn new(input: PortElements, weights: impl Into<PortValues>, rows: usize) -> ModelResult<Self> {
        let weights = weights.into();
        let port_type = input.port_type();
        if port_type == PortType::Boolean {
            return Err(ModelError::InvalidArgument("matrix products need numeric values".into()));
        }
        if weights.port_type() != port_type {
            return Err(ModelError::TypeMismatch {
                expected: port_type,
                found: weights.port_type(),
            });
        }
        if weights.len() != rows * input.size() {
            return Err(ModelError::InvalidArgument(format!(
                "{} weights do not form a {}x{} matrix",
                weights.len(),
                rows,
                input.size()
            )));
        }
        let output = OutputPort::new("output", port_type, rows);
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            weights,
            rows,
        })
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.input().size()
    }

    pub fn weights(&self) -> &PortValues {
        &self.weights
    }
}

fn product<T: Numeric>(weights: &[T], x: &[T]) -> Vec<T> {
    if x.is_empty() {
        return Vec::new();
    }
    weights
        .chunks(x.len())
        .map(|row| row.iter().zip(x).fold(T::zero(), |acc, (&w, &v)| acc.plus(w.times(v))))
        .collect()
}

impl Node for MatrixVectorProductNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let output = match (&self.weights, &inputs[0]) {
            (PortValues::Integer(w), PortValues::Integer(x)) => product(w, x).into(),
            (PortValues::BigInt(w), PortValues::BigInt(x)) => product(w, x).into(),
            (PortValues::SmallReal(w), PortValues::SmallReal(x)) => product(w, x).into(),
            (PortValues::Real(w), PortValues::Real(x)) => product(w, x).into(),
            (w, x) => {
                return Err(ModelError::TypeMismatch {
                    expected: w.port_type(),
                    found: x.port_type(),
                })
            }
        };
        Ok(vec![output])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let port_type = self.input().port_type();
        let columns = self.columns();
        let input = compiler.input_address(function, self.input())?;
        let weights = constant_table(compiler, function, "weights", &self.weights)?;
        let output = compiler.output_address(function, 0)?;
        let slot = function.stack_buffer(port_type.byte_size())?;
        let sum = function.stack_address(slot, 0);

        function.for_range(self.rows, |f, r| {
            let zero = f.zero(port_type);
            f.store(zero, sum, 0);
            let row_start = f.ins().imul_imm(r, columns as i64);
            f.for_range(columns, |f, c| {
                let index = f.ins().iadd(row_start, c);
                let w = f.load_element(port_type, weights, index);
                let x = f.load_element(port_type, input, c);
                let term = f.mul(port_type, w, x);
                accumulate(f, port_type, sum, term);
                Ok::<(), CompileError>(())
            })?;
            let y = f.load(port_type, sum, 0);
            f.store_element(port_type, y, output, r);
            Ok::<(), CompileError>(())
        })
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({
            "rows": self.rows,
            "weights": self.weights,
        }))
    }
}

impl ArchivableNode for MatrixVectorProductNode {
    const KIND: &'static str = "MatrixVectorProductNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        let weights: PortValues = required_property(properties, "weights")?;
        Self::new(inputs.get("input")?, weights, required_property(properties, "rows")?)
    }
}
