use serde_json::{json, Value};

use super::codegen::constant_table;
use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileResult, ModelError, ModelResult};
use crate::model::archive::{property, required_property};
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, Node, NodePorts, OutputPort, PortType, PortValues, TensorShape,
};
use crate::node_boilerplate;

/// Emits a fixed vector of values.
#[derive(Debug, Clone)]
pub struct ConstantNode {
    ports: NodePorts,
    values: PortValues,
}

impl ConstantNode {
    pub fn new(values: impl Into<PortValues>) -> Self {
        let values = values.into();
        let shape = TensorShape::vector(values.len());
        Self::from_parts(values, shape)
    }

    pub fn with_shape(values: impl Into<PortValues>, shape: TensorShape) -> ModelResult<Self> {
        let values = values.into();
        if shape.size() != values.len() {
            return Err(ModelError::InvalidArgument(format!(
                "shape {:?} does not hold {} values",
                shape,
                values.len()
            )));
        }
        Ok(Self::from_parts(values, shape))
    }

    fn from_parts(values: PortValues, shape: TensorShape) -> Self {
        let output = OutputPort::new("output", values.port_type(), values.len()).with_shape(shape);
        Self {
            ports: NodePorts::new(Vec::new(), vec![output]),
            values,
        }
    }

    pub fn values(&self) -> &PortValues {
        &self.values
    }
}

impl Node for ConstantNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.values.port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        Ok(vec![self.values.clone()])
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let port_type = self.values.port_type();
        if self.values.len() == 1 && port_type != PortType::BigInt {
            let value = function.constant(port_type, self.values.to_f64_vec()[0]);
            return compiler.store_output(function, 0, 0, value);
        }
        let table = constant_table(compiler, function, "values", &self.values)?;
        let output = compiler.output_address(function, 0)?;
        function.copy_elements(port_type, output, table, self.values.len())?;
        Ok(())
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({
            "values": self.values,
            "shape": self.ports.outputs[0].shape(),
        }))
    }
}

impl ArchivableNode for ConstantNode {
    const KIND: &'static str = "ConstantNode";

    fn from_archive(port_type: Option<PortType>, properties: &Value, _inputs: &ArchivedInputs) -> ModelResult<Self> {
        let values: PortValues = required_property(properties, "values")?;
        if let Some(expected) = port_type {
            if expected != values.port_type() {
                return Err(ModelError::TypeMismatch {
                    expected,
                    found: values.port_type(),
                });
            }
        }
        match property::<TensorShape>(properties, "shape")? {
            Some(shape) => Self::with_shape(values, shape),
            None => Ok(Self::new(values)),
        }
    }
}
