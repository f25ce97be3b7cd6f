use serde_json::{json, Value};

use super::codegen::constant_table;
use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};
use crate::model::archive::required_property;
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, Numeric, OutputPort, PortElements,
    PortType, PortValues,
};
use crate::node_boilerplate;

/// Element-wise `y = scale * x + bias`.
#[derive(Debug, Clone)]
pub struct AffineTransformNode {
    ports: NodePorts,
    scale: PortValues,
    bias: PortValues,
}

impl AffineTransformNode {
    pub fn new(input: PortElements, scale: impl Into<PortValues>, bias: impl Into<PortValues>) -> ModelResult<Self> {
        let (scale, bias) = (scale.into(), bias.into());
        let port_type = input.port_type();
        if port_type == PortType::Boolean {
            return Err(ModelError::InvalidArgument("affine transforms need numeric values".into()));
        }
        for coefficients in [&scale, &bias] {
            if coefficients.port_type() != port_type {
                return Err(ModelError::TypeMismatch {
                    expected: port_type,
                    found: coefficients.port_type(),
                });
            }
            if coefficients.len() != input.size() {
                return Err(ModelError::InvalidArgument(format!(
                    "{} coefficients for {} inputs",
                    coefficients.len(),
                    input.size()
                )));
            }
        }
        let output = OutputPort::new("output", port_type, input.size());
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            scale,
            bias,
        })
    }

    /// Identity scale with the given bias.
    pub fn with_bias(input: PortElements, bias: PortValues) -> ModelResult<Self> {
        let ones = PortValues::from_f64(bias.port_type(), &vec![1.0; bias.len()]);
        Self::new(input, ones, bias)
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    pub fn scale(&self) -> &PortValues {
        &self.scale
    }

    pub fn bias(&self) -> &PortValues {
        &self.bias
    }

    /// The transform equal to applying `first` and then `second`, reading `input`.
    pub fn fuse(first: &Self, second: &Self, input: PortElements) -> ModelResult<Self> {
        let (scale, bias): (PortValues, PortValues) = match (&first.scale, &first.bias, &second.scale, &second.bias) {
            (PortValues::Integer(s1), PortValues::Integer(b1), PortValues::Integer(s2), PortValues::Integer(b2)) => {
                let (s, b) = fuse_coefficients(s1, b1, s2, b2);
                (s.into(), b.into())
            }
            (PortValues::BigInt(s1), PortValues::BigInt(b1), PortValues::BigInt(s2), PortValues::BigInt(b2)) => {
                let (s, b) = fuse_coefficients(s1, b1, s2, b2);
                (s.into(), b.into())
            }
            (
                PortValues::SmallReal(s1),
                PortValues::SmallReal(b1),
                PortValues::SmallReal(s2),
                PortValues::SmallReal(b2),
            ) => {
                let (s, b) = fuse_coefficients(s1, b1, s2, b2);
                (s.into(), b.into())
            }
            (PortValues::Real(s1), PortValues::Real(b1), PortValues::Real(s2), PortValues::Real(b2)) => {
                let (s, b) = fuse_coefficients(s1, b1, s2, b2);
                (s.into(), b.into())
            }
            _ => {
                return Err(ModelError::TypeMismatch {
                    expected: first.scale.port_type(),
                    found: second.scale.port_type(),
                })
            }
        };
        Self::new(input, scale, bias)
    }
}

fn fuse_coefficients<T: Numeric>(s1: &[T], b1: &[T], s2: &[T], b2: &[T]) -> (Vec<T>, Vec<T>) {
    let scale = s2.iter().zip(s1).map(|(&a, &b)| a.times(b)).collect();
    let bias = s2
        .iter()
        .zip(b1)
        .zip(b2)
        .map(|((&s, &b), &c)| s.times(b).plus(c))
        .collect();
    (scale, bias)
}

fn transform<T: Numeric>(x: &[T], scale: &[T], bias: &[T]) -> Vec<T> {
    x.iter()
        .zip(scale)
        .zip(bias)
        .map(|((&x, &s), &b)| s.times(x).plus(b))
        .collect()
}

impl Node for AffineTransformNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let output = match (&inputs[0], &self.scale, &self.bias) {
            (PortValues::Integer(x), PortValues::Integer(s), PortValues::Integer(b)) => transform(x, s, b).into(),
            (PortValues::BigInt(x), PortValues::BigInt(s), PortValues::BigInt(b)) => transform(x, s, b).into(),
            (PortValues::SmallReal(x), PortValues::SmallReal(s), PortValues::SmallReal(b)) => {
                transform(x, s, b).into()
            }
            (PortValues::Real(x), PortValues::Real(s), PortValues::Real(b)) => transform(x, s, b).into(),
            (x, s, _) => {
                return Err(ModelError::TypeMismatch {
                    expected: s.port_type(),
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
        let input = compiler.input_address(function, self.input())?;
        let scale = constant_table(compiler, function, "scale", &self.scale)?;
        let bias = constant_table(compiler, function, "bias", &self.bias)?;
        let output = compiler.output_address(function, 0)?;
        function.for_range(self.input().size(), |f, i| {
            let x = f.load_element(port_type, input, i);
            let s = f.load_element(port_type, scale, i);
            let b = f.load_element(port_type, bias, i);
            let scaled = f.mul(port_type, s, x);
            let y = f.add(port_type, scaled, b);
            f.store_element(port_type, y, output, i);
            Ok::<(), CompileError>(())
        })
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({
            "scale": self.scale,
            "bias": self.bias,
        }))
    }
}

impl ArchivableNode for AffineTransformNode {
    const KIND: &'static str = "AffineTransformNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        let scale: PortValues = required_property(properties, "scale")?;
        let bias: PortValues = required_property(properties, "bias")?;
        Self::new(inputs.get("input")?, scale, bias)
    }
}
