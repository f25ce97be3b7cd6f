//! Neural network layers. They are not emitted directly: refinement rewrites
//! them into matrix products and affine transforms.

use serde_json::{json, Value};

use super::affine::AffineTransformNode;
use super::matrix::MatrixVectorProductNode;
use crate::error::{ModelError, ModelResult};
use crate::model::archive::required_property;
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, ModelTransformer, Node, NodePorts, Numeric, OutputPort,
    PortElements, PortType, PortValues,
};
use crate::node_boilerplate;

fn require_real(input: &PortElements, kind: &str) -> ModelResult<()> {
    if input.port_type().is_real() {
        Ok(())
    } else {
        Err(ModelError::InvalidArgument(format!(
            "{} needs real values, got {}",
            kind,
            input.port_type()
        )))
    }
}

fn add_bias<T: Numeric>(mut y: Vec<T>, bias: &[T]) -> Vec<T> {
    for (v, &b) in y.iter_mut().zip(bias) {
        *v = v.plus(b);
    }
    y
}

/// `y = W x + b`.
#[derive(Debug, Clone)]
pub struct FullyConnectedLayerNode {
    ports: NodePorts,
    weights: PortValues,
    bias: PortValues,
}

impl FullyConnectedLayerNode {
    /// `weights` is row-major with one row per entry of `bias`.
    pub fn new(input: PortElements, weights: impl Into<PortValues>, bias: impl Into<PortValues>) -> ModelResult<Self> {
        require_real(&input, Self::KIND)?;
        let (weights, bias) = (weights.into(), bias.into());
        // Validates shapes and types the same way the refined nodes will.
        MatrixVectorProductNode::new(input.clone(), weights.clone(), bias.len())?;
        if bias.port_type() != input.port_type() {
            return Err(ModelError::TypeMismatch {
                expected: input.port_type(),
                found: bias.port_type(),
            });
        }
        let output = OutputPort::new("output", input.port_type(), bias.len());
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            weights,
            bias,
        })
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    fn parts(&self, input: PortElements) -> ModelResult<MatrixVectorProductNode> {
        MatrixVectorProductNode::new(input, self.weights.clone(), self.bias.len())
    }
}

impl Node for FullyConnectedLayerNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let projected = self
            .parts(self.input().clone())?
            .compute(inputs)?
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidArgument("matrix product produced no output".into()))?;
        let output = match (projected, &self.bias) {
            (PortValues::SmallReal(y), PortValues::SmallReal(b)) => add_bias(y, b).into(),
            (PortValues::Real(y), PortValues::Real(b)) => add_bias(y, b).into(),
            (y, b) => {
                return Err(ModelError::TypeMismatch {
                    expected: b.port_type(),
                    found: y.port_type(),
                })
            }
        };
        Ok(vec![output])
    }

    fn refine(&self, transformer: &mut ModelTransformer) -> ModelResult<bool> {
        let input = transformer.transform_elements(self.input())?;
        let product = transformer.add_node(self.parts(input)?)?;
        let projected = transformer.model().output(product)?;
        let affine = transformer.add_node(AffineTransformNode::with_bias(projected, self.bias.clone())?)?;
        let output = transformer.model().output(affine)?;
        transformer.map_output(0, output)?;
        Ok(true)
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({
            "weights": self.weights,
            "bias": self.bias,
        }))
    }
}

impl ArchivableNode for FullyConnectedLayerNode {
    const KIND: &'static str = "FullyConnectedLayerNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        let weights: PortValues = required_property(properties, "weights")?;
        let bias: PortValues = required_property(properties, "bias")?;
        Self::new(inputs.get("input")?, weights, bias)
    }
}

/// `y = (x - mean) / sqrt(variance + epsilon)`, per element.
#[derive(Debug, Clone)]
pub struct BatchNormalizationLayerNode {
    ports: NodePorts,
    mean: Vec<f64>,
    variance: Vec<f64>,
    epsilon: f64,
}

impl BatchNormalizationLayerNode {
    pub fn new(input: PortElements, mean: Vec<f64>, variance: Vec<f64>, epsilon: f64) -> ModelResult<Self> {
        require_real(&input, Self::KIND)?;
        if mean.len() != input.size() || variance.len() != input.size() {
            return Err(ModelError::InvalidArgument(format!(
                "statistics of length {} and {} for {} inputs",
                mean.len(),
                variance.len(),
                input.size()
            )));
        }
        if variance.iter().any(|&v| v + epsilon <= 0.0) {
            return Err(ModelError::InvalidArgument("variance plus epsilon must be positive".into()));
        }
        let output = OutputPort::new("output", input.port_type(), input.size());
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            mean,
            variance,
            epsilon,
        })
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    /// The equivalent affine transform reading `input`.
    fn as_affine(&self, input: PortElements) -> ModelResult<AffineTransformNode> {
        let port_type = input.port_type();
        let scale: Vec<f64> = self.variance.iter().map(|&v| 1.0 / (v + self.epsilon).sqrt()).collect();
        let bias: Vec<f64> = self.mean.iter().zip(&scale).map(|(&m, &s)| -m * s).collect();
        AffineTransformNode::new(
            input,
            PortValues::from_f64(port_type, &scale),
            PortValues::from_f64(port_type, &bias),
        )
    }
}

impl Node for BatchNormalizationLayerNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        self.as_affine(self.input().clone())?.compute(inputs)
    }

    fn refine(&self, transformer: &mut ModelTransformer) -> ModelResult<bool> {
        let input = transformer.transform_elements(self.input())?;
        let affine = transformer.add_node(self.as_affine(input)?)?;
        let output = transformer.model().output(affine)?;
        transformer.map_output(0, output)?;
        Ok(true)
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({
            "mean": self.mean,
            "variance": self.variance,
            "epsilon": self.epsilon,
        }))
    }
}

impl ArchivableNode for BatchNormalizationLayerNode {
    const KIND: &'static str = "BatchNormalizationLayerNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        Self::new(
            inputs.get("input")?,
            required_property(properties, "mean")?,
            required_property(properties, "variance")?,
            required_property(properties, "epsilon")?,
        )
    }
}
