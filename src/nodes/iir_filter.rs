use cranelift::prelude::Value as IrValue;
use serde_json::{json, Value};

use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};
use crate::model::archive::required_property;
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, OutputPort, PortElements, PortType,
    PortValues, Real,
};
use crate::node_boilerplate;

/// Direct-form I infinite impulse response filter.
///
/// Input elements are consecutive samples. For each sample
/// `y[t] = sum(b[k] * x[t - k]) - sum(a[k] * y[t - 1 - k])`.
#[derive(Debug, Clone)]
pub struct IIRFilterNode {
    ports: NodePorts,
    feed_forward: Vec<f64>,
    feedback: Vec<f64>,
    inputs_history: Vec<f64>,
    outputs_history: Vec<f64>,
}

impl IIRFilterNode {
    pub fn new(input: PortElements, feed_forward: Vec<f64>, feedback: Vec<f64>) -> ModelResult<Self> {
        if !input.port_type().is_real() {
            return Err(ModelError::InvalidArgument(format!(
                "filters need real values, got {}",
                input.port_type()
            )));
        }
        if feed_forward.is_empty() {
            return Err(ModelError::InvalidArgument("filter needs feed-forward coefficients".into()));
        }
        let output = OutputPort::new("output", input.port_type(), input.size());
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            inputs_history: vec![0.0; feed_forward.len()],
            outputs_history: vec![0.0; feedback.len()],
            feed_forward,
            feedback,
        })
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    pub fn feed_forward(&self) -> &[f64] {
        &self.feed_forward
    }

    pub fn feedback(&self) -> &[f64] {
        &self.feedback
    }

    fn filter<T: Real>(&mut self, samples: &[T]) -> Vec<T> {
        let mut xs: Vec<T> = self.inputs_history.iter().map(|&v| T::from_f64(v)).collect();
        let mut ys: Vec<T> = self.outputs_history.iter().map(|&v| T::from_f64(v)).collect();
        let mut out = Vec::with_capacity(samples.len());
        for &x in samples {
            xs.rotate_right(1);
            xs[0] = x;
            let mut y = T::zero();
            for (&b, &xk) in self.feed_forward.iter().zip(&xs) {
                y = y.plus(T::from_f64(b).times(xk));
            }
            for (&a, &yk) in self.feedback.iter().zip(&ys) {
                y = y.minus(T::from_f64(a).times(yk));
            }
            if !ys.is_empty() {
                ys.rotate_right(1);
                ys[0] = y;
            }
            out.push(y);
        }
        self.inputs_history = xs.iter().map(|v| v.to_f64()).collect();
        self.outputs_history = ys.iter().map(|v| v.to_f64()).collect();
        out
    }
}

/// Shifts `history` one element towards the end and stores `newest` first.
fn push_history(
    function: &mut FunctionEmitter,
    port_type: PortType,
    history: IrValue,
    len: usize,
    newest: IrValue,
) -> CompileResult<()> {
    for k in (1..len).rev() {
        let from = FunctionEmitter::element_offset(port_type, k - 1)?;
        let to = FunctionEmitter::element_offset(port_type, k)?;
        let value = function.load(port_type, history, from);
        function.store(value, history, to);
    }
    if len > 0 {
        function.store(newest, history, 0);
    }
    Ok(())
}

impl Node for IIRFilterNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let output = match &inputs[0] {
            PortValues::SmallReal(v) => self.filter(v).into(),
            PortValues::Real(v) => self.filter(v).into(),
            other => {
                return Err(ModelError::TypeMismatch {
                    expected: self.input().port_type(),
                    found: other.port_type(),
                })
            }
        };
        Ok(vec![output])
    }

    fn reset(&mut self) {
        self.inputs_history.iter_mut().for_each(|v| *v = 0.0);
        self.outputs_history.iter_mut().for_each(|v| *v = 0.0);
    }

    fn has_state(&self) -> bool {
        true
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let port_type = self.input().port_type();
        let x_handle = compiler.state_global("x", &PortValues::zeros(port_type, self.feed_forward.len()))?;
        let y_handle = if self.feedback.is_empty() {
            None
        } else {
            Some(compiler.state_global("y", &PortValues::zeros(port_type, self.feedback.len()))?)
        };
        let input = compiler.input_address(function, self.input())?;
        let output = compiler.output_address(function, 0)?;
        let xs = function.data_address(x_handle);
        let ys = y_handle.map(|h| function.data_address(h));

        function.for_range(self.input().size(), |f, i| {
            let x = f.load_element(port_type, input, i);
            push_history(f, port_type, xs, self.feed_forward.len(), x)?;

            let mut y = f.zero(port_type);
            for (k, &b) in self.feed_forward.iter().enumerate() {
                let coefficient = f.constant(port_type, b);
                let xk = f.load(port_type, xs, FunctionEmitter::element_offset(port_type, k)?);
                let term = f.mul(port_type, coefficient, xk);
                y = f.add(port_type, y, term);
            }
            if let Some(ys) = ys {
                for (k, &a) in self.feedback.iter().enumerate() {
                    let coefficient = f.constant(port_type, a);
                    let yk = f.load(port_type, ys, FunctionEmitter::element_offset(port_type, k)?);
                    let term = f.mul(port_type, coefficient, yk);
                    y = f.sub(port_type, y, term);
                }
                push_history(f, port_type, ys, self.feedback.len(), y)?;
            }
            f.store_element(port_type, y, output, i);
            Ok::<(), CompileError>(())
        })
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({
            "b": self.feed_forward,
            "a": self.feedback,
        }))
    }
}

impl ArchivableNode for IIRFilterNode {
    const KIND: &'static str = "IIRFilterNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        Self::new(
            inputs.get("input")?,
            required_property(properties, "b")?,
            required_property(properties, "a")?,
        )
    }
}
