use cranelift::prelude::InstBuilder;
use serde_json::{json, Value};

use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};
use crate::model::archive::required_property;
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, OutputPort, PortElements, PortType,
    PortValues,
};
use crate::node_boilerplate;

/// Sliding window over the most recent `window_size` input elements.
///
/// Each evaluation shifts the window left by the input size and appends the
/// new input at the end, so the newest values are last.
#[derive(Debug, Clone)]
pub struct BufferNode {
    ports: NodePorts,
    window: PortValues,
}

impl BufferNode {
    pub fn new(input: PortElements, window_size: usize) -> ModelResult<Self> {
        if window_size < input.size() {
            return Err(ModelError::InvalidArgument(format!(
                "window of {} cannot hold an input of {}",
                window_size,
                input.size()
            )));
        }
        let port_type = input.port_type();
        let output = OutputPort::new("output", port_type, window_size);
        Ok(Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            window: PortValues::zeros(port_type, window_size),
        })
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    pub fn window_size(&self) -> usize {
        self.window.len()
    }
}

impl Node for BufferNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.input().port_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let input = &inputs[0];
        let window = self.window_size();
        let mut next = self.window.slice(input.len(), window - input.len());
        if !next.extend_from(input) {
            return Err(ModelError::TypeMismatch {
                expected: self.window.port_type(),
                found: input.port_type(),
            });
        }
        self.window = next;
        Ok(vec![self.window.clone()])
    }

    fn reset(&mut self) {
        self.window = PortValues::zeros(self.window.port_type(), self.window.len());
    }

    fn has_state(&self) -> bool {
        true
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let port_type = self.input().port_type();
        let size = self.input().size();
        let window = self.window_size();
        let initial = PortValues::zeros(port_type, window);
        let state_handle = compiler.state_global("window", &initial)?;
        let state = function.data_address(state_handle);

        function.for_range(window - size, |f, i| {
            let from = f.ins().iadd_imm(i, size as i64);
            let value = f.load_element(port_type, state, from);
            f.store_element(port_type, value, state, i);
            Ok::<(), CompileError>(())
        })?;

        let input = compiler.input_address(function, self.input())?;
        let tail = function
            .ins()
            .iadd_imm(state, ((window - size) * port_type.byte_size()) as i64);
        function.copy_elements(port_type, tail, input, size)?;

        let output = compiler.output_address(function, 0)?;
        function.copy_elements(port_type, output, state, window)?;
        Ok(())
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({ "windowSize": self.window_size() }))
    }
}

impl ArchivableNode for BufferNode {
    const KIND: &'static str = "BufferNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        Self::new(inputs.get("input")?, required_property(properties, "windowSize")?)
    }
}
