use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::compiler::MapCompiler;
use crate::emitters::{CType, FunctionEmitter};
use crate::error::{CompileError, CompileResult, EmitterError, ModelError, ModelResult};
use crate::model::archive::{property, required_port_type, required_property};
use crate::model::{
    expect_inputs, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, OutputPort, PortElements, PortType,
    PortValues, TensorShape,
};
use crate::node_boilerplate;

/// Interpreter-side source callback. Fills the buffer and returns `true` when
/// it produced new data.
pub type SourceHandler = Arc<Mutex<dyn FnMut(&mut PortValues) -> bool + Send>>;

pub const DEFAULT_SOURCE_CALLBACK: &str = "SourceCallback";

/// Pulls a buffer of values from the host on every evaluation.
///
/// The input is a time signal that orders the source after its producers.
/// When the callback reports no new data the previous buffer is emitted
/// again.
#[derive(Clone)]
pub struct SourceNode {
    ports: NodePorts,
    buffer: PortValues,
    callback_name: String,
    callback: Option<SourceHandler>,
}

impl fmt::Debug for SourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceNode")
            .field("ports", &self.ports)
            .field("buffer", &self.buffer)
            .field("callback_name", &self.callback_name)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl SourceNode {
    pub fn new(input: PortElements, output_type: PortType, shape: TensorShape) -> Self {
        let output = OutputPort::new("output", output_type, shape.size()).with_shape(shape);
        Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
            buffer: PortValues::zeros(output_type, shape.size()),
            callback_name: DEFAULT_SOURCE_CALLBACK.to_string(),
            callback: None,
        }
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    pub fn output_type(&self) -> PortType {
        self.ports.outputs[0].port_type
    }

    pub fn callback_name(&self) -> &str {
        &self.callback_name
    }

    pub fn set_callback_name(&mut self, name: &str) {
        self.callback_name = name.to_string();
    }

    pub fn set_callback(&mut self, callback: SourceHandler) {
        self.callback = Some(callback);
    }
}

impl Node for SourceNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.output_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        if let Some(callback) = &self.callback {
            let mut scratch = self.buffer.clone();
            if (&mut *callback.lock())(&mut scratch) {
                if scratch.len() != self.buffer.len() || scratch.port_type() != self.buffer.port_type() {
                    return Err(ModelError::InvalidArgument("source callback resized its buffer".into()));
                }
                self.buffer = scratch;
            }
        }
        Ok(vec![self.buffer.clone()])
    }

    fn reset(&mut self) {
        self.buffer = PortValues::zeros(self.buffer.port_type(), self.buffer.len());
    }

    fn has_state(&self) -> bool {
        true
    }

    /// Compiled callbacks carry float or double buffers only.
    fn is_compilable(&self) -> bool {
        self.output_type().is_real()
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let port_type = self.output_type();
        let size = self.buffer.len();
        let state_handle = compiler.state_global("buffer", &PortValues::zeros(port_type, size))?;
        let state = function.data_address(state_handle);
        let slot = function.stack_buffer(size * port_type.byte_size())?;
        let scratch = function.stack_address(slot, 0);
        function.copy_elements(port_type, scratch, state, size)?;

        let callback = compiler.declare_callback(
            &self.callback_name,
            CType::Bool,
            vec![
                ("context", CType::void_ptr()),
                ("buffer", CType::from_port_type(port_type).ptr()),
            ],
        )?;
        let context = compiler.context_pointer()?;
        let results = function.call(compiler.module()?, callback, &[context, scratch]);
        let fresh = results
            .first()
            .copied()
            .ok_or_else(|| CompileError::Jit(format!("{} returned nothing", self.callback_name)))?;
        function.if_then(fresh, |f| {
            f.copy_elements(port_type, state, scratch, size)?;
            Ok::<(), EmitterError>(())
        })?;

        let output = compiler.output_address(function, 0)?;
        function.copy_elements(port_type, output, state, size)?;
        Ok(())
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({
            "shape": self.ports.outputs[0].shape(),
            "callbackName": self.callback_name,
        }))
    }
}

impl ArchivableNode for SourceNode {
    const KIND: &'static str = "SourceNode";

    fn from_archive(port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        let port_type = required_port_type(port_type, Self::KIND)?;
        let shape: TensorShape = required_property(properties, "shape")?;
        let mut node = Self::new(inputs.get("input")?, port_type, shape);
        if let Some(name) = property::<String>(properties, "callbackName")? {
            node.set_callback_name(&name);
        }
        Ok(node)
    }
}
