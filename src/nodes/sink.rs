use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::codegen::emit_copy;
use crate::compiler::MapCompiler;
use crate::emitters::{CType, FunctionEmitter};
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};
use crate::model::archive::property;
use crate::model::{
    expect_inputs, expect_type, ArchivableNode, ArchivedInputs, InputPort, Node, NodePorts, OutputPort, PortElements,
    PortType, PortValues,
};
use crate::node_boilerplate;

/// Interpreter-side sink callback.
pub type SinkHandler = Arc<Mutex<dyn FnMut(&PortValues) + Send>>;

pub const DEFAULT_SINK_CALLBACK: &str = "SinkCallback";

/// Pushes its input to the host whenever the trigger is set, and passes the
/// input through.
#[derive(Clone)]
pub struct SinkNode {
    ports: NodePorts,
    callback_name: String,
    callback: Option<SinkHandler>,
}

impl fmt::Debug for SinkNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkNode")
            .field("ports", &self.ports)
            .field("callback_name", &self.callback_name)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl SinkNode {
    /// `trigger` must be a single boolean.
    pub fn new(input: PortElements, trigger: PortElements) -> ModelResult<Self> {
        expect_type(&trigger, PortType::Boolean)?;
        if trigger.size() != 1 {
            return Err(ModelError::InvalidArgument(format!(
                "trigger must be one value, got {}",
                trigger.size()
            )));
        }
        let output = OutputPort::new("output", input.port_type(), input.size());
        Ok(Self {
            ports: NodePorts::new(
                vec![InputPort::new("input", input), InputPort::new("trigger", trigger)],
                vec![output],
            ),
            callback_name: DEFAULT_SINK_CALLBACK.to_string(),
            callback: None,
        })
    }

    pub fn input(&self) -> &PortElements {
        &self.ports.inputs[0].elements
    }

    pub fn trigger(&self) -> &PortElements {
        &self.ports.inputs[1].elements
    }

    pub fn value_type(&self) -> PortType {
        self.input().port_type()
    }

    pub fn callback_name(&self) -> &str {
        &self.callback_name
    }

    pub fn set_callback_name(&mut self, name: &str) {
        self.callback_name = name.to_string();
    }

    pub fn set_callback(&mut self, callback: SinkHandler) {
        self.callback = Some(callback);
    }
}

impl Node for SinkNode {
    node_boilerplate!();

    fn type_name(&self) -> String {
        self.value_type().composite_name(Self::KIND)
    }

    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>> {
        expect_inputs(self, inputs)?;
        let triggered = matches!(&inputs[1], PortValues::Boolean(t) if t.first() == Some(&true));
        if triggered {
            if let Some(callback) = &self.callback {
                (&mut *callback.lock())(&inputs[0]);
            }
        }
        Ok(vec![inputs[0].clone()])
    }

    fn is_compilable(&self) -> bool {
        self.value_type().is_real()
    }

    fn compile(&self, compiler: &mut MapCompiler, function: &mut FunctionEmitter) -> CompileResult<()> {
        let port_type = self.value_type();
        let callback = compiler.declare_callback(
            &self.callback_name,
            CType::Void,
            vec![
                ("context", CType::void_ptr()),
                ("values", CType::from_port_type(port_type).const_ptr()),
            ],
        )?;
        let context = compiler.context_pointer()?;
        let values = compiler.input_address(function, self.input())?;
        let trigger = compiler.load_input(function, self.trigger(), 0)?;
        let module = compiler.module()?;
        function.if_then(trigger, |f| {
            f.call(module, callback, &[context, values]);
            Ok::<(), CompileError>(())
        })?;
        emit_copy(compiler, function, self.input())
    }

    fn properties(&self) -> ModelResult<Value> {
        Ok(json!({ "callbackName": self.callback_name }))
    }
}

impl ArchivableNode for SinkNode {
    const KIND: &'static str = "SinkNode";

    fn from_archive(_port_type: Option<PortType>, properties: &Value, inputs: &ArchivedInputs) -> ModelResult<Self> {
        let mut node = Self::new(inputs.get("input")?, inputs.get("trigger")?)?;
        if let Some(name) = property::<String>(properties, "callbackName")? {
            node.set_callback_name(&name);
        }
        Ok(node)
    }
}
