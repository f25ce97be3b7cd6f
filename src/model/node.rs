use std::any::Any;
use std::fmt;

use super::port::{InputPort, NodePorts, OutputPort, PortElements, PortRef};
use super::transformer::ModelTransformer;
use super::types::{PortType, PortValues};
use crate::compiler::MapCompiler;
use crate::emitters::FunctionEmitter;
use crate::error::{CompileError, CompileResult, ModelError, ModelResult};

/// A unit of computation in a model.
///
/// Nodes own their port declarations and parameters. Cached output values,
/// identity and metadata live in the owning model's entry for the node.
pub trait Node: fmt::Debug + Send + Sync + 'static {
    /// Stable composite type name, e.g. `BinaryOperationNode<double>`. Used for
    /// archive dispatch and profiling reports.
    fn type_name(&self) -> String;

    fn ports(&self) -> &NodePorts;

    fn ports_mut(&mut self) -> &mut NodePorts;

    fn clone_node(&self) -> Box<dyn Node>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Computes output values from the current input values, one entry per output port.
    fn compute(&mut self, inputs: &[PortValues]) -> ModelResult<Vec<PortValues>>;

    /// Clears internal state. Stateless nodes keep the default.
    fn reset(&mut self) {}

    fn has_state(&self) -> bool {
        false
    }

    /// Expands the node into simpler nodes in the transformer's target model.
    ///
    /// Returns `true` if the node was replaced, `false` if it was copied as-is.
    fn refine(&self, transformer: &mut ModelTransformer) -> ModelResult<bool> {
        transformer.copy_node(self.clone_node())?;
        Ok(false)
    }

    fn is_compilable(&self) -> bool {
        false
    }

    /// Emits instructions reading the input ports' storage and writing the
    /// output ports' storage.
    fn compile(&self, _compiler: &mut MapCompiler, _function: &mut FunctionEmitter) -> CompileResult<()> {
        Err(CompileError::UncompilableNode(self.type_name()))
    }

    /// Node parameters for the archive (ports are archived by the model).
    fn properties(&self) -> ModelResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn input_ports(&self) -> &[InputPort] {
        &self.ports().inputs
    }

    fn output_ports(&self) -> &[OutputPort] {
        &self.ports().outputs
    }

    fn input_port(&self, name: &str) -> ModelResult<&InputPort> {
        self.ports().input(name)
    }

    fn output_port(&self, name: &str) -> ModelResult<&OutputPort> {
        self.ports().output(name)
    }

    fn port(&self, name: &str) -> ModelResult<PortRef<'_>> {
        if let Ok(input) = self.ports().input(name) {
            return Ok(PortRef::Input(input));
        }
        self.ports()
            .output(name)
            .map(PortRef::Output)
            .map_err(|_| ModelError::PortNotFound(name.to_string()))
    }
}

impl dyn Node {
    pub fn downcast_ref<T: Node>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Node>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    pub fn is<T: Node>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Implements the boilerplate `Node` accessors for a struct with a `ports` field.
#[macro_export]
macro_rules! node_boilerplate {
    () => {
        fn ports(&self) -> &$crate::model::NodePorts {
            &self.ports
        }

        fn ports_mut(&mut self) -> &mut $crate::model::NodePorts {
            &mut self.ports
        }

        fn clone_node(&self) -> Box<dyn $crate::model::Node> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    };
}

/// Checks that `elements` carry `expected` element type.
pub fn expect_type(elements: &PortElements, expected: PortType) -> ModelResult<()> {
    if elements.port_type() != expected {
        return Err(ModelError::TypeMismatch {
            expected,
            found: elements.port_type(),
        });
    }
    Ok(())
}

/// Checks that the interpreter handed a node the number of inputs it declares.
pub fn expect_inputs(node: &dyn Node, inputs: &[PortValues]) -> ModelResult<()> {
    if inputs.len() != node.input_ports().len() {
        return Err(ModelError::InvalidArgument(format!(
            "{} expects {} inputs, got {}",
            node.type_name(),
            node.input_ports().len(),
            inputs.len()
        )));
    }
    Ok(())
}
