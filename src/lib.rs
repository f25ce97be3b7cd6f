//! Dataflow models compiled to native code.
//!
//! A [`Map`] wraps a [`Model`] of typed nodes with named inputs and outputs.
//! Maps can be evaluated by the interpreter, saved to and loaded from JSON
//! archives, refined and optimized, and compiled by a [`MapCompiler`] into a
//! [`CompiledMap`] that runs JIT-compiled code.

pub mod compiler;
pub mod config;
pub mod emitters;
pub mod error;
pub mod model;
pub mod nodes;
pub mod optimizer;

pub use compiler::{CompiledMap, MapCompiler};
pub use config::{MapCompilerOptions, ModelOptimizerOptions};
pub use emitters::ModuleOutputFormat;
pub use error::{CompileError, EmitterError, ModelError};
pub use model::{Map, Model, Node, NodeKey, PortElements, PortType, PortValues, TensorShape};
pub use optimizer::{ModelOptimizer, OptimizationPass};
