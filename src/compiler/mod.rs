//! Compilation of maps to native code and execution of the result.

pub mod callbacks;
mod compiled_map;
mod map_compiler;
mod model_profiler;

#[cfg(test)]
mod tests;

pub use callbacks::{CallbackContext, CallbackElement};
pub use compiled_map::{CallbackSignature, CompiledMap, PortSignature, ProfileRecord};
pub use map_compiler::MapCompiler;
pub use model_profiler::{ModelProfiler, NodeTimer};
