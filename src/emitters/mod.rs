mod function;
mod module;
pub mod profiler;
pub mod runtime;
pub mod types;
pub mod writers;

#[cfg(test)]
mod tests;

pub use function::{Comparison, FunctionEmitter};
pub use module::{
    host_isa, CallbackDecl, DataContents, DataDefinition, DataHandle, FunctionHandle, ModuleEmitter,
};
pub use profiler::{Profiler, RegionHandle, RegionTimer};
pub use runtime::{MathFunction, ProfileRegionInfo};
pub use types::{ir_type, CType, FunctionDecl, StructDecl};
pub use writers::ModuleOutputFormat;
