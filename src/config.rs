use serde::{Deserialize, Serialize};

use crate::nodes::ConvolutionMethod;

/// Settings for the optimizer passes run before compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelOptimizerOptions {
    pub fuse_linear_operations: bool,
    /// Convolution method to apply where compatible. `None` leaves every
    /// convolution node as built.
    pub preferred_convolution_method: Option<ConvolutionMethod>,
}

impl Default for ModelOptimizerOptions {
    fn default() -> Self {
        Self {
            fuse_linear_operations: true,
            preferred_convolution_method: None,
        }
    }
}

/// Settings for one `MapCompiler::compile` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapCompilerOptions {
    /// Prefix of every emitted symbol.
    pub module_name: String,
    /// Weave profiling counters into the emitted code.
    pub profile: bool,
    /// Run the optimizer passes.
    pub optimize: bool,
    pub max_refine_iterations: usize,
    pub source_callback_name: String,
    pub sink_callback_name: String,
    pub optimizer: ModelOptimizerOptions,
    /// Cranelift `opt_level`: `none`, `speed` or `speed_and_size`.
    pub opt_level: String,
}

impl Default for MapCompilerOptions {
    fn default() -> Self {
        Self {
            module_name: "ELL".to_string(),
            profile: false,
            optimize: true,
            max_refine_iterations: 10,
            source_callback_name: "SourceCallback".to_string(),
            sink_callback_name: "SinkCallback".to_string(),
            optimizer: ModelOptimizerOptions::default(),
            opt_level: "speed".to_string(),
        }
    }
}

impl MapCompilerOptions {
    pub fn with_module_name(mut self, name: impl Into<String>) -> Self {
        self.module_name = name.into();
        self
    }

    pub fn with_profiling(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_optimization(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_max_refine_iterations(mut self, iterations: usize) -> Self {
        self.max_refine_iterations = iterations;
        self
    }

    pub fn with_callback_names(mut self, source: impl Into<String>, sink: impl Into<String>) -> Self {
        self.source_callback_name = source.into();
        self.sink_callback_name = sink.into();
        self
    }

    pub fn with_optimizer(mut self, optimizer: ModelOptimizerOptions) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_opt_level(mut self, level: impl Into<String>) -> Self {
        self.opt_level = level.into();
        self
    }

    /// Fully qualified name of a module-level symbol, e.g. `ELL_Predict`.
    pub fn symbol(&self, name: &str) -> String {
        format!("{}_{}", self.module_name, name)
    }
}
