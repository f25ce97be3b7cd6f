//! Model-to-model optimization passes run before compilation.

mod convolution_method;
mod fuse_linear;


use std::fmt;

pub use convolution_method::{SetConvolutionMethodPass, CONVOLUTION_METHOD_KEY};
pub use fuse_linear::FuseLinearOperationsPass;

use crate::config::ModelOptimizerOptions;
use crate::error::ModelResult;
use crate::model::{Model, ModelTransformer, Node, NodeKey};

/// A pass that rebuilds a model one node at a time.
pub trait OptimizationPass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once before any node is visited.
    fn initialize(&self, _model: &Model) -> ModelResult<()> {
        Ok(())
    }

    /// Emits `node`, or whatever replaces it, into the transformer's model.
    /// Nodes are visited in dependency order.
    fn optimize_node(
        &self,
        model: &Model,
        key: NodeKey,
        node: &dyn Node,
        transformer: &mut ModelTransformer,
    ) -> ModelResult<()>;

    /// Called once with the optimized model.
    fn finalize(&self, _model: &Model) -> ModelResult<()> {
        Ok(())
    }

    fn run(&self, model: &Model, transformer: &mut ModelTransformer) -> ModelResult<Model> {
        self.initialize(model)?;
        let optimized = transformer.transform_model(model, |m, k, n, t| self.optimize_node(m, k, n, t))?;
        self.finalize(&optimized)?;
        Ok(optimized)
    }
}

/// An ordered list of passes.
#[derive(Default)]
pub struct ModelOptimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl fmt::Debug for ModelOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.passes.iter().map(|p| p.name()).collect();
        f.debug_struct("ModelOptimizer").field("passes", &names).finish()
    }
}

impl ModelOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The passes `options` enable, in their fixed order.
    pub fn from_options(options: &ModelOptimizerOptions) -> Self {
        let mut optimizer = Self::new();
        if options.fuse_linear_operations {
            optimizer.add_pass(FuseLinearOperationsPass);
        }
        if let Some(method) = options.preferred_convolution_method {
            optimizer.add_pass(SetConvolutionMethodPass::new(method));
        }
        optimizer
    }

    pub fn add_pass<P: OptimizationPass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn passes(&self) -> &[Box<dyn OptimizationPass>] {
        &self.passes
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}
