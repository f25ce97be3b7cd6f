use super::OptimizationPass;
use crate::error::ModelResult;
use crate::model::{Model, ModelTransformer, Node, NodeKey};
use crate::nodes::{ConvolutionMethod, ConvolutionNode};

/// Metadata key recording the method a convolution was assigned.
pub const CONVOLUTION_METHOD_KEY: &str = "convolutionMethod";

/// Assigns a preferred lowering to every convolution that supports it.
/// Incompatible convolutions are copied unchanged.
#[derive(Debug, Clone, Copy)]
pub struct SetConvolutionMethodPass {
    preferred: ConvolutionMethod,
}

impl SetConvolutionMethodPass {
    pub fn new(preferred: ConvolutionMethod) -> Self {
        Self { preferred }
    }

    pub fn preferred(&self) -> ConvolutionMethod {
        self.preferred
    }
}

impl OptimizationPass for SetConvolutionMethodPass {
    fn name(&self) -> &'static str {
        "set-convolution-method"
    }

    fn optimize_node(
        &self,
        _model: &Model,
        _key: NodeKey,
        node: &dyn Node,
        transformer: &mut ModelTransformer,
    ) -> ModelResult<()> {
        let Some(convolution) = node.downcast_ref::<ConvolutionNode>() else {
            transformer.copy_node(node.clone_node())?;
            return Ok(());
        };
        let (kernel, stride) = (convolution.kernel_size(), convolution.stride());
        let method = self
            .preferred
            .resolve(kernel, stride, convolution.input_shape().channels);
        if !method.is_compatible(kernel, stride) {
            transformer.copy_node(node.clone_node())?;
            return Ok(());
        }

        let input = transformer.transform_elements(convolution.input())?;
        let mut replacement = convolution.clone().with_method(method);
        replacement.ports_mut().inputs[0].elements = input;
        let key = transformer.add_node(replacement)?;
        transformer
            .metadata_mut(key)?
            .set(CONVOLUTION_METHOD_KEY, method.name());
        let output = transformer.model().output(key)?;
        transformer.map_output(0, output)
    }
}
