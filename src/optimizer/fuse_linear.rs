use super::OptimizationPass;
use crate::error::ModelResult;
use crate::model::{Model, ModelTransformer, Node, NodeKey, PortElements};
use crate::nodes::AffineTransformNode;

/// Folds an affine transform that reads the whole output of another affine
/// transform into a single node.
///
/// `s2 * (s1 * x + b1) + b2` becomes `(s2 * s1) * x + (s2 * b1 + b2)`. Chains
/// collapse in one pass because the upstream node is looked up after it has
/// been rewritten.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseLinearOperationsPass;

/// The upstream affine node when `input` is exactly its full output.
fn whole_affine_output<'a>(model: &'a Model, input: &PortElements) -> Option<&'a AffineTransformNode> {
    let range = input.as_single_range()?;
    let upstream = model.node_as::<AffineTransformNode>(range.node)?;
    let port = upstream.output_ports().first()?;
    let covers = range.output == 0 && range.start == 0 && range.count == port.size;
    (covers && port.port_type == input.port_type()).then_some(upstream)
}

impl OptimizationPass for FuseLinearOperationsPass {
    fn name(&self) -> &'static str {
        "fuse-linear-operations"
    }

    fn optimize_node(
        &self,
        _model: &Model,
        _key: NodeKey,
        node: &dyn Node,
        transformer: &mut ModelTransformer,
    ) -> ModelResult<()> {
        let Some(second) = node.downcast_ref::<AffineTransformNode>() else {
            transformer.copy_node(node.clone_node())?;
            return Ok(());
        };
        let input = transformer.transform_elements(second.input())?;
        let fused = match whole_affine_output(transformer.model(), &input) {
            Some(first) => Some(AffineTransformNode::fuse(first, second, first.input().clone())?),
            None => None,
        };
        let Some(fused) = fused else {
            transformer.copy_node(node.clone_node())?;
            return Ok(());
        };
        log::debug!("fusing affine transforms of {} elements", fused.input().size());
        let key = transformer.add_node(fused)?;
        let output = transformer.model().output(key)?;
        transformer.map_output(0, output)
    }
}
