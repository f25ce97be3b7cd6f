//! The node catalog.

mod affine;
mod binary;
mod buffer;
mod codegen;
mod concatenation;
mod constant;
mod convolution;
mod iir_filter;
mod input;
mod layers;
mod matrix;
mod sink;
mod source;
mod sum;
mod unary;

#[cfg(test)]
mod tests;

pub use affine::AffineTransformNode;
pub use binary::{BinaryOperation, BinaryOperationNode, BinaryPredicate, BinaryPredicateNode};
pub use buffer::BufferNode;
pub use concatenation::ConcatenationNode;
pub use constant::ConstantNode;
pub use convolution::{ConvolutionMethod, ConvolutionNode};
pub use iir_filter::IIRFilterNode;
pub use input::{InputNode, OutputNode};
pub use layers::{BatchNormalizationLayerNode, FullyConnectedLayerNode};
pub use matrix::MatrixVectorProductNode;
pub use sink::{SinkHandler, SinkNode, DEFAULT_SINK_CALLBACK};
pub use source::{SourceHandler, SourceNode, DEFAULT_SOURCE_CALLBACK};
pub use sum::SumNode;
pub use unary::{UnaryOperation, UnaryOperationNode};

use crate::model::NodeRegistry;

/// Registers every node type above with `registry`.
pub fn register_standard_nodes(registry: &mut NodeRegistry) {
    registry.register::<InputNode>();
    registry.register::<OutputNode>();
    registry.register::<ConstantNode>();
    registry.register::<UnaryOperationNode>();
    registry.register::<BinaryOperationNode>();
    registry.register::<BinaryPredicateNode>();
    registry.register::<ConcatenationNode>();
    registry.register::<SumNode>();
    registry.register::<BufferNode>();
    registry.register::<IIRFilterNode>();
    registry.register::<AffineTransformNode>();
    registry.register::<MatrixVectorProductNode>();
    registry.register::<FullyConnectedLayerNode>();
    registry.register::<BatchNormalizationLayerNode>();
    registry.register::<ConvolutionNode>();
    registry.register::<SourceNode>();
    registry.register::<SinkNode>();
}
