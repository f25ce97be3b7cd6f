pub mod archive;
mod map;
mod model_impl;
mod node;
mod port;
pub mod topology;
mod transformer;
pub mod types;


pub use archive::{ArchivableNode, ArchivedInputs, NodeRegistry};
pub use map::{Map, MapPort};
pub use model_impl::{Model, NodeEntry, NodeIterator};
pub use node::{expect_inputs, expect_type, Node};
pub use port::{
    InputPort, NodePorts, OutputPort, PortElements, PortRange, PortRef, DEFAULT_INPUT_PORT,
    DEFAULT_OUTPUT_PORT,
};
pub use transformer::ModelTransformer;
pub use types::{
    Element, NodeId, NodeKey, Numeric, PortType, PortValues, PropertyBag, Real,
    TensorShape,
};
