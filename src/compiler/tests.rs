use super::*;
use crate::config::MapCompilerOptions;
use crate::error::{CompileError, ModelError};
use crate::model::{
    InputPort, Map, Model, ModelTransformer, Node, NodeKey, NodePorts, OutputPort, PortElements, PortType,
    PortValues, TensorShape,
};
use crate::nodes::{
    BinaryOperation, BinaryOperationNode, FullyConnectedLayerNode, InputNode, SourceNode, UnaryOperation,
    UnaryOperationNode,
};

fn negate_map(size: usize) -> Map {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(PortType::Real, size)).unwrap();
    let negate = model
        .add_node(UnaryOperationNode::new(model.output(input).unwrap(), UnaryOperation::Negate).unwrap())
        .unwrap();
    Map::new(&model, vec![("input", input)], vec![("output", model.output(negate).unwrap())]).unwrap()
}

/// A map whose output negates `count` sources of `port_type`, all clocked by
/// the map input.
fn source_map(port_type: PortType, count: usize) -> Map {
    let mut model = Model::new();
    let time = model.add_node(InputNode::new(PortType::Real, 1)).unwrap();
    let sources: Vec<NodeKey> = (0..count)
        .map(|_| {
            model
                .add_node(SourceNode::new(model.output(time).unwrap(), port_type, TensorShape::vector(2)))
                .unwrap()
        })
        .collect();
    let mut elements = model.output(sources[0]).unwrap();
    for &other in &sources[1..] {
        let sum = BinaryOperationNode::new(elements, model.output(other).unwrap(), BinaryOperation::Add).unwrap();
        let key = model.add_node(sum).unwrap();
        elements = model.output(key).unwrap();
    }
    Map::new(&model, vec![("time", time)], vec![("output", elements)]).unwrap()
}

fn compile(map: &Map, options: MapCompilerOptions) -> Result<CompiledMap, CompileError> {
    MapCompiler::new(options).compile(map)
}

#[test]
fn test_compile_leaves_map_untouched() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(PortType::Real, 2)).unwrap();
    let layer = model
        .add_node(
            FullyConnectedLayerNode::new(model.output(input).unwrap(), vec![1.0f64, 2.0, 3.0, 4.0], vec![0.0f64; 2])
                .unwrap(),
        )
        .unwrap();
    let map = Map::new(&model, vec![("input", input)], vec![("output", model.output(layer).unwrap())]).unwrap();

    let mut compiled = compile(&map, MapCompilerOptions::default()).unwrap();
    assert_eq!(map.model().nodes_of_type::<FullyConnectedLayerNode>().len(), 1);
    let output: Vec<f64> = compiled.compute(&[1.0f64, 1.0]).unwrap();
    assert_eq!(output, vec![3.0, 7.0]);
}

#[test]
fn test_engine_is_built_on_first_use() {
    let compiled = compile(&negate_map(2), MapCompilerOptions::default()).unwrap();
    assert!(!compiled.is_jitted());
    compiled.ensure_execution_engine().unwrap();
    assert!(compiled.is_jitted());
    assert_eq!(compiled.compiled_num_nodes().unwrap(), compiled.num_nodes());
}

#[test]
fn test_symbols_carry_module_name() {
    let options = MapCompilerOptions::default().with_module_name("Demo");
    let compiled = compile(&negate_map(3), options).unwrap();
    assert_eq!(compiled.name(), "Demo");

    let header = compiled.c_header();
    assert!(header.contains("void Demo_Predict(void* context, const double* input0, double* output0);"));
    assert!(header.contains("void Demo_Reset(void);"));
    assert!(header.contains("int32_t Demo_GetInputSize(void);"));
    assert!(header.contains("void Demo_GetOutputShape(int32_t index, TensorShape* shape);"));
    assert!(header.contains("typedef struct TensorShape"));
    assert!(!header.contains("Demo_PredictPacked"));
    assert!(!header.contains("Callbacks the host provides"));
}

#[test]
fn test_input_staging_checks() {
    let mut compiled = compile(&negate_map(2), MapCompilerOptions::default()).unwrap();
    let missing = compiled.set_input_value(1, PortValues::Real(vec![0.0, 0.0]));
    assert!(matches!(missing, Err(CompileError::Model(ModelError::OutOfRange(_)))));

    let wrong_type = compiled.set_input_value(0, PortValues::SmallReal(vec![0.0, 0.0]));
    assert!(matches!(
        wrong_type,
        Err(CompileError::InputTypeMismatch {
            expected: PortType::Real,
            found: PortType::SmallReal
        })
    ));

    let wrong_size = compiled.set_input_value(0, PortValues::Real(vec![0.0]));
    assert!(matches!(wrong_size, Err(CompileError::Model(ModelError::InvalidArgument(_)))));
    assert!(matches!(compiled.compute_output(3), Err(CompileError::Model(ModelError::OutOfRange(_)))));
}

#[test]
fn test_profiling_accessors_need_profiling() {
    let compiled = compile(&negate_map(2), MapCompilerOptions::default()).unwrap();
    assert!(!compiled.is_profiling());
    assert!(matches!(compiled.region_count(), Err(CompileError::Unsupported(_))));
    assert!(matches!(compiled.model_counters(), Err(CompileError::Unsupported(_))));
}

#[test]
fn test_integer_source_is_uncompilable() {
    let result = compile(&source_map(PortType::Integer, 1), MapCompilerOptions::default());
    match result {
        Err(CompileError::UncompilableNode(name)) => assert_eq!(name, "SourceNode<int>"),
        other => panic!("expected an uncompilable node, got {:?}", other),
    }
}

/// Refines into a fresh copy of itself forever.
#[derive(Debug, Clone)]
struct RestlessNode {
    ports: NodePorts,
}

impl RestlessNode {
    fn new(input: PortElements) -> Self {
        let output = OutputPort::new("output", input.port_type(), input.size());
        Self {
            ports: NodePorts::new(vec![InputPort::new("input", input)], vec![output]),
        }
    }
}

impl Node for RestlessNode {
    crate::node_boilerplate!();

    fn type_name(&self) -> String {
        "RestlessNode".to_string()
    }

    fn compute(&mut self, inputs: &[PortValues]) -> crate::error::ModelResult<Vec<PortValues>> {
        Ok(inputs.to_vec())
    }

    fn refine(&self, transformer: &mut ModelTransformer) -> crate::error::ModelResult<bool> {
        let input = transformer.transform_elements(&self.ports.inputs[0].elements)?;
        let key = transformer.add_node(RestlessNode::new(input))?;
        let output = transformer.model().output(key)?;
        transformer.map_output(0, output)?;
        Ok(true)
    }
}

#[test]
fn test_endless_refinement_is_uncompilable() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(PortType::Real, 3)).unwrap();
    let restless = model.add_node(RestlessNode::new(model.output(input).unwrap())).unwrap();
    let map = Map::new(&model, vec![("input", input)], vec![("output", model.output(restless).unwrap())]).unwrap();

    for rounds in [0, 1, 4] {
        let options = MapCompilerOptions::default().with_max_refine_iterations(rounds);
        match compile(&map, options) {
            Err(CompileError::UncompilableNode(name)) => assert_eq!(name, "RestlessNode"),
            other => panic!("expected an uncompilable node, got {:?}", other.map(|_| ())),
        }
    }
}

#[test]
fn test_source_input_reports_its_own_buffer() {
    let map = source_map(PortType::SmallReal, 1);
    assert_eq!(map.input_type(0usize).unwrap(), PortType::Real);
    assert_eq!(map.input_size(0usize).unwrap(), 1);
    assert_eq!(map.data_input_shape(0usize).unwrap(), TensorShape::vector(2));

    let compiled = compile(&map, MapCompilerOptions::default()).unwrap();
    let signature = &compiled.inputs()[0];
    assert_eq!(signature.port_type, map.input_type(0usize).unwrap());
    assert_eq!(signature.size, map.input_size(0usize).unwrap());
    assert_eq!(compiled.compiled_input_size().unwrap(), 2);
}

#[test]
fn test_one_source_per_compiled_map() {
    let result = compile(&source_map(PortType::Real, 2), MapCompilerOptions::default());
    assert!(matches!(result, Err(CompileError::Unsupported(_))));
}

#[test]
fn test_callback_names_and_types() {
    let options = MapCompilerOptions::default()
        .with_module_name("Demo")
        .with_callback_names("Fetch", "Emit");
    let mut compiled = compile(&source_map(PortType::Real, 1), options).unwrap();
    let header = compiled.c_header();
    assert!(header.contains("// Callbacks the host provides"));
    assert!(header.contains("bool Demo_Fetch(void* context, double* buffer);"));

    let wrong = compiled.set_source_callback::<f32, _>(|_: &mut [f32]| false);
    assert!(matches!(wrong, Err(CompileError::Model(ModelError::TypeMismatch { .. }))));
    let no_sink = compiled.set_sink_callback::<f64, _>(|_: &[f64]| {});
    assert!(matches!(no_sink, Err(CompileError::Unsupported(_))));
    compiled.set_source_callback::<f64, _>(|_: &mut [f64]| false).unwrap();
}
