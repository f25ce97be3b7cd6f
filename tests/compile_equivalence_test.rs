// Integration tests for map compilation.
// Each test drives the interpreter and the JIT-compiled map with the same
// inputs and expects the same outputs.

use std::sync::Arc;

use approx::assert_relative_eq;
use parking_lot::Mutex;

use ell::model::archive::{map_from_str, map_to_string};
use ell::nodes::{
    AffineTransformNode, BatchNormalizationLayerNode, BinaryOperation, BinaryOperationNode, BinaryPredicate,
    BinaryPredicateNode, BufferNode, ConcatenationNode, ConstantNode, ConvolutionMethod, ConvolutionNode,
    FullyConnectedLayerNode, IIRFilterNode, InputNode, MatrixVectorProductNode, SinkNode, SourceNode, SumNode,
    UnaryOperation, UnaryOperationNode,
};
use ell::{
    CompileError, CompiledMap, Map, MapCompiler, MapCompilerOptions, Model, ModuleOutputFormat, Node, PortElements,
    PortType, PortValues, TensorShape,
};

fn add(model: &mut Model, node: impl Node) -> PortElements {
    let key = model.add_node(node).expect("add_node failed");
    model.output(key).expect("node has no output")
}

/// A map with one input of `port_type` and `size`, and the output `body` builds.
fn build(port_type: PortType, size: usize, body: impl FnOnce(&mut Model, PortElements) -> PortElements) -> Map {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(port_type, size)).unwrap();
    let x = model.output(input).unwrap();
    let output = body(&mut model, x);
    Map::new(&model, vec![("input", input)], vec![("output", output)]).unwrap()
}

/// An interpreted map and its compiled form, stepped in lockstep.
struct Pair {
    interpreted: Map,
    compiled: CompiledMap,
    epsilon: f64,
}

impl Pair {
    fn new(map: &Map) -> Self {
        Self::with_options(map, MapCompilerOptions::default())
    }

    fn with_options(map: &Map, options: MapCompilerOptions) -> Self {
        let compiled = MapCompiler::new(options).compile(map).expect("compile failed");
        let epsilon = match map.output_type(0).unwrap() {
            PortType::SmallReal => 1e-4,
            _ => 1e-9,
        };
        Self {
            interpreted: map.clone(),
            compiled,
            epsilon,
        }
    }

    fn step(&mut self, input: &[f64]) -> Vec<f64> {
        let expected: Vec<f64> = self.interpreted.compute(input).expect("interpreter failed");
        let actual: Vec<f64> = self.compiled.compute(input).expect("compiled map failed");
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(&expected) {
            assert_relative_eq!(*a, *e, epsilon = self.epsilon, max_relative = 1e-5);
        }
        actual
    }

    fn reset(&mut self) {
        self.interpreted.reset();
        self.compiled.reset().expect("reset failed");
    }
}

#[test]
fn test_negate_matches_interpreter() {
    let map = build(PortType::Real, 4, |m, x| add(m, UnaryOperationNode::new(x, UnaryOperation::Negate).unwrap()));
    let mut pair = Pair::new(&map);
    assert_eq!(pair.step(&[1.0, 2.0, 3.0, 4.0]), vec![-1.0, -2.0, -3.0, -4.0]);
    assert_eq!(pair.step(&[-0.5, 0.0, 10.0, 1e6]), vec![0.5, 0.0, -10.0, -1e6]);
}

#[test]
fn test_unary_operations() {
    let real = [
        UnaryOperation::Negate,
        UnaryOperation::Abs,
        UnaryOperation::Square,
        UnaryOperation::Sqrt,
        UnaryOperation::Exp,
        UnaryOperation::Log,
        UnaryOperation::Tanh,
        UnaryOperation::Sin,
        UnaryOperation::Cos,
    ];
    for port_type in [PortType::Real, PortType::SmallReal] {
        for operation in real {
            let map = build(port_type, 4, |m, x| add(m, UnaryOperationNode::new(x, operation).unwrap()));
            let mut pair = Pair::new(&map);
            pair.step(&[0.25, 1.0, 2.5, 4.0]);
            pair.step(&[0.5, 3.0, 1.5, 9.0]);
        }
    }

    for operation in [UnaryOperation::Negate, UnaryOperation::Abs, UnaryOperation::Square] {
        for port_type in [PortType::Integer, PortType::BigInt] {
            let map = build(port_type, 4, |m, x| add(m, UnaryOperationNode::new(x, operation).unwrap()));
            Pair::new(&map).step(&[-3.0, 4.0, 0.0, 7.0]);
        }
    }

    let not = build(PortType::Boolean, 4, |m, x| {
        add(m, UnaryOperationNode::new(x, UnaryOperation::LogicalNot).unwrap())
    });
    assert_eq!(Pair::new(&not).step(&[0.0, 1.0, 1.0, 0.0]), vec![1.0, 0.0, 0.0, 1.0]);
}

fn binary_map(port_type: PortType, operation: BinaryOperation) -> Map {
    build(port_type, 6, |m, x| {
        let a = x.sub_range(0, 3).unwrap();
        let b = x.sub_range(3, 3).unwrap();
        add(m, BinaryOperationNode::new(a, b, operation).unwrap())
    })
}

#[test]
fn test_binary_operations() {
    let arithmetic = [
        BinaryOperation::Add,
        BinaryOperation::Subtract,
        BinaryOperation::Multiply,
        BinaryOperation::Divide,
    ];
    for operation in arithmetic {
        for port_type in [PortType::Real, PortType::SmallReal] {
            Pair::new(&binary_map(port_type, operation)).step(&[7.0, -9.0, 2.5, 2.0, 4.0, 0.5]);
        }
        for port_type in [PortType::Integer, PortType::BigInt] {
            Pair::new(&binary_map(port_type, operation)).step(&[7.0, -9.0, 2.0, 2.0, 4.0, 0.0]);
        }
    }

    let divide = binary_map(PortType::Integer, BinaryOperation::Divide);
    assert_eq!(Pair::new(&divide).step(&[7.0, -9.0, 5.0, 2.0, 4.0, 0.0]), vec![3.0, -2.0, 0.0]);

    for operation in [BinaryOperation::LogicalAnd, BinaryOperation::LogicalOr, BinaryOperation::LogicalXor] {
        let map = binary_map(PortType::Boolean, operation);
        Pair::new(&map).step(&[1.0, 0.0, 1.0, 1.0, 1.0, 0.0]);
    }
}

#[test]
fn test_binary_predicates() {
    let predicates = [
        BinaryPredicate::Equal,
        BinaryPredicate::NotEqual,
        BinaryPredicate::Less,
        BinaryPredicate::LessOrEqual,
        BinaryPredicate::Greater,
        BinaryPredicate::GreaterOrEqual,
    ];
    for predicate in predicates {
        for port_type in [PortType::Real, PortType::Integer, PortType::SmallReal] {
            let map = build(port_type, 6, |m, x| {
                let a = x.sub_range(0, 3).unwrap();
                let b = x.sub_range(3, 3).unwrap();
                add(m, BinaryPredicateNode::new(a, b, predicate).unwrap())
            });
            Pair::new(&map).step(&[1.0, 2.0, 3.0, 2.0, 2.0, 1.0]);
        }
    }
}

#[test]
fn test_concatenation_sum_and_partial_outputs() {
    let concat = build(PortType::Real, 4, |m, x| {
        let negated = add(m, UnaryOperationNode::new(x.clone(), UnaryOperation::Negate).unwrap());
        let parts = [x.sub_range(2, 2).unwrap(), negated, x.sub_range(0, 1).unwrap()];
        add(m, ConcatenationNode::new(&parts).unwrap())
    });
    assert_eq!(
        Pair::new(&concat).step(&[1.0, 2.0, 3.0, 4.0]),
        vec![3.0, 4.0, -1.0, -2.0, -3.0, -4.0, 1.0]
    );

    let sum = build(PortType::Integer, 5, |m, x| add(m, SumNode::new(x).unwrap()));
    assert_eq!(Pair::new(&sum).step(&[1.0, 2.0, 3.0, 4.0, -5.0]), vec![5.0]);

    let middle = build(PortType::Real, 4, |m, x| {
        add(m, UnaryOperationNode::new(x, UnaryOperation::Square).unwrap())
            .sub_range(1, 2)
            .unwrap()
    });
    assert_eq!(Pair::new(&middle).step(&[1.0, 2.0, 3.0, 4.0]), vec![4.0, 9.0]);
}

#[test]
fn test_stateful_nodes_and_reset() {
    let buffer = build(PortType::Real, 2, |m, x| add(m, BufferNode::new(x, 6).unwrap()));
    let mut pair = Pair::new(&buffer);
    pair.step(&[1.0, 2.0]);
    pair.step(&[3.0, 4.0]);
    assert_eq!(pair.step(&[5.0, 6.0]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(pair.step(&[7.0, 8.0]), vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    pair.reset();
    assert_eq!(pair.step(&[9.0, 9.0]), vec![0.0, 0.0, 0.0, 0.0, 9.0, 9.0]);

    for port_type in [PortType::Real, PortType::SmallReal] {
        let filter = build(port_type, 3, |m, x| {
            add(m, IIRFilterNode::new(x, vec![0.5, 0.25], vec![-0.3, 0.1]).unwrap())
        });
        let mut pair = Pair::new(&filter);
        pair.step(&[1.0, 0.0, 0.0]);
        pair.step(&[0.0, 0.0, 0.0]);
        pair.step(&[0.5, -1.0, 2.0]);
        pair.reset();
        pair.step(&[1.0, 0.0, 0.0]);
    }
}

#[test]
fn test_linear_nodes() {
    let affine = build(PortType::Real, 3, |m, x| {
        add(m, AffineTransformNode::new(x, vec![2.0f64, -1.0, 0.5], vec![1.0f64, 0.0, -1.0]).unwrap())
    });
    assert_eq!(Pair::new(&affine).step(&[1.0, 2.0, 4.0]), vec![3.0, -2.0, 1.0]);

    let product = build(PortType::SmallReal, 3, |m, x| {
        add(m, MatrixVectorProductNode::new(x, vec![1.0f32, 0.0, 2.0, -1.0, 3.0, 0.5], 2).unwrap())
    });
    assert_eq!(Pair::new(&product).step(&[1.0, 2.0, 4.0]), vec![9.0, 7.0]);

    let layer = build(PortType::Real, 3, |m, x| {
        add(
            m,
            FullyConnectedLayerNode::new(x, vec![0.1f64, 0.2, 0.3, -0.4, 0.5, -0.6], vec![1.0f64, -1.0]).unwrap(),
        )
    });
    let mut pair = Pair::new(&layer);
    pair.step(&[1.0, 2.0, 3.0]);
    pair.step(&[-1.0, 0.5, 0.0]);

    let norm = build(PortType::Real, 3, |m, x| {
        add(
            m,
            BatchNormalizationLayerNode::new(x, vec![1.0, 2.0, 3.0], vec![4.0, 1.0, 0.25], 0.0).unwrap(),
        )
    });
    assert_eq!(Pair::new(&norm).step(&[3.0, 3.0, 3.5]), vec![1.0, 1.0, 1.0]);
}

fn convolution_map(port_type: PortType, stride: usize, method: ConvolutionMethod) -> Map {
    let shape = TensorShape::new(5, 5, 2);
    let weights: Vec<f64> = (0..36).map(|i| f64::from(i) * 0.1 - 1.0).collect();
    let mut model = Model::new();
    let input = model.add_node(InputNode::with_shape(port_type, shape)).unwrap();
    let x = model.output(input).unwrap();
    let filters = PortValues::from_f64(port_type, &weights);
    let convolution = ConvolutionNode::new(x, shape, filters, 2, 3, stride)
        .unwrap()
        .with_method(method);
    let output = add(&mut model, convolution);
    Map::new(&model, vec![("input", input)], vec![("output", output)]).unwrap()
}

#[test]
fn test_convolution_methods() {
    let input: Vec<f64> = (0..50).map(|i| f64::from(i % 7) - 3.0).collect();
    let methods = [
        ConvolutionMethod::Simple,
        ConvolutionMethod::Unrolled,
        ConvolutionMethod::Winograd,
        ConvolutionMethod::Automatic,
    ];
    let mut outputs = Vec::new();
    for method in methods {
        let mut pair = Pair::new(&convolution_map(PortType::Real, 1, method));
        let output = pair.step(&input);
        assert_eq!(output.len(), 18);
        outputs.push(output);
    }
    for output in &outputs[1..] {
        for (a, e) in output.iter().zip(&outputs[0]) {
            assert_relative_eq!(*a, *e, epsilon = 1e-9);
        }
    }

    for method in [ConvolutionMethod::Simple, ConvolutionMethod::Unrolled] {
        let output = Pair::new(&convolution_map(PortType::Real, 2, method)).step(&input);
        assert_eq!(output.len(), 8);
        Pair::new(&convolution_map(PortType::SmallReal, 1, method)).step(&input);
    }
}

#[test]
fn test_optimization_does_not_change_results() {
    let chain = build(PortType::Real, 2, |m, x| {
        let first = add(m, AffineTransformNode::new(x, vec![2.0f64; 2], vec![1.0f64; 2]).unwrap());
        let second = add(m, AffineTransformNode::new(first, vec![-3.0f64; 2], vec![0.5f64; 2]).unwrap());
        add(m, UnaryOperationNode::new(second, UnaryOperation::Abs).unwrap())
    });
    let mut optimized = Pair::new(&chain);
    let mut plain = Pair::with_options(&chain, MapCompilerOptions::default().with_optimization(false));
    assert!(optimized.compiled.num_nodes() < plain.compiled.num_nodes());
    for input in [[1.0, -2.0], [0.0, 0.25], [10.0, 3.0]] {
        assert_eq!(optimized.step(&input), plain.step(&input));
    }
}

#[test]
fn test_archived_map_compiles_the_same() {
    let map = build(PortType::Real, 3, |m, x| {
        let layer = add(
            m,
            FullyConnectedLayerNode::new(x, vec![1.0f64, -1.0, 0.5, 0.0, 2.0, 1.0], vec![0.0f64, 1.0]).unwrap(),
        );
        add(m, UnaryOperationNode::new(layer, UnaryOperation::Tanh).unwrap())
    });
    let restored = map_from_str(&map_to_string(&map).unwrap()).unwrap();
    let mut original = Pair::new(&map);
    let mut reloaded = Pair::new(&restored);
    for input in [[0.5, 1.0, -1.0], [2.0, 0.0, 0.25]] {
        assert_eq!(original.step(&input), reloaded.step(&input));
    }
}

/// Source of 3 doubles clocked by the `time` input, negated, then passed
/// through a sink that fires while `time` is above one half.
fn callback_map() -> Map {
    let mut model = Model::new();
    let time = model.add_node(InputNode::new(PortType::Real, 1)).unwrap();
    let clock = model.output(time).unwrap();
    let source = add(
        &mut model,
        SourceNode::new(clock.clone(), PortType::Real, TensorShape::vector(3)),
    );
    let negated = add(&mut model, UnaryOperationNode::new(source, UnaryOperation::Negate).unwrap());
    let half = add(&mut model, ConstantNode::new(vec![0.5f64]));
    let trigger = add(
        &mut model,
        BinaryPredicateNode::new(clock, half, BinaryPredicate::Greater).unwrap(),
    );
    let sink = add(&mut model, SinkNode::new(negated, trigger).unwrap());
    Map::new(&model, vec![("time", time)], vec![("output", sink)]).unwrap()
}

/// Yields `[n, n + 1, n + 2]` on the n-th call, and no data from the third
/// call on.
fn counting_source() -> impl FnMut(&mut [f64]) -> bool + Send + 'static {
    let mut calls = 0;
    move |buffer: &mut [f64]| {
        calls += 1;
        if calls > 2 {
            buffer.fill(99.0);
            return false;
        }
        for (i, value) in buffer.iter_mut().enumerate() {
            *value = (calls - 1 + i) as f64;
        }
        true
    }
}

#[test]
fn test_source_and_sink_callbacks() {
    let map = callback_map();
    let mut interpreted = map.clone();
    let mut compiled = MapCompiler::default().compile(&map).unwrap();

    let interpreted_sink = Arc::new(Mutex::new(Vec::<Vec<f64>>::new()));
    let compiled_sink = Arc::new(Mutex::new(Vec::<Vec<f64>>::new()));
    interpreted.set_source_callback::<f64, _>(counting_source()).unwrap();
    compiled.set_source_callback::<f64, _>(counting_source()).unwrap();
    let seen = Arc::clone(&interpreted_sink);
    interpreted
        .set_sink_callback::<f64, _>(move |values: &[f64]| seen.lock().push(values.to_vec()))
        .unwrap();
    let seen = Arc::clone(&compiled_sink);
    compiled
        .set_sink_callback::<f64, _>(move |values: &[f64]| seen.lock().push(values.to_vec()))
        .unwrap();

    let expected = [
        (0.0, vec![0.0, -1.0, -2.0]),
        (1.0, vec![-1.0, -2.0, -3.0]),
        (1.0, vec![-1.0, -2.0, -3.0]),
    ];
    for (time, output) in expected.iter() {
        interpreted.set_input_value(0, PortValues::Real(vec![*time])).unwrap();
        compiled.set_input_value(0, PortValues::Real(vec![*time])).unwrap();
        assert_eq!(&interpreted.compute_output(0).unwrap(), &PortValues::Real(output.clone()));
        assert_eq!(&compiled.compute_output(0).unwrap(), &PortValues::Real(output.clone()));
    }

    let delivered = vec![vec![-1.0, -2.0, -3.0], vec![-1.0, -2.0, -3.0]];
    assert_eq!(*interpreted_sink.lock(), delivered);
    assert_eq!(*compiled_sink.lock(), delivered);
}

#[test]
fn test_compiled_model_api() {
    let map = build(PortType::Real, 4, |m, x| add(m, UnaryOperationNode::new(x, UnaryOperation::Negate).unwrap()));
    let compiled = MapCompiler::default().compile(&map).unwrap();
    assert_eq!(compiled.compiled_input_size().unwrap(), 4);
    assert_eq!(compiled.compiled_output_size().unwrap(), 4);
    assert_eq!(compiled.compiled_num_nodes().unwrap(), 2);
    assert_eq!(compiled.compiled_input_shape(0).unwrap(), Some(map.input_shape(0).unwrap()));
    assert_eq!(compiled.compiled_output_shape(0).unwrap(), Some(map.output_shape(0).unwrap()));
    assert_eq!(compiled.compiled_output_shape(1).unwrap(), None);

    let sources = callback_map();
    let compiled = MapCompiler::default().compile(&sources).unwrap();
    assert_eq!(compiled.compiled_input_size().unwrap(), 3);
    assert_eq!(
        compiled.compiled_input_shape(0).unwrap(),
        Some(TensorShape::vector(3))
    );
}

#[test]
fn test_compiled_input_type_is_enforced() {
    let map = build(PortType::SmallReal, 2, |m, x| add(m, SumNode::new(x).unwrap()));
    let mut compiled = MapCompiler::default().compile(&map).unwrap();
    let result = compiled.set_input_value(0, PortValues::Real(vec![1.0, 2.0]));
    assert!(matches!(
        result,
        Err(CompileError::InputTypeMismatch {
            expected: PortType::SmallReal,
            found: PortType::Real
        })
    ));
    compiled.set_input_value(0, PortValues::SmallReal(vec![1.0, 2.0])).unwrap();
    assert_eq!(compiled.compute_output(0).unwrap(), PortValues::SmallReal(vec![3.0]));
}

#[test]
fn test_write_code() {
    let map = build(PortType::Real, 2, |m, x| add(m, SumNode::new(x).unwrap()));
    let compiled = MapCompiler::default().compile(&map).unwrap();

    let mut header = Vec::new();
    compiled.write_code_to(&mut header, ModuleOutputFormat::CHeader).unwrap();
    let header = String::from_utf8(header).unwrap();
    assert!(header.contains("void ELL_Predict(void* context, const double* input0, double* output0);"));
    assert!(header.contains("int32_t ELL_GetNumNodes(void);"));

    let mut ir = Vec::new();
    compiled.write_code_to(&mut ir, ModuleOutputFormat::Ir).unwrap();
    assert!(String::from_utf8(ir).unwrap().starts_with("; module ELL"));

    let path = std::env::temp_dir().join(format!("ell_write_code_{}.o", std::process::id()));
    compiled.write_code(&path, ModuleOutputFormat::ObjectCode).unwrap();
    let object = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert!(!object.is_empty());
}
