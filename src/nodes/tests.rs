use std::sync::Arc;

use approx::assert_relative_eq;
use float_cmp::assert_approx_eq;
use parking_lot::Mutex;

use super::*;
use crate::error::ModelError;
use crate::model::archive::{model_from_str, model_to_string};
use crate::model::{Model, ModelTransformer, Node, PortElements, PortType, PortValues, TensorShape};

fn input(model: &mut Model, port_type: PortType, size: usize) -> PortElements {
    let key = model.add_node(InputNode::new(port_type, size)).unwrap();
    model.output(key).unwrap()
}

fn constant(model: &mut Model, values: impl Into<PortValues>) -> PortElements {
    let key = model.add_node(ConstantNode::new(values)).unwrap();
    model.output(key).unwrap()
}

fn run(node: &mut dyn Node, inputs: Vec<PortValues>) -> PortValues {
    node.compute(&inputs).unwrap().remove(0)
}

#[test]
fn test_unary_operations() {
    let mut model = Model::new();
    let ints = input(&mut model, PortType::Integer, 3);
    let reals = input(&mut model, PortType::Real, 2);
    let flags = input(&mut model, PortType::Boolean, 2);

    let mut negate = UnaryOperationNode::new(ints.clone(), UnaryOperation::Negate).unwrap();
    assert_eq!(
        run(&mut negate, vec![PortValues::Integer(vec![1, -2, 0])]),
        PortValues::Integer(vec![-1, 2, 0])
    );
    assert_eq!(negate.type_name(), "UnaryOperationNode<int>");

    let mut sqrt = UnaryOperationNode::new(reals, UnaryOperation::Sqrt).unwrap();
    assert_eq!(run(&mut sqrt, vec![PortValues::Real(vec![4.0, 9.0])]), PortValues::Real(vec![2.0, 3.0]));

    let mut not = UnaryOperationNode::new(flags, UnaryOperation::LogicalNot).unwrap();
    assert_eq!(
        run(&mut not, vec![PortValues::Boolean(vec![true, false])]),
        PortValues::Boolean(vec![false, true])
    );

    assert!(UnaryOperationNode::new(ints.clone(), UnaryOperation::Sqrt).is_err());
    assert!(UnaryOperationNode::new(ints, UnaryOperation::LogicalNot).is_err());
}

#[test]
fn test_binary_operations() {
    let mut model = Model::new();
    let a = constant(&mut model, vec![7i32, -9, 4]);
    let b = constant(&mut model, vec![2i32, 0, -4]);

    let mut divide = BinaryOperationNode::new(a.clone(), b.clone(), BinaryOperation::Divide).unwrap();
    assert_eq!(
        run(
            &mut divide,
            vec![PortValues::Integer(vec![7, -9, 4]), PortValues::Integer(vec![2, 0, -4])]
        ),
        PortValues::Integer(vec![3, 0, -1])
    );

    let mut subtract = BinaryOperationNode::new(a, b, BinaryOperation::Subtract).unwrap();
    assert_eq!(
        run(&mut subtract, vec![PortValues::Integer(vec![1, 2, 3]), PortValues::Integer(vec![3, 2, 1])]),
        PortValues::Integer(vec![-2, 0, 2])
    );

    let p = constant(&mut model, vec![true, true, false]);
    let q = constant(&mut model, vec![true, false, false]);
    let mut xor = BinaryOperationNode::new(p, q, BinaryOperation::LogicalXor).unwrap();
    assert_eq!(
        run(
            &mut xor,
            vec![PortValues::Boolean(vec![true, true, false]), PortValues::Boolean(vec![true, false, false])]
        ),
        PortValues::Boolean(vec![false, true, false])
    );
}

#[test]
fn test_binary_operand_checks() {
    let mut model = Model::new();
    let reals = constant(&mut model, vec![1.0f64, 2.0]);
    let ints = constant(&mut model, vec![1i32, 2]);
    let short = constant(&mut model, vec![1.0f64]);

    let mismatch = BinaryOperationNode::new(reals.clone(), ints, BinaryOperation::Add);
    assert!(matches!(mismatch, Err(ModelError::InvalidArgument(_))));
    let ints = constant(&mut model, vec![1i32, 2]);
    let compared = BinaryPredicateNode::new(reals.clone(), ints, BinaryPredicate::Less);
    assert!(matches!(compared, Err(ModelError::InvalidArgument(_))));
    let sizes = BinaryOperationNode::new(reals.clone(), short, BinaryOperation::Add);
    assert!(matches!(sizes, Err(ModelError::InvalidArgument(_))));
    let logical = BinaryOperationNode::new(reals.clone(), reals, BinaryOperation::LogicalAnd);
    assert!(matches!(logical, Err(ModelError::InvalidArgument(_))));
}

#[test]
fn test_binary_predicates() {
    let mut model = Model::new();
    let a = constant(&mut model, vec![1.0f32, 2.0, 3.0]);
    let b = constant(&mut model, vec![2.0f32, 2.0, 2.0]);
    let mut less = BinaryPredicateNode::new(a.clone(), b.clone(), BinaryPredicate::Less).unwrap();
    let values = vec![PortValues::SmallReal(vec![1.0, 2.0, 3.0]), PortValues::SmallReal(vec![2.0, 2.0, 2.0])];
    assert_eq!(run(&mut less, values.clone()), PortValues::Boolean(vec![true, false, false]));

    let mut at_least = BinaryPredicateNode::new(a, b, BinaryPredicate::GreaterOrEqual).unwrap();
    assert_eq!(run(&mut at_least, values), PortValues::Boolean(vec![false, true, true]));
    assert_eq!(at_least.output_ports()[0].port_type, PortType::Boolean);
}

#[test]
fn test_concatenation() {
    assert!(matches!(ConcatenationNode::new(&[]), Err(ModelError::InvalidArgument(_))));

    let mut model = Model::new();
    let a = constant(&mut model, vec![1.0f64, 2.0]);
    let b = constant(&mut model, vec![3.0f64]);
    let key = model
        .add_node(ConcatenationNode::new(&[a, b.clone(), b]).unwrap())
        .unwrap();
    let output = model.output(key).unwrap();
    assert_eq!(output.size(), 4);
    assert_eq!(model.compute_output(&output).unwrap(), PortValues::Real(vec![1.0, 2.0, 3.0, 3.0]));

    let ints = constant(&mut model, vec![1i32]);
    let reals = constant(&mut model, vec![1.0f64]);
    assert!(ConcatenationNode::new(&[ints, reals]).is_err());
}

#[test]
fn test_sum() {
    let mut model = Model::new();
    let reals = input(&mut model, PortType::Real, 3);
    let mut sum = SumNode::new(reals).unwrap();
    assert_eq!(sum.output_ports()[0].size, 1);
    assert_eq!(run(&mut sum, vec![PortValues::Real(vec![1.0, 2.0, 3.5])]), PortValues::Real(vec![6.5]));

    let flags = input(&mut model, PortType::Boolean, 3);
    assert!(SumNode::new(flags).is_err());
}

#[test]
fn test_buffer_slides_and_resets() {
    let mut model = Model::new();
    let elements = input(&mut model, PortType::Real, 2);
    assert!(BufferNode::new(elements.clone(), 1).is_err());

    let mut buffer = BufferNode::new(elements, 4).unwrap();
    assert!(buffer.has_state());
    assert_eq!(
        run(&mut buffer, vec![PortValues::Real(vec![1.0, 2.0])]),
        PortValues::Real(vec![0.0, 0.0, 1.0, 2.0])
    );
    assert_eq!(
        run(&mut buffer, vec![PortValues::Real(vec![3.0, 4.0])]),
        PortValues::Real(vec![1.0, 2.0, 3.0, 4.0])
    );
    buffer.reset();
    assert_eq!(
        run(&mut buffer, vec![PortValues::Real(vec![5.0, 6.0])]),
        PortValues::Real(vec![0.0, 0.0, 5.0, 6.0])
    );
}

#[test]
fn test_iir_filter_impulse_response() {
    let mut model = Model::new();
    let elements = input(&mut model, PortType::Real, 3);
    assert!(IIRFilterNode::new(elements.clone(), Vec::new(), vec![0.5]).is_err());
    let ints = input(&mut model, PortType::Integer, 3);
    assert!(IIRFilterNode::new(ints, vec![1.0], Vec::new()).is_err());

    // y[t] = x[t] + 0.5 * y[t - 1]
    let mut filter = IIRFilterNode::new(elements, vec![1.0], vec![-0.5]).unwrap();
    assert_eq!(
        run(&mut filter, vec![PortValues::Real(vec![1.0, 0.0, 0.0])]),
        PortValues::Real(vec![1.0, 0.5, 0.25])
    );
    assert_eq!(
        run(&mut filter, vec![PortValues::Real(vec![0.0, 0.0, 0.0])]),
        PortValues::Real(vec![0.125, 0.0625, 0.03125])
    );
    filter.reset();
    assert_eq!(
        run(&mut filter, vec![PortValues::Real(vec![0.0, 0.0, 0.0])]),
        PortValues::Real(vec![0.0, 0.0, 0.0])
    );
}

#[test]
fn test_moving_difference_filter() {
    let mut model = Model::new();
    let elements = input(&mut model, PortType::SmallReal, 4);
    let mut filter = IIRFilterNode::new(elements, vec![1.0, -1.0], Vec::new()).unwrap();
    assert_eq!(
        run(&mut filter, vec![PortValues::SmallReal(vec![1.0, 3.0, 6.0, 10.0])]),
        PortValues::SmallReal(vec![1.0, 2.0, 3.0, 4.0])
    );
}

#[test]
fn test_single_precision_smoothing() {
    let mut model = Model::new();
    let elements = input(&mut model, PortType::SmallReal, 3);
    // y[t] = 0.5 * x[t] + 0.5 * y[t - 1]
    let mut filter = IIRFilterNode::new(elements, vec![0.5], vec![-0.5]).unwrap();
    let output = run(&mut filter, vec![PortValues::SmallReal(vec![1.0, 1.0, 1.0])]);
    let values = output.as_slice::<f32>().unwrap();
    assert_approx_eq!(f32, values[0], 0.5, epsilon = 1e-6);
    assert_approx_eq!(f32, values[1], 0.75, epsilon = 1e-6);
    assert_approx_eq!(f32, values[2], 0.875, epsilon = 1e-6);
}

#[test]
fn test_affine_transform_and_fusion() {
    let mut model = Model::new();
    let x = input(&mut model, PortType::Real, 2);
    let mut affine = AffineTransformNode::new(x.clone(), vec![2.0f64, 3.0], vec![1.0f64, 1.0]).unwrap();
    assert_eq!(run(&mut affine, vec![PortValues::Real(vec![1.0, 2.0])]), PortValues::Real(vec![3.0, 7.0]));

    let first = AffineTransformNode::new(x.clone(), vec![2.0f64, 2.0], vec![1.0f64, 0.0]).unwrap();
    let second = AffineTransformNode::new(x.clone(), vec![3.0f64, 3.0], vec![0.0f64, 1.0]).unwrap();
    let fused = AffineTransformNode::fuse(&first, &second, x.clone()).unwrap();
    assert_eq!(fused.scale(), &PortValues::Real(vec![6.0, 6.0]));
    assert_eq!(fused.bias(), &PortValues::Real(vec![3.0, 1.0]));

    assert!(AffineTransformNode::new(x.clone(), vec![1.0f64], vec![0.0f64, 0.0]).is_err());
    assert!(matches!(
        AffineTransformNode::new(x, vec![1i32, 1], vec![0i32, 0]),
        Err(ModelError::TypeMismatch { .. })
    ));
}

#[test]
fn test_matrix_vector_product() {
    let mut model = Model::new();
    let x = input(&mut model, PortType::Integer, 3);
    let mut product = MatrixVectorProductNode::new(x.clone(), vec![1i32, 2, 3, 0, -1, 1], 2).unwrap();
    assert_eq!(product.columns(), 3);
    assert_eq!(run(&mut product, vec![PortValues::Integer(vec![1, 1, 2])]), PortValues::Integer(vec![9, 1]));
    assert!(MatrixVectorProductNode::new(x, vec![1i32, 2, 3, 4], 2).is_err());
}

#[test]
fn test_fully_connected_layer_refines_to_product_and_bias() {
    let mut model = Model::new();
    let x = input(&mut model, PortType::Real, 2);
    let layer = model
        .add_node(FullyConnectedLayerNode::new(x, vec![1.0f64, 1.0, 2.0, -1.0], vec![0.5f64, 0.0]).unwrap())
        .unwrap();
    assert!(!model.node(layer).unwrap().is_compilable());

    let mut transformer = ModelTransformer::new();
    let (refined, changed) = transformer.refine_pass(&model, &|_| true).unwrap();
    assert!(changed);
    assert_eq!(refined.nodes_of_type::<MatrixVectorProductNode>().len(), 1);
    assert_eq!(refined.nodes_of_type::<AffineTransformNode>().len(), 1);
    assert!(refined.nodes_of_type::<FullyConnectedLayerNode>().is_empty());

    let mut node = model.node(layer).unwrap().clone_node();
    assert_eq!(run(node.as_mut(), vec![PortValues::Real(vec![3.0, 1.0])]), PortValues::Real(vec![4.5, 5.0]));
}

#[test]
fn test_batch_normalization() {
    let mut model = Model::new();
    let x = input(&mut model, PortType::Real, 2);
    assert!(BatchNormalizationLayerNode::new(x.clone(), vec![0.0, 0.0], vec![-1.0, 1.0], 0.5).is_err());
    let mut norm = BatchNormalizationLayerNode::new(x, vec![1.0, 0.0], vec![3.0, 0.0], 1.0).unwrap();
    let output = run(&mut norm, vec![PortValues::Real(vec![3.0, 2.0])]);
    let values = output.as_slice::<f64>().unwrap();
    assert_relative_eq!(values[0], 1.0);
    assert_relative_eq!(values[1], 2.0);
}

fn ones_filter_convolution(model: &mut Model, stride: usize) -> ConvolutionNode {
    let x = input(model, PortType::Real, 9);
    ConvolutionNode::new(x, TensorShape::new(3, 3, 1), vec![1.0f64; 4], 1, 2, stride).unwrap()
}

#[test]
fn test_convolution_windows() {
    let mut model = Model::new();
    let mut convolution = ones_filter_convolution(&mut model, 1);
    assert_eq!(convolution.output_shape(), TensorShape::new(2, 2, 1));
    let x: Vec<f64> = (1..=9).map(f64::from).collect();
    assert_eq!(
        run(&mut convolution, vec![PortValues::Real(x.clone())]),
        PortValues::Real(vec![12.0, 16.0, 24.0, 28.0])
    );

    let mut strided = ones_filter_convolution(&mut model, 2);
    assert_eq!(strided.output_shape(), TensorShape::new(1, 1, 1));
    assert_eq!(run(&mut strided, vec![PortValues::Real(x)]), PortValues::Real(vec![12.0]));
}

#[test]
fn test_convolution_rejects_bad_geometry() {
    let mut model = Model::new();
    let x = input(&mut model, PortType::Real, 4);
    let shape = TensorShape::new(2, 2, 1);
    assert!(ConvolutionNode::new(x.clone(), shape, vec![1.0f64; 9], 1, 3, 1).is_err());
    assert!(ConvolutionNode::new(x.clone(), shape, vec![1.0f64; 3], 1, 2, 1).is_err());
    assert!(ConvolutionNode::new(x.clone(), shape, vec![1.0f64; 4], 1, 2, 0).is_err());
    assert!(ConvolutionNode::new(x, TensorShape::new(3, 3, 1), vec![1.0f64; 4], 1, 2, 1).is_err());
}

#[test]
fn test_convolution_method_resolution() {
    assert!(ConvolutionMethod::Winograd.is_compatible(3, 1));
    assert!(!ConvolutionMethod::Winograd.is_compatible(3, 2));
    assert!(!ConvolutionMethod::Winograd.is_compatible(5, 1));
    assert_eq!(ConvolutionMethod::Automatic.resolve(3, 1, 16), ConvolutionMethod::Winograd);
    assert_eq!(ConvolutionMethod::Automatic.resolve(3, 2, 4), ConvolutionMethod::Unrolled);
    assert_eq!(ConvolutionMethod::Automatic.resolve(5, 2, 8), ConvolutionMethod::Simple);
    assert_eq!(ConvolutionMethod::Simple.resolve(3, 1, 1), ConvolutionMethod::Simple);
    assert_eq!(ConvolutionMethod::Winograd.kernel(), ConvolutionMethod::Simple);
    assert_eq!(ConvolutionMethod::Unrolled.kernel(), ConvolutionMethod::Unrolled);
    assert_eq!(ConvolutionMethod::Automatic.resolve(3, 1, 16).kernel(), ConvolutionMethod::Simple);

    let mut model = Model::new();
    let convolution = ones_filter_convolution(&mut model, 1);
    assert_eq!(convolution.method(), ConvolutionMethod::Simple);
    let automatic = convolution.with_method(ConvolutionMethod::Automatic);
    assert_eq!(automatic.effective_method(), ConvolutionMethod::Unrolled);
}

#[test]
fn test_source_keeps_last_accepted_buffer() {
    let mut model = Model::new();
    let time = input(&mut model, PortType::Real, 1);
    let mut source = SourceNode::new(time, PortType::Real, TensorShape::vector(2));
    assert_eq!(source.callback_name(), DEFAULT_SOURCE_CALLBACK);
    assert_eq!(run(&mut source, vec![PortValues::Real(vec![0.0])]), PortValues::Real(vec![0.0, 0.0]));

    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    source.set_callback(Arc::new(Mutex::new(move |values: &mut PortValues| {
        let mut count = counter.lock();
        *count += 1;
        if let Some(buffer) = values.as_mut_slice::<f64>() {
            buffer.fill(f64::from(*count));
        }
        *count == 1
    })));

    assert_eq!(run(&mut source, vec![PortValues::Real(vec![0.0])]), PortValues::Real(vec![1.0, 1.0]));
    // The second call reports no fresh data.
    assert_eq!(run(&mut source, vec![PortValues::Real(vec![0.0])]), PortValues::Real(vec![1.0, 1.0]));
    assert_eq!(*calls.lock(), 2);
    source.reset();
    assert_eq!(run(&mut source, vec![PortValues::Real(vec![0.0])]), PortValues::Real(vec![0.0, 0.0]));

    let clock = input(&mut model, PortType::Real, 1);
    assert!(!SourceNode::new(clock, PortType::Integer, TensorShape::vector(2)).is_compilable());
}

#[test]
fn test_sink_fires_on_trigger() {
    let mut model = Model::new();
    let values = input(&mut model, PortType::Real, 2);
    let trigger = constant(&mut model, vec![true]);
    let wide = constant(&mut model, vec![true, false]);
    assert!(SinkNode::new(values.clone(), wide).is_err());
    assert!(matches!(
        SinkNode::new(values.clone(), values.clone()),
        Err(ModelError::TypeMismatch { .. })
    ));

    let mut sink = SinkNode::new(values, trigger).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&seen);
    sink.set_callback(Arc::new(Mutex::new(move |values: &PortValues| {
        captured.lock().extend(values.to_f64_vec());
    })));

    let data = PortValues::Real(vec![1.5, 2.5]);
    let passed = run(&mut sink, vec![data.clone(), PortValues::Boolean(vec![true])]);
    assert_eq!(passed, data);
    run(&mut sink, vec![PortValues::Real(vec![9.0, 9.0]), PortValues::Boolean(vec![false])]);
    assert_eq!(*seen.lock(), vec![1.5, 2.5]);
}

#[test]
fn test_every_node_kind_survives_the_archive() {
    let mut model = Model::new();
    let x = input(&mut model, PortType::Real, 4);
    let c = constant(&mut model, vec![0.5f64, 1.0, 1.5, 2.0]);
    let flag = constant(&mut model, vec![true]);
    let add = |model: &mut Model, node: Box<dyn Node>| -> PortElements {
        let key = model.add_boxed_node(node, None, Default::default()).unwrap();
        model.output(key).unwrap()
    };

    let negated = add(&mut model, Box::new(UnaryOperationNode::new(x.clone(), UnaryOperation::Negate).unwrap()));
    let added = add(
        &mut model,
        Box::new(BinaryOperationNode::new(negated.clone(), c.clone(), BinaryOperation::Add).unwrap()),
    );
    add(
        &mut model,
        Box::new(BinaryPredicateNode::new(added.clone(), c.clone(), BinaryPredicate::Less).unwrap()),
    );
    let joined = add(
        &mut model,
        Box::new(ConcatenationNode::new(&[added.sub_range(0, 2).unwrap(), c.sub_range(1, 2).unwrap()]).unwrap()),
    );
    add(&mut model, Box::new(SumNode::new(joined.clone()).unwrap()));
    add(&mut model, Box::new(BufferNode::new(joined.clone(), 8).unwrap()));
    add(&mut model, Box::new(IIRFilterNode::new(joined.clone(), vec![0.5, 0.5], vec![0.1]).unwrap()));
    add(
        &mut model,
        Box::new(AffineTransformNode::new(x.clone(), vec![2.0f64; 4], vec![1.0f64; 4]).unwrap()),
    );
    add(&mut model, Box::new(MatrixVectorProductNode::new(x.clone(), vec![1.0f64; 8], 2).unwrap()));
    add(
        &mut model,
        Box::new(FullyConnectedLayerNode::new(x.clone(), vec![1.0f64; 4], vec![0.0f64]).unwrap()),
    );
    add(
        &mut model,
        Box::new(BatchNormalizationLayerNode::new(x.clone(), vec![0.0; 4], vec![1.0; 4], 0.001).unwrap()),
    );
    add(
        &mut model,
        Box::new(
            ConvolutionNode::new(x.clone(), TensorShape::new(2, 2, 1), vec![1.0f64; 4], 1, 2, 1)
                .unwrap()
                .with_method(ConvolutionMethod::Unrolled),
        ),
    );
    let sourced = add(
        &mut model,
        Box::new(SourceNode::new(x.sub_range(0, 1).unwrap(), PortType::Real, TensorShape::new(2, 2, 1))),
    );
    add(&mut model, Box::new(SinkNode::new(sourced, flag).unwrap()));
    add(&mut model, Box::new(OutputNode::new(added)));

    let text = model_to_string(&model).unwrap();
    let restored = model_from_str(&text).unwrap();
    assert_eq!(restored.size(), model.size());

    let names = |m: &Model| -> Vec<String> {
        m.insertion_order()
            .iter()
            .map(|&k| m.node(k).unwrap().type_name())
            .collect()
    };
    let mut expected = names(&model);
    let mut actual = names(&restored);
    expected.sort();
    actual.sort();
    assert_eq!(actual, expected);

    for key in restored.nodes_of_type::<ConvolutionNode>() {
        assert_eq!(restored.node_as::<ConvolutionNode>(key).unwrap().method(), ConvolutionMethod::Unrolled);
    }
    for key in restored.nodes_of_type::<IIRFilterNode>() {
        let filter = restored.node_as::<IIRFilterNode>(key).unwrap();
        assert_eq!(filter.feed_forward(), &[0.5, 0.5]);
        assert_eq!(filter.feedback(), &[0.1]);
    }
}
