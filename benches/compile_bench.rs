use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ell::nodes::{
    AffineTransformNode, BatchNormalizationLayerNode, ConvolutionMethod, ConvolutionNode, FullyConnectedLayerNode,
    InputNode, UnaryOperation, UnaryOperationNode,
};
use ell::{Map, MapCompiler, MapCompilerOptions, Model, ModelOptimizerOptions, Node, PortElements, PortType, TensorShape};

fn add(model: &mut Model, node: impl Node) -> PortElements {
    let key = model.add_node(node).unwrap();
    model.output(key).unwrap()
}

fn weights(count: usize) -> Vec<f64> {
    (0..count).map(|i| ((i % 7) as f64 - 3.0) * 0.1).collect()
}

fn simple_map() -> Map {
    let mut model = Model::new();

    // Simple: one elementwise node
    let input = model.add_node(InputNode::new(PortType::Real, 16)).unwrap();
    let x = model.output(input).unwrap();
    let output = add(&mut model, UnaryOperationNode::new(x, UnaryOperation::Negate).unwrap());
    Map::new(&model, vec![("input", input)], vec![("output", output)]).unwrap()
}

fn medium_map() -> Map {
    let mut model = Model::new();

    // Medium: convolution + batch norm + tanh + fully connected
    let shape = TensorShape::new(8, 8, 1);
    let input = model.add_node(InputNode::with_shape(PortType::Real, shape)).unwrap();
    let x = model.output(input).unwrap();
    let conv = ConvolutionNode::new(x, shape, weights(4 * 9), 4, 3, 1).unwrap();
    let x = add(&mut model, conv);
    let size = x.size();
    let x = add(
        &mut model,
        BatchNormalizationLayerNode::new(x, vec![0.1; size], vec![1.5; size], 1e-5).unwrap(),
    );
    let x = add(&mut model, UnaryOperationNode::new(x, UnaryOperation::Tanh).unwrap());
    let output = add(
        &mut model,
        FullyConnectedLayerNode::new(x, weights(10 * size), vec![0.0; 10]).unwrap(),
    );
    Map::new(&model, vec![("input", input)], vec![("output", output)]).unwrap()
}

fn complex_map() -> Map {
    let mut model = Model::new();

    // Complex: two convolutions and a stack of affine and dense layers
    let shape = TensorShape::new(16, 16, 2);
    let input = model.add_node(InputNode::with_shape(PortType::Real, shape)).unwrap();
    let x = model.output(input).unwrap();
    let x = add(
        &mut model,
        ConvolutionNode::new(x, shape, weights(8 * 9 * 2), 8, 3, 1).unwrap(),
    );
    let hidden = TensorShape::new(14, 14, 8);
    let x = add(
        &mut model,
        ConvolutionNode::new(x, hidden, weights(4 * 25 * 8), 4, 5, 2).unwrap(),
    );
    let mut x = add(&mut model, UnaryOperationNode::new(x, UnaryOperation::Abs).unwrap());
    for (scale, bias) in [(0.5, 0.1), (2.0, -0.2), (1.5, 0.0)] {
        let size = x.size();
        x = add(
            &mut model,
            AffineTransformNode::new(x, vec![scale; size], vec![bias; size]).unwrap(),
        );
    }
    let size = x.size();
    let x = add(
        &mut model,
        FullyConnectedLayerNode::new(x, weights(32 * size), vec![0.01; 32]).unwrap(),
    );
    let output = add(
        &mut model,
        FullyConnectedLayerNode::new(x, weights(10 * 32), vec![0.0; 10]).unwrap(),
    );
    Map::new(&model, vec![("input", input)], vec![("output", output)]).unwrap()
}

fn input_for(map: &Map) -> Vec<f64> {
    let size = map.input_size(0usize).unwrap();
    (0..size).map(|i| (i as f64 * 0.37).sin()).collect()
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    group.sample_size(20);

    for (name, map) in [
        ("simple_map", simple_map()),
        ("medium_map", medium_map()),
        ("complex_map", complex_map()),
    ] {
        group.bench_function(name, |b| {
            let mut compiler = MapCompiler::new(MapCompilerOptions::default());
            b.iter(|| {
                let compiled = compiler.compile(black_box(&map)).unwrap();
                compiled.ensure_execution_engine().unwrap();
                black_box(compiled);
            });
        });
    }

    group.finish();
}

fn bench_interpreted(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreted_compute");

    for (name, mut map) in [("medium_map", medium_map()), ("complex_map", complex_map())] {
        let input = input_for(&map);
        group.bench_function(name, |b| {
            b.iter(|| {
                let output: Vec<f64> = map.compute(black_box(&input)).unwrap();
                black_box(output);
            });
        });
    }

    group.finish();
}

fn bench_compiled(c: &mut Criterion) {
    let mut group = c.benchmark_group("compiled_compute");

    for (name, map) in [("medium_map", medium_map()), ("complex_map", complex_map())] {
        let input = input_for(&map);
        group.bench_function(name, |b| {
            let mut compiled = MapCompiler::new(MapCompilerOptions::default()).compile(&map).unwrap();
            b.iter(|| {
                let output: Vec<f64> = compiled.compute(black_box(&input)).unwrap();
                black_box(output);
            });
        });
    }

    group.finish();
}

fn bench_compiled_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("compiled_compute_batch");

    for size in [1, 10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("medium_map", size), size, |b, &size| {
            let map = medium_map();
            let input = input_for(&map);
            let mut compiled = MapCompiler::new(MapCompilerOptions::default()).compile(&map).unwrap();

            b.iter(|| {
                for _ in 0..size {
                    let output: Vec<f64> = compiled.compute(&input).unwrap();
                    black_box(output);
                }
            });
        });
    }

    group.finish();
}

fn bench_convolution_methods(c: &mut Criterion) {
    let mut group = c.benchmark_group("convolution_method");

    for method in [
        ConvolutionMethod::Simple,
        ConvolutionMethod::Unrolled,
        ConvolutionMethod::Winograd,
    ] {
        let map = medium_map();
        let input = input_for(&map);
        let options = MapCompilerOptions::default().with_optimizer(ModelOptimizerOptions {
            fuse_linear_operations: true,
            preferred_convolution_method: Some(method),
        });
        let mut compiled = MapCompiler::new(options).compile(&map).unwrap();

        group.bench_function(format!("{:?}", method), |b| {
            b.iter(|| {
                let output: Vec<f64> = compiled.compute(black_box(&input)).unwrap();
                black_box(output);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_compile,
    bench_interpreted,
    bench_compiled,
    bench_compiled_batch,
    bench_convolution_methods
);
criterion_main!(benches);
