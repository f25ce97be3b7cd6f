// Run with: cargo run --release --bin profile_map -- [iterations] [warm-up iterations] [--json] [--summary] [--filter-trivial]
// Or: cargo build --release --bin profile_map && perf record --call-graph=dwarf ./target/release/profile_map

use std::error::Error;
use std::time::Instant;

use ell::compiler::ProfileRecord;
use ell::nodes::{
    BatchNormalizationLayerNode, ConvolutionNode, FullyConnectedLayerNode, InputNode, UnaryOperation,
    UnaryOperationNode,
};
use ell::{CompiledMap, Map, MapCompiler, MapCompilerOptions, Model, Node, PortElements, PortType, TensorShape};
use serde_json::json;

struct ProfileArguments {
    iterations: usize,
    warm_up_iterations: usize,
    json: bool,
    summary_only: bool,
    filter_trivial: bool,
}

impl ProfileArguments {
    fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut arguments = ProfileArguments {
            iterations: 1000,
            warm_up_iterations: 10,
            json: false,
            summary_only: false,
            filter_trivial: false,
        };
        let mut counts = Vec::new();
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--json" => arguments.json = true,
                "--summary" => arguments.summary_only = true,
                "--filter-trivial" => arguments.filter_trivial = true,
                _ => counts.push(arg.parse::<usize>()?),
            }
        }
        if let Some(&iterations) = counts.first() {
            arguments.iterations = iterations.max(1);
        }
        if let Some(&warm_up) = counts.get(1) {
            arguments.warm_up_iterations = warm_up;
        }
        Ok(arguments)
    }
}

fn add(model: &mut Model, node: impl Node) -> Result<PortElements, Box<dyn Error>> {
    let key = model.add_node(node)?;
    Ok(model.output(key)?)
}

// Small image classifier: conv -> batch norm -> tanh -> conv -> abs -> dense
fn classifier_map() -> Result<Map, Box<dyn Error>> {
    let mut model = Model::new();
    let weights = |count: usize| -> Vec<f64> { (0..count).map(|i| ((i * 31 % 17) as f64 - 8.0) / 16.0).collect() };

    let shape = TensorShape::new(28, 28, 1);
    let input = model.add_node(InputNode::with_shape(PortType::Real, shape))?;
    let x = model.output(input)?;
    let x = add(&mut model, ConvolutionNode::new(x, shape, weights(8 * 9), 8, 3, 1)?)?;
    let size = x.size();
    let x = add(
        &mut model,
        BatchNormalizationLayerNode::new(x, vec![0.05; size], vec![0.8; size], 1e-5)?,
    )?;
    let x = add(&mut model, UnaryOperationNode::new(x, UnaryOperation::Tanh)?)?;
    let hidden = TensorShape::new(26, 26, 8);
    let x = add(&mut model, ConvolutionNode::new(x, hidden, weights(16 * 25 * 8), 16, 5, 2)?)?;
    let x = add(&mut model, UnaryOperationNode::new(x, UnaryOperation::Abs)?)?;
    let size = x.size();
    let output = add(
        &mut model,
        FullyConnectedLayerNode::new(x, weights(10 * size), vec![0.0; 10])?,
    )?;
    Ok(Map::new(&model, vec![("input", input)], vec![("output", output)])?)
}

// Nodes that only move data around.
fn is_trivial(record: &ProfileRecord) -> bool {
    let node_type = record.node_type.as_deref().unwrap_or(&record.name);
    ["InputNode", "OutputNode", "ConstantNode", "ConcatenationNode"]
        .iter()
        .any(|kind| node_type.starts_with(kind))
}

fn average(record: &ProfileRecord) -> f64 {
    if record.count > 0 {
        record.total_time / record.count as f64
    } else {
        0.0
    }
}

fn print_nodes(nodes: &[ProfileRecord], node_types: &[ProfileRecord], type_width: usize) {
    println!("Node statistics");
    for record in nodes {
        println!(
            "Node[{}]:\t{:<width$}\ttime: {:.5} ms\tcount: {}",
            record.name,
            record.node_type.as_deref().unwrap_or(""),
            record.total_time,
            record.count,
            width = type_width
        );
    }

    println!("\n\nNode type statistics");
    for record in node_types {
        println!(
            "{:<width$}\ttime: {:.5} ms \tcount: {}",
            record.node_type.as_deref().unwrap_or(""),
            record.total_time,
            record.count,
            width = type_width
        );
    }
}

fn print_text(
    compiled: &CompiledMap,
    arguments: &ProfileArguments,
    elapsed_secs: f64,
) -> Result<(), Box<dyn Error>> {
    let iterations = arguments.iterations;
    let mut nodes = compiled.node_records()?;
    let mut node_types = compiled.node_type_records()?;
    if arguments.filter_trivial {
        nodes.retain(|r| !is_trivial(r));
        node_types.retain(|r| !is_trivial(r));
    }
    node_types.sort_by(|a, b| a.total_time.total_cmp(&b.total_time));
    let type_width = node_types
        .iter()
        .filter_map(|r| r.node_type.as_ref().map(String::len))
        .max()
        .unwrap_or(0);

    if !arguments.summary_only {
        print_nodes(&nodes, &node_types, type_width);
    }

    let model = compiled.model_counters()?;
    let per_run = if model.count > 0 {
        model.total_time / model.count as f64
    } else {
        0.0
    };
    println!("\nModel statistics");
    println!(
        "Total time: {:.5} ms \tcount: {}\t time per run: {:.5} ms",
        model.total_time, model.count, per_run
    );

    println!("\nWall clock");
    println!("Processed {} predictions in {:.3} s", iterations, elapsed_secs);
    println!("Predictions per second: {:.2}", iterations as f64 / elapsed_secs);
    println!(
        "Microseconds per prediction: {:.2}",
        elapsed_secs * 1e6 / iterations as f64
    );
    Ok(())
}

fn print_json(compiled: &CompiledMap, arguments: &ProfileArguments) -> Result<(), Box<dyn Error>> {
    let model = compiled.model_counters()?;
    let mut report = json!({
        "model_statistics": {
            "total_time": model.total_time,
            "average_time": if model.count > 0 { model.total_time / model.count as f64 } else { 0.0 },
            "count": model.count,
        },
    });
    if !arguments.summary_only {
        let keep = |r: &ProfileRecord| !(arguments.filter_trivial && is_trivial(r));
        let record_json = |r: &ProfileRecord| {
            json!({
                "name": r.name,
                "type": r.node_type,
                "total_time": r.total_time,
                "average_time": average(r),
                "count": r.count,
            })
        };
        let mut regions = Vec::new();
        for index in 0..compiled.region_count()? {
            if let Some(record) = compiled.region_info(index)? {
                regions.push(record_json(&record));
            }
        }
        let nodes: Vec<_> = compiled.node_records()?.iter().filter(|r| keep(r)).map(record_json).collect();
        let node_types: Vec<_> = compiled.node_type_records()?.iter().filter(|r| keep(r)).map(record_json).collect();
        report["node_statistics"] = json!(nodes);
        report["node_type_statistics"] = json!(node_types);
        report["region_statistics"] = json!(regions);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let arguments = ProfileArguments::from_env()?;

    let map = classifier_map()?;
    let options = MapCompilerOptions::default()
        .with_module_name("Profile")
        .with_profiling(true);
    let mut compiled = MapCompiler::new(options).compile(&map)?;

    let input_size = compiled.compiled_input_size()?;
    let input: Vec<f64> = (0..input_size).map(|i| ((i * 7919) % 1000) as f64 / 1000.0).collect();

    for _ in 0..arguments.warm_up_iterations {
        let _: Vec<f64> = compiled.compute(&input)?;
    }
    compiled.reset_profiling()?;

    if !arguments.json {
        println!("=== Classifier map ({} compiled nodes) ===", compiled.num_nodes());
        println!("Running {} predictions...", arguments.iterations);
    }
    let start = Instant::now();
    for _ in 0..arguments.iterations {
        let _: Vec<f64> = compiled.compute(&input)?;
    }
    let elapsed = start.elapsed().as_secs_f64();

    if arguments.json {
        print_json(&compiled, &arguments)
    } else {
        print_text(&compiled, &arguments, elapsed)
    }
}
