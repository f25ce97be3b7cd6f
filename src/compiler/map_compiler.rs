use std::collections::HashMap;

use cranelift::codegen::ir::StackSlot;
use cranelift::prelude::*;
use cranelift_module::Linkage;

use super::compiled_map::{CallbackSignature, CompiledMap, PortSignature};
use super::model_profiler::ModelProfiler;
use crate::config::MapCompilerOptions;
use crate::emitters::runtime::CTensorShape;
use crate::emitters::{
    CType, DataDefinition, DataHandle, FunctionDecl, FunctionEmitter, FunctionHandle, ModuleEmitter, StructDecl,
};
use crate::error::{CompileError, CompileResult};
use crate::model::{Map, Node, NodeId, NodeKey, PortElements, PortRange, PortType, PortValues, TensorShape};
use crate::nodes::{SinkNode, SourceNode};
use crate::optimizer::ModelOptimizer;

/// Where a port's values live in the predict function.
#[derive(Debug, Clone, Copy)]
enum PortStorage {
    /// A predict-function argument (map inputs).
    Argument(Value),
    Stack(StackSlot),
    Global(DataHandle),
}

#[derive(Debug, Clone, Copy)]
struct StateGlobal {
    state: DataHandle,
    initial: DataHandle,
    port_type: PortType,
    size: usize,
}

#[derive(Debug, Clone)]
struct CurrentNode {
    key: NodeKey,
    id: NodeId,
    outputs: Vec<(PortType, usize)>,
}

/// Compiles maps into native code.
///
/// A compile run refines and optimizes a private copy of the map, then walks
/// its nodes in dependency order and lets each node emit itself into one
/// predict function. Nodes reach their port storage, constants, state and
/// callbacks through the methods below.
#[derive(Debug)]
pub struct MapCompiler {
    options: MapCompilerOptions,
    module: Option<ModuleEmitter>,
    storage: HashMap<(NodeKey, usize), PortStorage>,
    state: Vec<StateGlobal>,
    current: Option<CurrentNode>,
    context: Option<Value>,
    global_count: usize,
}

impl MapCompiler {
    pub fn new(options: MapCompilerOptions) -> Self {
        Self {
            options,
            module: None,
            storage: HashMap::new(),
            state: Vec::new(),
            current: None,
            context: None,
            global_count: 0,
        }
    }

    pub fn options(&self) -> &MapCompilerOptions {
        &self.options
    }

    /// Compiles `map`. Every call produces a fresh compiled map from the
    /// map's current state; `map` itself is not modified.
    pub fn compile(&mut self, map: &Map) -> CompileResult<CompiledMap> {
        let mut map = map.clone();
        validate(&map)?;

        let optimizer = ModelOptimizer::from_options(&self.options.optimizer);
        map.refine(self.options.max_refine_iterations)?;
        if self.options.optimize {
            map.optimize(&optimizer)?;
            map.refine(self.options.max_refine_iterations)?;
            map.optimize(&optimizer)?;
        }
        map.rename_callbacks(&self.options.source_callback_name, &self.options.sink_callback_name);
        ensure_compilable(&mut map, self.options.max_refine_iterations)?;

        let sources = map.model().nodes_of_type::<SourceNode>();
        let sinks = map.model().nodes_of_type::<SinkNode>();
        if sources.len() > 1 || sinks.len() > 1 {
            return Err(CompileError::Unsupported(format!(
                "a compiled map supports one source and one sink (found {} and {})",
                sources.len(),
                sinks.len()
            )));
        }
        let source = sources
            .first()
            .and_then(|&k| map.model().node_as::<SourceNode>(k))
            .map(|s| CallbackSignature {
                symbol: self.options.symbol(s.callback_name()),
                port_type: s.output_type(),
                size: s.output_ports()[0].size,
            });
        let sink = sinks
            .first()
            .and_then(|&k| map.model().node_as::<SinkNode>(k))
            .map(|s| CallbackSignature {
                symbol: self.options.symbol(s.callback_name()),
                port_type: s.value_type(),
                size: s.input_ports()[0].size(),
            });

        log::info!(
            "compiling map '{}' with {} nodes",
            self.options.module_name,
            map.model().size()
        );

        self.module = Some(ModuleEmitter::new(&self.options.module_name, &self.options.opt_level)?);
        self.storage.clear();
        self.state.clear();
        self.current = None;
        self.context = None;
        self.global_count = 0;

        let inputs = signatures_of_inputs(&map)?;
        let outputs = signatures_of_outputs(&map)?;

        let prefix = self.options.module_name.clone();
        let mut profiler = if self.options.profile {
            Some(ModelProfiler::new(self.module_mut()?, &prefix)?)
        } else {
            None
        };

        let predict = self.declare_predict(&inputs, &outputs)?;
        let node_count = self.emit_predict(&map, predict, profiler.as_mut())?;
        self.emit_predict_packed(predict, inputs.len(), outputs.len())?;
        self.emit_reset()?;
        self.emit_model_api(&map, node_count)?;

        let mut module = self
            .module
            .take()
            .ok_or_else(|| CompileError::Jit("module missing after emission".into()))?;
        module.add_header_comment(format!("{} nodes, {} inputs, {} outputs", node_count, inputs.len(), outputs.len()));
        log::debug!(
            "emitted '{}': {} nodes, {} state globals, profiling {}",
            self.options.module_name,
            node_count,
            self.state.len(),
            if profiler.is_some() { "on" } else { "off" }
        );

        Ok(CompiledMap::new(
            module,
            self.options.module_name.clone(),
            inputs,
            outputs,
            source,
            sink,
            self.options.profile,
            node_count,
        ))
    }

    pub fn module(&self) -> CompileResult<&ModuleEmitter> {
        self.module
            .as_ref()
            .ok_or_else(|| CompileError::Jit("no module is being emitted".into()))
    }

    pub fn module_mut(&mut self) -> CompileResult<&mut ModuleEmitter> {
        self.module
            .as_mut()
            .ok_or_else(|| CompileError::Jit("no module is being emitted".into()))
    }

    /// Id of the node being emitted.
    pub fn current_node_id(&self) -> CompileResult<NodeId> {
        self.current
            .as_ref()
            .map(|c| c.id)
            .ok_or_else(|| CompileError::Jit("no node is being emitted".into()))
    }

    fn current(&self) -> CompileResult<&CurrentNode> {
        self.current
            .as_ref()
            .ok_or_else(|| CompileError::Jit("no node is being emitted".into()))
    }

    /// The callback context pointer handed to predict.
    pub fn context_pointer(&self) -> CompileResult<Value> {
        self.context
            .ok_or_else(|| CompileError::Jit("callback context used outside predict".into()))
    }

    fn storage_address(&self, function: &mut FunctionEmitter, storage: PortStorage) -> Value {
        match storage {
            PortStorage::Argument(value) => value,
            PortStorage::Stack(slot) => function.stack_address(slot, 0),
            PortStorage::Global(handle) => function.data_address(handle),
        }
    }

    fn range_address(&self, function: &mut FunctionEmitter, range: &PortRange) -> CompileResult<Value> {
        let storage = *self.storage.get(&(range.node, range.output)).ok_or_else(|| {
            CompileError::Jit(format!("output #{} of {:?} read before it was emitted", range.output, range.node))
        })?;
        let base = self.storage_address(function, storage);
        if range.start == 0 {
            return Ok(base);
        }
        let offset = (range.start * range.port_type.byte_size()) as i64;
        Ok(function.ins().iadd_imm(base, offset))
    }

    /// Address of a buffer holding `elements` contiguously. A single range is
    /// read in place; anything else is gathered into a stack copy.
    pub fn input_address(&self, function: &mut FunctionEmitter, elements: &PortElements) -> CompileResult<Value> {
        if let Some(range) = elements.as_single_range() {
            return self.range_address(function, range);
        }
        let port_type = elements.port_type();
        let slot = function.stack_buffer(elements.size() * port_type.byte_size())?;
        let buffer = function.stack_address(slot, 0);
        let mut offset = 0usize;
        for range in elements.ranges() {
            let source = self.range_address(function, range)?;
            let destination = if offset == 0 {
                buffer
            } else {
                function.ins().iadd_imm(buffer, (offset * port_type.byte_size()) as i64)
            };
            function.copy_elements(port_type, destination, source, range.count)?;
            offset += range.count;
        }
        Ok(buffer)
    }

    /// Loads element `index` of `elements`.
    pub fn load_input(&self, function: &mut FunctionEmitter, elements: &PortElements, index: usize) -> CompileResult<Value> {
        let element = elements.element(index)?;
        let range = element
            .as_single_range()
            .ok_or_else(|| CompileError::Jit("element selection spans ranges".into()))?;
        let base = self.range_address(function, range)?;
        Ok(function.load(range.port_type, base, 0))
    }

    /// Address of output `output` of the node being emitted.
    pub fn output_address(&self, function: &mut FunctionEmitter, output: usize) -> CompileResult<Value> {
        let current = self.current()?;
        let storage = *self
            .storage
            .get(&(current.key, output))
            .ok_or_else(|| CompileError::Jit(format!("node {} has no output #{}", current.id, output)))?;
        Ok(self.storage_address(function, storage))
    }

    /// Stores `value` as element `index` of output `output`.
    pub fn store_output(
        &self,
        function: &mut FunctionEmitter,
        output: usize,
        index: usize,
        value: Value,
    ) -> CompileResult<()> {
        let (port_type, _) = *self
            .current()?
            .outputs
            .get(output)
            .ok_or_else(|| CompileError::Jit(format!("no output #{}", output)))?;
        let base = self.output_address(function, output)?;
        let offset = FunctionEmitter::element_offset(port_type, index)?;
        function.store(value, base, offset);
        Ok(())
    }

    fn global_name(&mut self, suffix: &str) -> CompileResult<String> {
        let id = self.current_node_id()?;
        self.global_count += 1;
        Ok(format!("{}_n{}_{}", self.options.module_name, id, suffix))
    }

    /// Read-only global holding `values`, e.g. weights.
    pub fn global_constant(&mut self, suffix: &str, values: &PortValues) -> CompileResult<DataHandle> {
        let name = self.global_name(suffix)?;
        let align = values.port_type().byte_size() as u64;
        Ok(self
            .module_mut()?
            .add_data(&name, false, DataDefinition::bytes(values.to_bytes(), align))?)
    }

    /// Writable global holding node state; `{m}_Reset` restores `initial`.
    pub fn state_global(&mut self, suffix: &str, initial: &PortValues) -> CompileResult<DataHandle> {
        let name = self.global_name(suffix)?;
        let align = initial.port_type().byte_size().max(8) as u64;
        let module = self.module_mut()?;
        let state = module.add_data(&name, true, DataDefinition::bytes(initial.to_bytes(), align))?;
        let initial_data = module.add_data(
            &format!("{}_init", name),
            false,
            DataDefinition::bytes(initial.to_bytes(), align),
        )?;
        self.state.push(StateGlobal {
            state,
            initial: initial_data,
            port_type: initial.port_type(),
            size: initial.len(),
        });
        Ok(state)
    }

    /// Declares a host callback under its module-qualified name.
    pub fn declare_callback(&mut self, name: &str, returns: CType, params: Vec<(&str, CType)>) -> CompileResult<FunctionHandle> {
        let mut decl = FunctionDecl::new(self.options.symbol(name), returns);
        for (param, ty) in params {
            decl = decl.param(param, ty);
        }
        Ok(self.module_mut()?.declare_callback(decl)?)
    }

    fn declare_predict(&mut self, inputs: &[PortSignature], outputs: &[PortSignature]) -> CompileResult<FunctionHandle> {
        let mut decl = FunctionDecl::new(self.options.symbol("Predict"), CType::Void).param("context", CType::void_ptr());
        for (index, input) in inputs.iter().enumerate() {
            decl = decl.param(format!("input{}", index), CType::from_port_type(input.port_type).const_ptr());
        }
        for (index, output) in outputs.iter().enumerate() {
            decl = decl.param(format!("output{}", index), CType::from_port_type(output.port_type).ptr());
        }
        Ok(self.module_mut()?.declare_function(decl, Linkage::Export, true)?)
    }

    fn allocate_outputs(&mut self, function: &mut FunctionEmitter, key: NodeKey, node: &dyn Node) -> CompileResult<()> {
        for (index, port) in node.output_ports().iter().enumerate() {
            if self.storage.contains_key(&(key, index)) {
                continue;
            }
            let storage = if port.size <= 1 {
                PortStorage::Stack(function.stack_buffer(port.port_type.byte_size())?)
            } else {
                let name = self.global_name(&port.name)?;
                let bytes = port.size * port.port_type.byte_size();
                let handle = self.module_mut()?.add_data(&name, true, DataDefinition::zeroed(bytes, 8))?;
                PortStorage::Global(handle)
            };
            self.storage.insert((key, index), storage);
        }
        Ok(())
    }

    fn emit_predict(
        &mut self,
        map: &Map,
        predict: FunctionHandle,
        mut profiler: Option<&mut ModelProfiler>,
    ) -> CompileResult<usize> {
        let module = self.module()?;
        let mut body = module.new_function_body(predict);
        let pointer_type = module.pointer_type();
        let mut context = FunctionBuilderContext::new();
        let mut count = 0;
        {
            let mut function = FunctionEmitter::new(&mut body, &mut context, pointer_type);
            self.context = Some(function.param(0)?);
            for (index, (_, key)) in map.inputs().iter().enumerate() {
                let argument = function.param(1 + index)?;
                self.storage.insert((*key, 0), PortStorage::Argument(argument));
            }

            let model_timer = match profiler.as_deref_mut() {
                Some(p) => Some(p.begin_model(&mut function, self.module_mut()?)?),
                None => None,
            };

            for key in map.model().nodes()? {
                let entry = map.model().entry(key)?;
                let node = entry.node.as_ref();
                self.current = Some(CurrentNode {
                    key,
                    id: entry.id,
                    outputs: node.output_ports().iter().map(|p| (p.port_type, p.size)).collect(),
                });
                self.allocate_outputs(&mut function, key, node)?;

                let timer = match profiler.as_deref_mut() {
                    Some(p) => Some(p.begin_node(&mut function, self.module_mut()?, key, entry.id, &node.type_name())?),
                    None => None,
                };
                log::trace!("emitting {} ({})", node.type_name(), entry.id);
                node.compile(self, &mut function)?;
                if let (Some(p), Some(timer)) = (profiler.as_deref_mut(), timer) {
                    p.end_node(&mut function, self.module_mut()?, timer)?;
                }
                count += 1;
            }
            self.current = None;

            for (index, (_, elements)) in map.outputs().iter().enumerate() {
                let destination = function.param(1 + map.num_inputs() + index)?;
                let mut offset = 0usize;
                for range in elements.ranges() {
                    let source = self.range_address(&mut function, range)?;
                    let target = if offset == 0 {
                        destination
                    } else {
                        function
                            .ins()
                            .iadd_imm(destination, (offset * range.port_type.byte_size()) as i64)
                    };
                    function.copy_elements(range.port_type, target, source, range.count)?;
                    offset += range.count;
                }
            }

            if let (Some(p), Some(timer)) = (profiler, model_timer) {
                p.end_model(&mut function, self.module_mut()?, timer)?;
            }
            function.return_values(&[]);
            function.finish();
        }
        self.context = None;
        self.module_mut()?.define_function(predict, body)?;
        Ok(count)
    }

    /// `{m}_PredictPacked(context, inputs, outputs)` unpacks pointer arrays
    /// and calls predict, giving the host one fixed signature.
    fn emit_predict_packed(&mut self, predict: FunctionHandle, inputs: usize, outputs: usize) -> CompileResult<()> {
        let decl = FunctionDecl::new(self.options.symbol("PredictPacked"), CType::Void)
            .param("context", CType::void_ptr())
            .param("inputs", CType::void_ptr().const_ptr())
            .param("outputs", CType::void_ptr().ptr());
        let module = self.module_mut()?;
        let handle = module.declare_function(decl, Linkage::Export, false)?;
        let mut body = module.new_function_body(handle);
        let pointer_type = module.pointer_type();
        let pointer_bytes = pointer_type.bytes() as i32;
        let mut context = FunctionBuilderContext::new();
        {
            let mut f = FunctionEmitter::new(&mut body, &mut context, pointer_type);
            let mut args = vec![f.param(0)?];
            let input_array = f.param(1)?;
            let output_array = f.param(2)?;
            for i in 0..inputs {
                args.push(f.load_type(pointer_type, input_array, i as i32 * pointer_bytes));
            }
            for i in 0..outputs {
                args.push(f.load_type(pointer_type, output_array, i as i32 * pointer_bytes));
            }
            f.call(module, predict, &args);
            f.return_values(&[]);
            f.finish();
        }
        module.define_function(handle, body)?;
        Ok(())
    }

    /// `{m}_Reset()` copies every state global's initial image back.
    fn emit_reset(&mut self) -> CompileResult<()> {
        let state = self.state.clone();
        let decl = FunctionDecl::new(self.options.symbol("Reset"), CType::Void);
        let module = self.module_mut()?;
        let handle = module.declare_function(decl, Linkage::Export, true)?;
        let mut body = module.new_function_body(handle);
        let mut context = FunctionBuilderContext::new();
        {
            let mut f = FunctionEmitter::new(&mut body, &mut context, module.pointer_type());
            for global in &state {
                let destination = f.data_address(global.state);
                let source = f.data_address(global.initial);
                f.copy_elements(global.port_type, destination, source, global.size)?;
            }
            f.return_values(&[]);
            f.finish();
        }
        module.define_function(handle, body)?;
        Ok(())
    }

    /// Size, shape and node-count queries.
    fn emit_model_api(&mut self, map: &Map, node_count: usize) -> CompileResult<()> {
        let prefix = self.options.module_name.clone();
        let input_shapes = (0..map.num_inputs())
            .map(|i| map.data_input_shape(i))
            .collect::<Result<Vec<_>, _>>()?;
        let output_shapes = (0..map.num_outputs())
            .map(|i| map.output_shape(i))
            .collect::<Result<Vec<_>, _>>()?;
        let module = self.module_mut()?;
        module.add_struct(StructDecl::new(
            "TensorShape",
            vec![("rows", CType::Int32), ("columns", CType::Int32), ("channels", CType::Int32)],
        ));

        let first_size = |shapes: &[TensorShape]| shapes.first().map(|s| s.size()).unwrap_or(0);
        emit_constant_i32(module, &format!("{}_GetInputSize", prefix), first_size(&input_shapes))?;
        emit_constant_i32(module, &format!("{}_GetOutputSize", prefix), first_size(&output_shapes))?;
        emit_constant_i32(module, &format!("{}_GetNumNodes", prefix), node_count)?;
        emit_shape_lookup(module, &prefix, "Input", &input_shapes)?;
        emit_shape_lookup(module, &prefix, "Output", &output_shapes)?;
        Ok(())
    }
}

impl Default for MapCompiler {
    fn default() -> Self {
        Self::new(MapCompilerOptions::default())
    }
}

fn validate(map: &Map) -> CompileResult<()> {
    if map.num_outputs() == 0 {
        return Err(CompileError::Unsupported("map has no outputs".into()));
    }
    for (name, key) in map.inputs() {
        if !map.model().contains(*key) {
            return Err(CompileError::Model(crate::error::ModelError::NodeNotFound(format!(
                "input '{}'",
                name
            ))));
        }
    }
    Ok(())
}

/// Refines nodes the backend cannot emit, one round at a time, until every
/// node is compilable. A round that changes nothing, or running out of
/// rounds, is fatal.
fn ensure_compilable(map: &mut Map, max_rounds: usize) -> CompileResult<()> {
    let mut rounds = 0;
    loop {
        let blocker = map
            .model()
            .insertion_order()
            .iter()
            .filter_map(|&k| map.model().node(k).ok())
            .find(|n| !n.is_compilable())
            .map(|n| n.type_name());
        let Some(type_name) = blocker else {
            return Ok(());
        };
        if rounds >= max_rounds.max(1) {
            log::warn!("'{}' still uncompilable after {} refinement rounds", type_name, rounds);
            return Err(CompileError::UncompilableNode(type_name));
        }
        rounds += 1;
        let changed = map.refine_where(&|n: &dyn Node| !n.is_compilable())?;
        if !changed {
            return Err(CompileError::UncompilableNode(type_name));
        }
        map.prune()?;
    }
}

fn signatures_of_inputs(map: &Map) -> CompileResult<Vec<PortSignature>> {
    map.inputs()
        .iter()
        .enumerate()
        .map(|(index, (name, _))| {
            Ok(PortSignature {
                name: name.clone(),
                port_type: map.input_type(index)?,
                size: map.input_size(index)?,
            })
        })
        .collect()
}

fn signatures_of_outputs(map: &Map) -> CompileResult<Vec<PortSignature>> {
    map.outputs()
        .iter()
        .map(|(name, elements)| {
            Ok(PortSignature {
                name: name.clone(),
                port_type: elements.port_type(),
                size: elements.size(),
            })
        })
        .collect()
}

fn emit_constant_i32(module: &mut ModuleEmitter, name: &str, value: usize) -> CompileResult<()> {
    let handle = module.declare_function(FunctionDecl::new(name, CType::Int32), Linkage::Export, true)?;
    let mut body = module.new_function_body(handle);
    let mut context = FunctionBuilderContext::new();
    {
        let mut f = FunctionEmitter::new(&mut body, &mut context, module.pointer_type());
        let result = f.int_const(types::I32, value as i64);
        f.return_values(&[result]);
        f.finish();
    }
    module.define_function(handle, body)?;
    Ok(())
}

/// `{m}_Get{kind}Shape(index, shape)` copies row `index` of a shape table
/// into `shape`; out-of-range indices leave `shape` untouched.
fn emit_shape_lookup(module: &mut ModuleEmitter, prefix: &str, kind: &str, shapes: &[TensorShape]) -> CompileResult<()> {
    let mut table = Vec::with_capacity(shapes.len() * std::mem::size_of::<CTensorShape>());
    for shape in shapes {
        for dimension in [shape.rows, shape.columns, shape.channels] {
            let dimension = i32::try_from(dimension)
                .map_err(|_| CompileError::Unsupported(format!("dimension {} exceeds 32 bits", dimension)))?;
            table.extend_from_slice(&dimension.to_ne_bytes());
        }
    }
    if table.is_empty() {
        table.resize(std::mem::size_of::<CTensorShape>(), 0);
    }
    let table_handle = module.add_data(&format!("{}_{}Shapes", prefix, kind), false, DataDefinition::bytes(table, 4))?;
    let decl = FunctionDecl::new(format!("{}_Get{}Shape", prefix, kind), CType::Void)
        .param("index", CType::Int32)
        .param("shape", CType::Named("TensorShape".into()).ptr());
    let handle = module.declare_function(decl, Linkage::Export, true)?;
    let mut body = module.new_function_body(handle);
    let mut context = FunctionBuilderContext::new();
    let count = shapes.len();
    {
        let mut f = FunctionEmitter::new(&mut body, &mut context, module.pointer_type());
        let index = f.param(0)?;
        let shape = f.param(1)?;
        let zero = f.int_const(types::I32, 0);
        let limit = f.int_const(types::I32, count as i64);
        let not_negative = f.compare(crate::emitters::Comparison::GreaterOrEqual, PortType::Integer, index, zero);
        let below = f.compare(crate::emitters::Comparison::Less, PortType::Integer, index, limit);
        let valid = f.ins().band(not_negative, below);
        f.if_then(valid, |f| {
            let pointer_type = f.pointer_type();
            let base = f.data_address(table_handle);
            let wide = f.ins().sextend(pointer_type, index);
            let row_offset = f.ins().imul_imm(wide, std::mem::size_of::<CTensorShape>() as i64);
            let row = f.ins().iadd(base, row_offset);
            f.copy_elements(PortType::Integer, shape, row, 3)
        })?;
        f.return_values(&[]);
        f.finish();
    }
    module.define_function(handle, body)?;
    Ok(())
}
