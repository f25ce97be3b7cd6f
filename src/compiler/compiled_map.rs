//! Executable form of a compiled map.
//!
//! The emitted module is kept as data; the JIT execution engine is built on
//! first use and lives as long as the compiled map.

use std::ffi::c_void;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use cranelift_jit::JITModule;
use cranelift_module::FuncId;
use once_cell::sync::OnceCell;

use super::callbacks::{sink_trampoline, source_trampoline, CallbackContext, CallbackElement};
use crate::emitters::runtime::{intrinsic_symbols, read_name, CTensorShape, NodeInfo, PerformanceCounters, ProfileRegionInfo};
use crate::emitters::{writers, ModuleEmitter, ModuleOutputFormat};
use crate::error::{CompileError, CompileResult, ModelError};
use crate::model::{Element, PortType, PortValues, TensorShape};

/// Type and size of one predict argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSignature {
    pub name: String,
    pub port_type: PortType,
    pub size: usize,
}

/// A host callback the compiled code calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackSignature {
    pub symbol: String,
    pub port_type: PortType,
    pub size: usize,
}

/// Count and cumulative milliseconds of one profiled region, node or node type.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRecord {
    pub name: String,
    pub node_type: Option<String>,
    pub count: i64,
    pub total_time: f64,
}

type PackedPredictFn = unsafe extern "C" fn(*mut c_void, *const *const u8, *const *mut u8);
type VoidFn = unsafe extern "C" fn();
type CountFn = unsafe extern "C" fn() -> i32;
type ShapeFn = unsafe extern "C" fn(i32, *mut CTensorShape);
type RegionFn = unsafe extern "C" fn(i32) -> *const ProfileRegionInfo;
type CountersFn = unsafe extern "C" fn() -> *const PerformanceCounters;
type IndexedCountersFn = unsafe extern "C" fn(i32) -> *const PerformanceCounters;
type NodeInfoFn = unsafe extern "C" fn(i32) -> *const NodeInfo;

struct ProfilingFns {
    num_regions: CountFn,
    region_info: RegionFn,
    reset_regions: VoidFn,
    model_counters: CountersFn,
    reset_model: VoidFn,
    node_info: NodeInfoFn,
    node_counters: IndexedCountersFn,
    reset_nodes: VoidFn,
    num_node_types: CountFn,
    node_type_info: NodeInfoFn,
    node_type_counters: IndexedCountersFn,
    reset_node_types: VoidFn,
}

struct ExecutionEngine {
    _module: JITModule,
    predict: PackedPredictFn,
    reset: VoidFn,
    input_size: CountFn,
    output_size: CountFn,
    num_nodes: CountFn,
    input_shape: ShapeFn,
    output_shape: ShapeFn,
    profiling: Option<ProfilingFns>,
}

/// A map compiled to native code.
pub struct CompiledMap {
    module: ModuleEmitter,
    name: String,
    inputs: Vec<PortSignature>,
    outputs: Vec<PortSignature>,
    source: Option<CallbackSignature>,
    sink: Option<CallbackSignature>,
    profiling: bool,
    node_count: usize,
    engine: OnceCell<ExecutionEngine>,
    context: Box<CallbackContext>,
    input_values: Vec<PortValues>,
    output_values: Vec<PortValues>,
}

impl std::fmt::Debug for CompiledMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledMap")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("source", &self.source)
            .field("sink", &self.sink)
            .field("profiling", &self.profiling)
            .field("jitted", &self.engine.get().is_some())
            .finish()
    }
}

impl CompiledMap {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        module: ModuleEmitter,
        name: String,
        inputs: Vec<PortSignature>,
        outputs: Vec<PortSignature>,
        source: Option<CallbackSignature>,
        sink: Option<CallbackSignature>,
        profiling: bool,
        node_count: usize,
    ) -> Self {
        let context = Box::new(CallbackContext::new(
            source.as_ref().map_or(0, |s| s.size),
            sink.as_ref().map_or(0, |s| s.size),
        ));
        let input_values = inputs.iter().map(|p| PortValues::zeros(p.port_type, p.size)).collect();
        let output_values = outputs.iter().map(|p| PortValues::zeros(p.port_type, p.size)).collect();
        Self {
            module,
            name,
            inputs,
            outputs,
            source,
            sink,
            profiling,
            node_count,
            engine: OnceCell::new(),
            context,
            input_values,
            output_values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &ModuleEmitter {
        &self.module
    }

    pub fn inputs(&self) -> &[PortSignature] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortSignature] {
        &self.outputs
    }

    pub fn num_nodes(&self) -> usize {
        self.node_count
    }

    pub fn is_profiling(&self) -> bool {
        self.profiling
    }

    pub fn is_jitted(&self) -> bool {
        self.engine.get().is_some()
    }

    fn symbol(&self, name: &str) -> String {
        format!("{}_{}", self.name, name)
    }

    fn engine(&self) -> CompileResult<&ExecutionEngine> {
        self.engine.get_or_try_init(|| self.build_engine())
    }

    fn build_engine(&self) -> CompileResult<ExecutionEngine> {
        let mut symbols: Vec<(String, *const u8)> = intrinsic_symbols()
            .into_iter()
            .map(|(name, address)| (name.to_string(), address))
            .collect();
        if let Some(source) = &self.source {
            let address = source_trampoline(source.port_type).ok_or_else(|| {
                CompileError::Unsupported(format!("source callbacks of type {}", source.port_type))
            })?;
            symbols.push((source.symbol.clone(), address));
        }
        if let Some(sink) = &self.sink {
            let address = sink_trampoline(sink.port_type)
                .ok_or_else(|| CompileError::Unsupported(format!("sink callbacks of type {}", sink.port_type)))?;
            symbols.push((sink.symbol.clone(), address));
        }

        let (module, func_ids, _) = self.module.jit(&symbols)?;
        log::debug!("jitted '{}' ({} functions)", self.name, func_ids.len());
        let lookup = |name: &str| -> CompileResult<*const u8> {
            let handle = self.module.function(&self.symbol(name))?;
            let id: FuncId = func_ids[handle.0 as usize];
            Ok(module.get_finalized_function(id))
        };

        // SAFETY: each symbol was emitted with exactly the signature its
        // pointer type spells out.
        unsafe {
            let profiling = if self.profiling {
                Some(ProfilingFns {
                    num_regions: std::mem::transmute::<*const u8, CountFn>(lookup("GetNumProfileRegions")?),
                    region_info: std::mem::transmute::<*const u8, RegionFn>(lookup("GetRegionProfilingInfo")?),
                    reset_regions: std::mem::transmute::<*const u8, VoidFn>(lookup("ResetRegionProfilingInfo")?),
                    model_counters: std::mem::transmute::<*const u8, CountersFn>(
                        lookup("GetModelPerformanceCounters")?,
                    ),
                    reset_model: std::mem::transmute::<*const u8, VoidFn>(lookup("ResetModelProfilingInfo")?),
                    node_info: std::mem::transmute::<*const u8, NodeInfoFn>(lookup("GetNodeInfo")?),
                    node_counters: std::mem::transmute::<*const u8, IndexedCountersFn>(
                        lookup("GetNodePerformanceCounters")?,
                    ),
                    reset_nodes: std::mem::transmute::<*const u8, VoidFn>(lookup("ResetNodeProfilingInfo")?),
                    num_node_types: std::mem::transmute::<*const u8, CountFn>(lookup("GetNumNodeTypes")?),
                    node_type_info: std::mem::transmute::<*const u8, NodeInfoFn>(lookup("GetNodeTypeInfo")?),
                    node_type_counters: std::mem::transmute::<*const u8, IndexedCountersFn>(
                        lookup("GetNodeTypePerformanceCounters")?,
                    ),
                    reset_node_types: std::mem::transmute::<*const u8, VoidFn>(
                        lookup("ResetNodeTypeProfilingInfo")?,
                    ),
                })
            } else {
                None
            };
            Ok(ExecutionEngine {
                predict: std::mem::transmute::<*const u8, PackedPredictFn>(lookup("PredictPacked")?),
                reset: std::mem::transmute::<*const u8, VoidFn>(lookup("Reset")?),
                input_size: std::mem::transmute::<*const u8, CountFn>(lookup("GetInputSize")?),
                output_size: std::mem::transmute::<*const u8, CountFn>(lookup("GetOutputSize")?),
                num_nodes: std::mem::transmute::<*const u8, CountFn>(lookup("GetNumNodes")?),
                input_shape: std::mem::transmute::<*const u8, ShapeFn>(lookup("GetInputShape")?),
                output_shape: std::mem::transmute::<*const u8, ShapeFn>(lookup("GetOutputShape")?),
                profiling,
                _module: module,
            })
        }
    }

    /// Builds the execution engine now instead of on first use.
    pub fn ensure_execution_engine(&self) -> CompileResult<()> {
        self.engine().map(|_| ())
    }

    /// Stages values for input `index`. The element type must match exactly.
    pub fn set_input_value(&mut self, index: usize, values: PortValues) -> CompileResult<()> {
        let signature = self
            .inputs
            .get(index)
            .ok_or_else(|| ModelError::OutOfRange(format!("input #{} of {}", index, self.inputs.len())))?;
        if values.port_type() != signature.port_type {
            return Err(CompileError::InputTypeMismatch {
                expected: signature.port_type,
                found: values.port_type(),
            });
        }
        if values.len() != signature.size {
            return Err(ModelError::InvalidArgument(format!(
                "input '{}' takes {} values, got {}",
                signature.name,
                signature.size,
                values.len()
            ))
            .into());
        }
        self.input_values[index] = values;
        Ok(())
    }

    /// Runs predict once on the staged inputs.
    pub fn predict(&mut self) -> CompileResult<()> {
        let predict = self.engine()?.predict;
        let inputs: Vec<*const u8> = self.input_values.iter().map(const_data_ptr).collect();
        let outputs: Vec<*mut u8> = self.output_values.iter_mut().map(mut_data_ptr).collect();
        let context = self.context.as_ptr();
        // SAFETY: staged buffers match the emitted signature in type and size.
        unsafe { predict(context, inputs.as_ptr(), outputs.as_ptr()) };
        Ok(())
    }

    /// Runs predict and returns output `index`.
    pub fn compute_output(&mut self, index: usize) -> CompileResult<PortValues> {
        if index >= self.outputs.len() {
            return Err(ModelError::OutOfRange(format!("output #{} of {}", index, self.outputs.len())).into());
        }
        self.predict()?;
        Ok(self.output_values[index].clone())
    }

    /// Single-input, single-output convenience: converts `input` to the
    /// input type, runs predict and converts output 0 to `O`.
    pub fn compute<I: Element, O: Element>(&mut self, input: &[I]) -> CompileResult<Vec<O>> {
        let port_type = self
            .inputs
            .first()
            .map(|p| p.port_type)
            .ok_or_else(|| ModelError::InvalidArgument("map has no inputs".into()))?;
        self.set_input_value(0, I::wrap(input.to_vec()).convert(port_type))?;
        let output = self.compute_output(0)?;
        output
            .convert(O::PORT_TYPE)
            .as_slice::<O>()
            .map(<[O]>::to_vec)
            .ok_or_else(|| ModelError::InvalidArgument("output conversion failed".into()).into())
    }

    /// Restores every stateful node to its initial state.
    pub fn reset(&mut self) -> CompileResult<()> {
        let reset = self.engine()?.reset;
        unsafe { reset() };
        Ok(())
    }

    /// Installs the closure the compiled source node calls for input.
    pub fn set_source_callback<T, F>(&mut self, callback: F) -> CompileResult<()>
    where
        T: CallbackElement,
        F: FnMut(&mut [T]) -> bool + Send + 'static,
    {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| CompileError::Unsupported("map has no source node".into()))?;
        if source.port_type != T::PORT_TYPE {
            return Err(ModelError::TypeMismatch {
                expected: source.port_type,
                found: T::PORT_TYPE,
            }
            .into());
        }
        self.context.set_source::<T>(Box::new(callback));
        Ok(())
    }

    /// Installs the closure the compiled sink node calls with its values.
    pub fn set_sink_callback<T, F>(&mut self, callback: F) -> CompileResult<()>
    where
        T: CallbackElement,
        F: FnMut(&[T]) + Send + 'static,
    {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| CompileError::Unsupported("map has no sink node".into()))?;
        if sink.port_type != T::PORT_TYPE {
            return Err(ModelError::TypeMismatch {
                expected: sink.port_type,
                found: T::PORT_TYPE,
            }
            .into());
        }
        self.context.set_sink::<T>(Box::new(callback));
        Ok(())
    }

    /// Sizes and shapes as the compiled model API reports them.
    pub fn compiled_input_size(&self) -> CompileResult<usize> {
        let f = self.engine()?.input_size;
        Ok(unsafe { f() }.max(0) as usize)
    }

    pub fn compiled_output_size(&self) -> CompileResult<usize> {
        let f = self.engine()?.output_size;
        Ok(unsafe { f() }.max(0) as usize)
    }

    pub fn compiled_num_nodes(&self) -> CompileResult<usize> {
        let f = self.engine()?.num_nodes;
        Ok(unsafe { f() }.max(0) as usize)
    }

    /// Shape of input `index`; `None` past the last input.
    pub fn compiled_input_shape(&self, index: usize) -> CompileResult<Option<TensorShape>> {
        let f = self.engine()?.input_shape;
        Ok(query_shape(f, index, self.inputs.len()))
    }

    pub fn compiled_output_shape(&self, index: usize) -> CompileResult<Option<TensorShape>> {
        let f = self.engine()?.output_shape;
        Ok(query_shape(f, index, self.outputs.len()))
    }

    /// Writes the module in `format`.
    pub fn write_code_to<W: Write>(&self, writer: W, format: ModuleOutputFormat) -> CompileResult<()> {
        writers::write_module(&self.module, format, writer)?;
        Ok(())
    }

    /// Writes the module to `path` in `format`.
    pub fn write_code(&self, path: impl AsRef<Path>, format: ModuleOutputFormat) -> CompileResult<()> {
        let file = File::create(path.as_ref())?;
        self.write_code_to(BufWriter::new(file), format)
    }

    pub fn c_header(&self) -> String {
        writers::c_header(&self.module)
    }

    pub fn ir_text(&self) -> String {
        writers::ir_text(&self.module)
    }

    fn profiling_fns(&self) -> CompileResult<&ProfilingFns> {
        self.engine()?
            .profiling
            .as_ref()
            .ok_or_else(|| CompileError::Unsupported("map was compiled without profiling".into()))
    }

    pub fn region_count(&self) -> CompileResult<usize> {
        let fns = self.profiling_fns()?;
        Ok(unsafe { (fns.num_regions)() }.max(0) as usize)
    }

    pub fn region_info(&self, index: usize) -> CompileResult<Option<ProfileRecord>> {
        let fns = self.profiling_fns()?;
        let Ok(index) = i32::try_from(index) else {
            return Ok(None);
        };
        // SAFETY: the accessor returns null or a record inside its table.
        Ok(unsafe {
            (fns.region_info)(index).as_ref().map(|r| ProfileRecord {
                name: read_name(r.name),
                node_type: None,
                count: r.count,
                total_time: r.total_time,
            })
        })
    }

    /// Counters of the whole predict call.
    pub fn model_counters(&self) -> CompileResult<PerformanceCounters> {
        let fns = self.profiling_fns()?;
        Ok(unsafe { (fns.model_counters)().as_ref().copied().unwrap_or_default() })
    }

    /// Per-node records, in emission order.
    pub fn node_records(&self) -> CompileResult<Vec<ProfileRecord>> {
        let fns = self.profiling_fns()?;
        let count = unsafe { (fns.num_regions)() };
        let mut records = Vec::new();
        for index in 0..count {
            // SAFETY: indices below the region count address valid records.
            unsafe {
                let (Some(info), Some(counters)) = ((fns.node_info)(index).as_ref(), (fns.node_counters)(index).as_ref())
                else {
                    continue;
                };
                if info.node_type.is_null() {
                    continue;
                }
                records.push(ProfileRecord {
                    name: read_name(info.node_name),
                    node_type: Some(read_name(info.node_type)),
                    count: counters.count,
                    total_time: counters.total_time,
                });
            }
        }
        Ok(records)
    }

    /// Per-node-type records, in order of first emission.
    pub fn node_type_records(&self) -> CompileResult<Vec<ProfileRecord>> {
        let fns = self.profiling_fns()?;
        let count = unsafe { (fns.num_node_types)() };
        let mut records = Vec::new();
        for index in 0..count {
            // SAFETY: indices below the type count address valid records.
            unsafe {
                let (Some(info), Some(counters)) =
                    ((fns.node_type_info)(index).as_ref(), (fns.node_type_counters)(index).as_ref())
                else {
                    continue;
                };
                records.push(ProfileRecord {
                    name: read_name(info.node_name),
                    node_type: Some(read_name(info.node_type)),
                    count: counters.count,
                    total_time: counters.total_time,
                });
            }
        }
        Ok(records)
    }

    /// Zeroes the region counters only.
    pub fn reset_region_counts(&self) -> CompileResult<()> {
        let fns = self.profiling_fns()?;
        unsafe { (fns.reset_regions)() };
        Ok(())
    }

    /// Zeroes every profiling counter.
    pub fn reset_profiling(&self) -> CompileResult<()> {
        let fns = self.profiling_fns()?;
        unsafe {
            (fns.reset_regions)();
            (fns.reset_model)();
            (fns.reset_nodes)();
            (fns.reset_node_types)();
        }
        Ok(())
    }
}

fn query_shape(f: ShapeFn, index: usize, count: usize) -> Option<TensorShape> {
    if index >= count {
        return None;
    }
    let index = i32::try_from(index).ok()?;
    let mut shape = CTensorShape::default();
    // SAFETY: the accessor writes at most one record into `shape`.
    unsafe { f(index, &mut shape) };
    Some(TensorShape::new(
        shape.rows.max(0) as usize,
        shape.columns.max(0) as usize,
        shape.channels.max(0) as usize,
    ))
}

fn const_data_ptr(values: &PortValues) -> *const u8 {
    match values {
        PortValues::Boolean(v) => v.as_ptr() as *const u8,
        PortValues::Integer(v) => v.as_ptr() as *const u8,
        PortValues::BigInt(v) => v.as_ptr() as *const u8,
        PortValues::SmallReal(v) => v.as_ptr() as *const u8,
        PortValues::Real(v) => v.as_ptr() as *const u8,
    }
}

fn mut_data_ptr(values: &mut PortValues) -> *mut u8 {
    match values {
        PortValues::Boolean(v) => v.as_mut_ptr() as *mut u8,
        PortValues::Integer(v) => v.as_mut_ptr() as *mut u8,
        PortValues::BigInt(v) => v.as_mut_ptr() as *mut u8,
        PortValues::SmallReal(v) => v.as_mut_ptr() as *mut u8,
        PortValues::Real(v) => v.as_mut_ptr() as *mut u8,
    }
}
