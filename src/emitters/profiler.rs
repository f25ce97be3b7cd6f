//! Profiling instrumentation woven into emitted code.
//!
//! Regions live in an arena addressed by stable index. Every region added
//! bumps a generation counter and rewrites the region table and the accessor
//! functions under their existing handles, so an accessor resolved before the
//! region was added keeps its identity.

use std::collections::HashSet;

use cranelift::prelude::*;
use cranelift_module::Linkage;

use super::function::{Comparison, FunctionEmitter};
use super::module::{DataDefinition, DataHandle, FunctionHandle, ModuleEmitter};
use super::runtime::{COUNTERS_STRIDE, NODE_INFO_STRIDE, PROFILE_REGION_STRIDE};
use super::types::{CType, FunctionDecl, StructDecl};
use crate::error::{EmitterError, EmitterResult};
use crate::model::PortType;

/// Index of a region in the profiler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(pub usize);

#[derive(Debug, Clone)]
struct Region {
    name: String,
    name_data: DataHandle,
    /// Index into the node-type table, for node regions.
    node_type: Option<usize>,
}

#[derive(Debug, Clone)]
struct NodeType {
    name_data: DataHandle,
}

#[derive(Debug, Clone, Copy)]
struct Accessors {
    num_regions: FunctionHandle,
    region_info: FunctionHandle,
    reset_regions: FunctionHandle,
    model_counters: FunctionHandle,
    reset_model: FunctionHandle,
    node_info: FunctionHandle,
    node_counters: FunctionHandle,
    reset_nodes: FunctionHandle,
    num_node_types: FunctionHandle,
    node_type_info: FunctionHandle,
    node_type_counters: FunctionHandle,
    reset_node_types: FunctionHandle,
}

#[derive(Debug, Clone, Copy)]
struct Tables {
    regions: DataHandle,
    model: DataHandle,
    node_types: DataHandle,
    node_info: DataHandle,
    node_type_info: DataHandle,
}

/// Opaque start time of an entered region.
#[derive(Debug, Clone, Copy)]
pub struct RegionTimer(Value);

/// Builds and maintains the profiling tables and accessors of one module.
#[derive(Debug, Clone)]
pub struct Profiler {
    prefix: String,
    regions: Vec<Region>,
    names: HashSet<String>,
    node_types: Vec<(String, NodeType)>,
    generation: u64,
    tables: Tables,
    accessors: Accessors,
}

impl Profiler {
    /// Declares the profiling tables and accessors and emits their initial,
    /// empty definitions.
    pub fn new(module: &mut ModuleEmitter, prefix: &str) -> EmitterResult<Self> {
        module.add_struct(StructDecl::new(
            "ProfileRegionInfo",
            vec![
                ("count", CType::Int64),
                ("totalTime", CType::Double),
                ("name", CType::Char.const_ptr()),
            ],
        ));
        module.add_struct(StructDecl::new(
            "PerformanceCounters",
            vec![("count", CType::Int64), ("totalTime", CType::Double)],
        ));
        module.add_struct(StructDecl::new(
            "NodeInfo",
            vec![
                ("nodeName", CType::Char.const_ptr()),
                ("nodeType", CType::Char.const_ptr()),
            ],
        ));

        let symbol = |name: &str| format!("{}_{}", prefix, name);
        let tables = Tables {
            regions: module.declare_data(&symbol("ProfileRegions"), true),
            model: module.declare_data(&symbol("ModelCounters"), true),
            node_types: module.declare_data(&symbol("NodeTypeCounters"), true),
            node_info: module.declare_data(&symbol("NodeInfoTable"), false),
            node_type_info: module.declare_data(&symbol("NodeTypeInfoTable"), false),
        };

        let region_ptr = CType::Named("ProfileRegionInfo".into()).ptr();
        let counters_ptr = CType::Named("PerformanceCounters".into()).ptr();
        let info_ptr = CType::Named("NodeInfo".into()).ptr();
        let mut export = |decl: FunctionDecl| module.declare_function(decl, Linkage::Export, true);
        let accessors = Accessors {
            num_regions: export(FunctionDecl::new(symbol("GetNumProfileRegions"), CType::Int32))?,
            region_info: export(
                FunctionDecl::new(symbol("GetRegionProfilingInfo"), region_ptr).param("regionIndex", CType::Int32),
            )?,
            reset_regions: export(FunctionDecl::new(symbol("ResetRegionProfilingInfo"), CType::Void))?,
            model_counters: export(FunctionDecl::new(symbol("GetModelPerformanceCounters"), counters_ptr.clone()))?,
            reset_model: export(FunctionDecl::new(symbol("ResetModelProfilingInfo"), CType::Void))?,
            node_info: export(
                FunctionDecl::new(symbol("GetNodeInfo"), info_ptr.clone()).param("nodeIndex", CType::Int32),
            )?,
            node_counters: export(
                FunctionDecl::new(symbol("GetNodePerformanceCounters"), counters_ptr.clone())
                    .param("nodeIndex", CType::Int32),
            )?,
            reset_nodes: export(FunctionDecl::new(symbol("ResetNodeProfilingInfo"), CType::Void))?,
            num_node_types: export(FunctionDecl::new(symbol("GetNumNodeTypes"), CType::Int32))?,
            node_type_info: export(
                FunctionDecl::new(symbol("GetNodeTypeInfo"), info_ptr).param("nodeTypeIndex", CType::Int32),
            )?,
            node_type_counters: export(
                FunctionDecl::new(symbol("GetNodeTypePerformanceCounters"), counters_ptr)
                    .param("nodeTypeIndex", CType::Int32),
            )?,
            reset_node_types: export(FunctionDecl::new(symbol("ResetNodeTypeProfilingInfo"), CType::Void))?,
        };

        let mut profiler = Self {
            prefix: prefix.to_string(),
            regions: Vec::new(),
            names: HashSet::new(),
            node_types: Vec::new(),
            generation: 0,
            tables,
            accessors,
        };
        profiler.rewrite(module)?;
        Ok(profiler)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn node_type_count(&self) -> usize {
        self.node_types.len()
    }

    /// Number of times the tables and accessors have been rebuilt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn region_name(&self, region: RegionHandle) -> Option<&str> {
        self.regions.get(region.0).map(|r| r.name.as_str())
    }

    /// Adds a named region. Names are unique per module.
    pub fn create_region(&mut self, module: &mut ModuleEmitter, name: &str) -> EmitterResult<RegionHandle> {
        self.add_region(module, name, None)
    }

    /// Adds a region for a node, counted under its node type as well.
    pub fn create_node_region(
        &mut self,
        module: &mut ModuleEmitter,
        name: &str,
        node_type: &str,
    ) -> EmitterResult<RegionHandle> {
        let type_index = match self.node_types.iter().position(|(n, _)| n == node_type) {
            Some(index) => index,
            None => {
                let data_name = format!("{}_node_type_name_{}", self.prefix, self.node_types.len());
                let name_data = module.add_string(&data_name, node_type)?;
                self.node_types.push((node_type.to_string(), NodeType { name_data }));
                self.node_types.len() - 1
            }
        };
        self.add_region(module, name, Some(type_index))
    }

    fn add_region(
        &mut self,
        module: &mut ModuleEmitter,
        name: &str,
        node_type: Option<usize>,
    ) -> EmitterResult<RegionHandle> {
        if !self.names.insert(name.to_string()) {
            return Err(EmitterError::DuplicateSymbol(name.to_string()));
        }
        let data_name = format!("{}_region_name_{}", self.prefix, self.regions.len());
        let name_data = module.add_string(&data_name, name)?;
        self.regions.push(Region {
            name: name.to_string(),
            name_data,
            node_type,
        });
        self.rewrite(module)?;
        Ok(RegionHandle(self.regions.len() - 1))
    }

    /// Emits the region entry: records the start time.
    pub fn enter_region(&self, function: &mut FunctionEmitter, module: &mut ModuleEmitter) -> EmitterResult<RegionTimer> {
        Ok(RegionTimer(function.now(module)?))
    }

    /// Emits the region exit: bumps the count and accumulates elapsed time,
    /// for the node type too when the region belongs to a node.
    pub fn exit_region(
        &self,
        function: &mut FunctionEmitter,
        module: &mut ModuleEmitter,
        region: RegionHandle,
        timer: RegionTimer,
    ) -> EmitterResult<()> {
        let entry = self
            .regions
            .get(region.0)
            .ok_or_else(|| EmitterError::UnknownSymbol(format!("profile region #{}", region.0)))?;
        let end = function.now(module)?;
        let elapsed = function.ins().fsub(end, timer.0);

        let table = function.data_address(self.tables.regions);
        accumulate(function, table, offset(region.0 * PROFILE_REGION_STRIDE)?, elapsed);
        if let Some(type_index) = entry.node_type {
            let types_table = function.data_address(self.tables.node_types);
            accumulate(function, types_table, offset(type_index * COUNTERS_STRIDE)?, elapsed);
        }
        Ok(())
    }

    /// Emits the exit of the whole-model timer.
    pub fn exit_model(&self, function: &mut FunctionEmitter, module: &mut ModuleEmitter, timer: RegionTimer) -> EmitterResult<()> {
        let end = function.now(module)?;
        let elapsed = function.ins().fsub(end, timer.0);
        let table = function.data_address(self.tables.model);
        accumulate(function, table, 0, elapsed);
        Ok(())
    }

    /// Rebuilds the tables and accessor bodies for the current regions.
    fn rewrite(&mut self, module: &mut ModuleEmitter) -> EmitterResult<()> {
        self.generation += 1;
        let pointer_bytes = module.pointer_type().bytes() as usize;

        let mut regions = DataDefinition::zeroed(self.regions.len().max(1) * PROFILE_REGION_STRIDE, 8);
        for (index, region) in self.regions.iter().enumerate() {
            regions.data_relocs.push((offset_u32(index * PROFILE_REGION_STRIDE + 16)?, region.name_data, 0));
        }
        module.define_data(self.tables.regions, regions)?;
        module.define_data(self.tables.model, DataDefinition::zeroed(COUNTERS_STRIDE, 8))?;
        module.define_data(
            self.tables.node_types,
            DataDefinition::zeroed(self.node_types.len().max(1) * COUNTERS_STRIDE, 8),
        )?;

        let mut node_info = DataDefinition::zeroed(self.regions.len().max(1) * NODE_INFO_STRIDE, 8);
        for (index, region) in self.regions.iter().enumerate() {
            let base = index * NODE_INFO_STRIDE;
            node_info.data_relocs.push((offset_u32(base)?, region.name_data, 0));
            if let Some(type_index) = region.node_type {
                let type_name = self.node_types[type_index].1.name_data;
                node_info.data_relocs.push((offset_u32(base + pointer_bytes)?, type_name, 0));
            }
        }
        module.define_data(self.tables.node_info, node_info)?;

        let mut node_type_info = DataDefinition::zeroed(self.node_types.len().max(1) * NODE_INFO_STRIDE, 8);
        for (index, (_, node_type)) in self.node_types.iter().enumerate() {
            let base = index * NODE_INFO_STRIDE;
            node_type_info.data_relocs.push((offset_u32(base)?, node_type.name_data, 0));
            node_type_info
                .data_relocs
                .push((offset_u32(base + pointer_bytes)?, node_type.name_data, 0));
        }
        module.define_data(self.tables.node_type_info, node_type_info)?;

        let regions = self.regions.len();
        let types = self.node_types.len();
        let a = self.accessors;
        let t = self.tables;
        emit_count(module, a.num_regions, regions)?;
        emit_lookup(module, a.region_info, t.regions, regions, PROFILE_REGION_STRIDE)?;
        emit_reset(module, a.reset_regions, t.regions, regions, PROFILE_REGION_STRIDE)?;
        emit_lookup(module, a.model_counters, t.model, 1, COUNTERS_STRIDE)?;
        emit_reset(module, a.reset_model, t.model, 1, COUNTERS_STRIDE)?;
        emit_lookup(module, a.node_info, t.node_info, regions, NODE_INFO_STRIDE)?;
        emit_lookup(module, a.node_counters, t.regions, regions, PROFILE_REGION_STRIDE)?;
        emit_reset(module, a.reset_nodes, t.regions, regions, PROFILE_REGION_STRIDE)?;
        emit_count(module, a.num_node_types, types)?;
        emit_lookup(module, a.node_type_info, t.node_type_info, types, NODE_INFO_STRIDE)?;
        emit_lookup(module, a.node_type_counters, t.node_types, types, COUNTERS_STRIDE)?;
        emit_reset(module, a.reset_node_types, t.node_types, types, COUNTERS_STRIDE)?;
        log::trace!("profiler generation {}: {} regions, {} node types", self.generation, regions, types);
        Ok(())
    }
}

fn offset(bytes: usize) -> EmitterResult<i32> {
    i32::try_from(bytes).map_err(|_| EmitterError::Codegen(format!("profiling offset {} out of range", bytes)))
}

fn offset_u32(bytes: usize) -> EmitterResult<u32> {
    u32::try_from(bytes).map_err(|_| EmitterError::Codegen(format!("profiling offset {} out of range", bytes)))
}

/// `count += 1; total_time += elapsed` for the record at `base + at`.
fn accumulate(function: &mut FunctionEmitter, base: Value, at: i32, elapsed: Value) {
    let count = function.load_type(types::I64, base, at);
    let count = function.ins().iadd_imm(count, 1);
    function.store(count, base, at);
    let total = function.load_type(types::F64, base, at + 8);
    let total = function.ins().fadd(total, elapsed);
    function.store(total, base, at + 8);
}

fn emit_count(module: &mut ModuleEmitter, handle: FunctionHandle, count: usize) -> EmitterResult<()> {
    let mut body = module.new_function_body(handle);
    let mut context = FunctionBuilderContext::new();
    {
        let mut f = FunctionEmitter::new(&mut body, &mut context, module.pointer_type());
        let value = f.int_const(types::I32, count as i64);
        f.return_values(&[value]);
        f.finish();
    }
    module.define_function(handle, body)
}

/// `index in 0..count ? table + index * stride : null`
fn emit_lookup(
    module: &mut ModuleEmitter,
    handle: FunctionHandle,
    table: DataHandle,
    count: usize,
    stride: usize,
) -> EmitterResult<()> {
    let mut body = module.new_function_body(handle);
    let mut context = FunctionBuilderContext::new();
    let takes_index = !module.function_decl(handle).params.is_empty();
    {
        let mut f = FunctionEmitter::new(&mut body, &mut context, module.pointer_type());
        let base = f.data_address(table);
        if takes_index {
            let index = f.param(0)?;
            let zero = f.int_const(types::I32, 0);
            let limit = f.int_const(types::I32, count as i64);
            let not_negative = f.compare(Comparison::GreaterOrEqual, PortType::Integer, index, zero);
            let below = f.compare(Comparison::Less, PortType::Integer, index, limit);
            let valid = f.ins().band(not_negative, below);
            let pointer_type = f.pointer_type();
            let wide = f.ins().sextend(pointer_type, index);
            let scaled = f.ins().imul_imm(wide, stride as i64);
            let address = f.ins().iadd(base, scaled);
            let null = f.pointer_const(0);
            let result = f.select(valid, address, null);
            f.return_values(&[result]);
        } else {
            f.return_values(&[base]);
        }
        f.finish();
    }
    module.define_function(handle, body)
}

/// Zeroes count and total time of every record.
fn emit_reset(
    module: &mut ModuleEmitter,
    handle: FunctionHandle,
    table: DataHandle,
    count: usize,
    stride: usize,
) -> EmitterResult<()> {
    let mut body = module.new_function_body(handle);
    let mut context = FunctionBuilderContext::new();
    {
        let mut f = FunctionEmitter::new(&mut body, &mut context, module.pointer_type());
        let base = f.data_address(table);
        f.for_range(count, |f, i| {
            let record = f.ins().imul_imm(i, stride as i64);
            let record = f.ins().iadd(base, record);
            let zero_count = f.int_const(types::I64, 0);
            let zero_time = f.ins().f64const(0.0);
            f.store(zero_count, record, 0);
            f.store(zero_time, record, 8);
            Ok::<(), EmitterError>(())
        })?;
        f.return_values(&[]);
        f.finish();
    }
    module.define_function(handle, body)
}
