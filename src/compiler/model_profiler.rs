use std::collections::HashMap;

use crate::emitters::{FunctionEmitter, ModuleEmitter, Profiler, RegionHandle, RegionTimer};
use crate::error::CompileResult;
use crate::model::{NodeId, NodeKey};

/// Pending node region opened by [`ModelProfiler::begin_node`].
#[derive(Debug, Clone, Copy)]
pub struct NodeTimer {
    region: RegionHandle,
    timer: RegionTimer,
}

/// Per-node profiling of an emitted predict function.
///
/// Each node gets a region named after its id the first time it is emitted,
/// counted under its node type too. The whole predict call is timed into the
/// model counters.
#[derive(Debug)]
pub struct ModelProfiler {
    profiler: Profiler,
    regions: HashMap<NodeKey, RegionHandle>,
}

impl ModelProfiler {
    pub fn new(module: &mut ModuleEmitter, prefix: &str) -> CompileResult<Self> {
        Ok(Self {
            profiler: Profiler::new(module, prefix)?,
            regions: HashMap::new(),
        })
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn begin_model(&mut self, function: &mut FunctionEmitter, module: &mut ModuleEmitter) -> CompileResult<RegionTimer> {
        Ok(self.profiler.enter_region(function, module)?)
    }

    pub fn end_model(
        &mut self,
        function: &mut FunctionEmitter,
        module: &mut ModuleEmitter,
        timer: RegionTimer,
    ) -> CompileResult<()> {
        Ok(self.profiler.exit_model(function, module, timer)?)
    }

    pub fn begin_node(
        &mut self,
        function: &mut FunctionEmitter,
        module: &mut ModuleEmitter,
        key: NodeKey,
        id: NodeId,
        type_name: &str,
    ) -> CompileResult<NodeTimer> {
        let region = match self.regions.get(&key) {
            Some(&region) => region,
            None => {
                let region = self
                    .profiler
                    .create_node_region(module, &format!("node_{}", id), type_name)?;
                self.regions.insert(key, region);
                region
            }
        };
        let timer = self.profiler.enter_region(function, module)?;
        Ok(NodeTimer { region, timer })
    }

    pub fn end_node(&mut self, function: &mut FunctionEmitter, module: &mut ModuleEmitter, timer: NodeTimer) -> CompileResult<()> {
        Ok(self.profiler.exit_region(function, module, timer.region, timer.timer)?)
    }
}
