//! Emission helpers shared by the node catalog.

use cranelift::prelude::Value;

use crate::compiler::MapCompiler;
use crate::emitters::{FunctionEmitter, ModuleEmitter};
use crate::error::{CompileError, CompileResult};
use crate::model::{PortElements, PortType, PortValues};

/// Emits `output[i] = op(inputs[0][i], inputs[1][i], ...)` over the length of
/// the first input.
pub(crate) fn emit_elementwise<F>(
    compiler: &mut MapCompiler,
    function: &mut FunctionEmitter,
    inputs: &[&PortElements],
    output_type: PortType,
    mut op: F,
) -> CompileResult<()>
where
    F: FnMut(&mut FunctionEmitter, &mut ModuleEmitter, &[Value]) -> CompileResult<Value>,
{
    let size = inputs.first().map_or(0, |e| e.size());
    let mut bases = Vec::with_capacity(inputs.len());
    for elements in inputs {
        bases.push((compiler.input_address(function, elements)?, elements.port_type()));
    }
    let output = compiler.output_address(function, 0)?;
    function.for_range(size, |f, i| {
        let values: Vec<Value> = bases.iter().map(|&(base, ty)| f.load_element(ty, base, i)).collect();
        let result = op(f, compiler.module_mut()?, &values)?;
        f.store_element(output_type, result, output, i);
        Ok::<(), CompileError>(())
    })
}

/// Copies `elements` into output 0 of the node being emitted.
pub(crate) fn emit_copy(
    compiler: &mut MapCompiler,
    function: &mut FunctionEmitter,
    elements: &PortElements,
) -> CompileResult<()> {
    let source = compiler.input_address(function, elements)?;
    let destination = compiler.output_address(function, 0)?;
    function.copy_elements(elements.port_type(), destination, source, elements.size())?;
    Ok(())
}

/// Address of a read-only table holding `values`.
pub(crate) fn constant_table(
    compiler: &mut MapCompiler,
    function: &mut FunctionEmitter,
    name: &str,
    values: &PortValues,
) -> CompileResult<Value> {
    let handle = compiler.global_constant(name, values)?;
    Ok(function.data_address(handle))
}

/// Emits `base[index] += value` through memory, for loop-carried sums.
pub(crate) fn accumulate(function: &mut FunctionEmitter, port_type: PortType, slot_address: Value, value: Value) {
    let current = function.load(port_type, slot_address, 0);
    let sum = function.add(port_type, current, value);
    function.store(sum, slot_address, 0);
}

/// A zeroed stack accumulator of one element.
pub(crate) fn accumulator(function: &mut FunctionEmitter, port_type: PortType) -> CompileResult<Value> {
    let slot = function.stack_buffer(port_type.byte_size())?;
    let address = function.stack_address(slot, 0);
    let zero = function.zero(port_type);
    function.store(zero, address, 0);
    Ok(address)
}
