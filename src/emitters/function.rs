use std::collections::HashMap;

use cranelift::codegen::ir::{FuncRef, GlobalValue, StackSlot};
use cranelift::frontend::FuncInstBuilder;
use cranelift::prelude::*;
use cranelift_codegen::ir::immediates::Imm64;

use super::module::{data_external_name, function_external_name, DataHandle, FunctionHandle, ModuleEmitter};
use super::runtime::{MathFunction, NOW_SYMBOL};
use super::types::{ir_type, CType, FunctionDecl};
use crate::error::{EmitterError, EmitterResult};
use crate::model::PortType;

/// Ordering and equality comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    fn int_cc(self, signed: bool) -> IntCC {
        match (self, signed) {
            (Comparison::Equal, _) => IntCC::Equal,
            (Comparison::NotEqual, _) => IntCC::NotEqual,
            (Comparison::Less, true) => IntCC::SignedLessThan,
            (Comparison::Less, false) => IntCC::UnsignedLessThan,
            (Comparison::LessOrEqual, true) => IntCC::SignedLessThanOrEqual,
            (Comparison::LessOrEqual, false) => IntCC::UnsignedLessThanOrEqual,
            (Comparison::Greater, true) => IntCC::SignedGreaterThan,
            (Comparison::Greater, false) => IntCC::UnsignedGreaterThan,
            (Comparison::GreaterOrEqual, true) => IntCC::SignedGreaterThanOrEqual,
            (Comparison::GreaterOrEqual, false) => IntCC::UnsignedGreaterThanOrEqual,
        }
    }

    fn float_cc(self) -> FloatCC {
        match self {
            Comparison::Equal => FloatCC::Equal,
            Comparison::NotEqual => FloatCC::NotEqual,
            Comparison::Less => FloatCC::LessThan,
            Comparison::LessOrEqual => FloatCC::LessThanOrEqual,
            Comparison::Greater => FloatCC::GreaterThan,
            Comparison::GreaterOrEqual => FloatCC::GreaterThanOrEqual,
        }
    }
}

/// Emits the body of one function.
///
/// Wraps a Cranelift `FunctionBuilder` with typed helpers keyed on
/// [`PortType`], counted loops, and cached references to the functions and
/// data objects of the owning [`ModuleEmitter`].
pub struct FunctionEmitter<'a> {
    builder: FunctionBuilder<'a>,
    pointer_type: Type,
    entry: Block,
    func_refs: HashMap<FunctionHandle, FuncRef>,
    data_refs: HashMap<DataHandle, GlobalValue>,
}

impl<'a> FunctionEmitter<'a> {
    /// Starts emission in a fresh entry block holding the function parameters.
    pub fn new(func: &'a mut codegen::ir::Function, context: &'a mut FunctionBuilderContext, pointer_type: Type) -> Self {
        let mut builder = FunctionBuilder::new(func, context);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        Self {
            builder,
            pointer_type,
            entry,
            func_refs: HashMap::new(),
            data_refs: HashMap::new(),
        }
    }

    pub fn pointer_type(&self) -> Type {
        self.pointer_type
    }

    pub fn builder(&mut self) -> &mut FunctionBuilder<'a> {
        &mut self.builder
    }

    pub fn ins(&mut self) -> FuncInstBuilder<'_, 'a> {
        self.builder.ins()
    }

    /// Function parameter `index`.
    pub fn param(&self, index: usize) -> EmitterResult<Value> {
        self.builder
            .block_params(self.entry)
            .get(index)
            .copied()
            .ok_or_else(|| EmitterError::Codegen(format!("function has no parameter #{}", index)))
    }

    /// Integer constant of type `ty`, masked to its width.
    pub fn int_const(&mut self, ty: Type, value: i64) -> Value {
        let masked = match ty.bits() {
            8 => value & 0xff,
            16 => value & 0xffff,
            32 => value & 0xffff_ffff,
            _ => value,
        };
        self.builder.ins().iconst(ty, Imm64::new(masked))
    }

    pub fn pointer_const(&mut self, value: i64) -> Value {
        self.int_const(self.pointer_type, value)
    }

    /// Constant of `port_type` converted from a double.
    pub fn constant(&mut self, port_type: PortType, value: f64) -> Value {
        match port_type {
            PortType::Boolean => self.int_const(types::I8, (value != 0.0) as i64),
            PortType::Integer => self.int_const(types::I32, value as i32 as i64),
            PortType::BigInt => self.int_const(types::I64, value as i64),
            PortType::SmallReal => self.builder.ins().f32const(value as f32),
            PortType::Real => self.builder.ins().f64const(value),
        }
    }

    pub fn zero(&mut self, port_type: PortType) -> Value {
        self.constant(port_type, 0.0)
    }

    pub fn load(&mut self, port_type: PortType, address: Value, offset: i32) -> Value {
        self.builder
            .ins()
            .load(ir_type(port_type), MemFlags::trusted(), address, offset)
    }

    pub fn load_type(&mut self, ty: Type, address: Value, offset: i32) -> Value {
        self.builder.ins().load(ty, MemFlags::trusted(), address, offset)
    }

    pub fn store(&mut self, value: Value, address: Value, offset: i32) {
        self.builder.ins().store(MemFlags::trusted(), value, address, offset);
    }

    /// Address of element `index` (a pointer-sized value) of an array at `base`.
    pub fn element_address(&mut self, port_type: PortType, base: Value, index: Value) -> Value {
        let scaled = self
            .builder
            .ins()
            .imul_imm(index, port_type.byte_size() as i64);
        self.builder.ins().iadd(base, scaled)
    }

    /// Loads element `index` of an array at `base`.
    pub fn load_element(&mut self, port_type: PortType, base: Value, index: Value) -> Value {
        let address = self.element_address(port_type, base, index);
        self.load(port_type, address, 0)
    }

    pub fn store_element(&mut self, port_type: PortType, value: Value, base: Value, index: Value) {
        let address = self.element_address(port_type, base, index);
        self.store(value, address, 0);
    }

    /// Byte offset of constant element `index`, as a load/store immediate.
    pub fn element_offset(port_type: PortType, index: usize) -> EmitterResult<i32> {
        i32::try_from(index * port_type.byte_size())
            .map_err(|_| EmitterError::Codegen(format!("element offset {} out of range", index)))
    }

    /// Copies `count` elements. Short runs are unrolled.
    pub fn copy_elements(&mut self, port_type: PortType, dst: Value, src: Value, count: usize) -> EmitterResult<()> {
        if count <= 16 {
            for i in 0..count {
                let offset = Self::element_offset(port_type, i)?;
                let value = self.load(port_type, src, offset);
                self.store(value, dst, offset);
            }
            return Ok(());
        }
        self.for_range(count, |f, i| {
            let value = f.load_element(port_type, src, i);
            f.store_element(port_type, value, dst, i);
            Ok::<(), EmitterError>(())
        })
    }

    /// Stack buffer of `bytes` bytes, 8-byte aligned.
    pub fn stack_buffer(&mut self, bytes: usize) -> EmitterResult<StackSlot> {
        let size = u32::try_from(bytes.max(1))
            .map_err(|_| EmitterError::Codegen(format!("stack buffer of {} bytes", bytes)))?;
        Ok(self
            .builder
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 3)))
    }

    pub fn stack_address(&mut self, slot: StackSlot, offset: i32) -> Value {
        self.builder.ins().stack_addr(self.pointer_type, slot, offset)
    }

    /// Runs `body` for `i` in `0..count`; `i` is pointer-sized.
    pub fn for_range<E, F>(&mut self, count: usize, mut body: F) -> Result<(), E>
    where
        F: FnMut(&mut Self, Value) -> Result<(), E>,
    {
        if count == 0 {
            return Ok(());
        }
        let header = self.builder.create_block();
        let body_block = self.builder.create_block();
        let exit = self.builder.create_block();
        self.builder.append_block_param(header, self.pointer_type);

        let start = self.pointer_const(0);
        self.builder.ins().jump(header, &[start]);

        self.builder.switch_to_block(header);
        let i = self.builder.block_params(header)[0];
        let in_range = self
            .builder
            .ins()
            .icmp_imm(IntCC::UnsignedLessThan, i, count as i64);
        self.builder.ins().brif(in_range, body_block, &[], exit, &[]);

        self.builder.switch_to_block(body_block);
        self.builder.seal_block(body_block);
        body(self, i)?;
        let next = self.builder.ins().iadd_imm(i, 1);
        self.builder.ins().jump(header, &[next]);
        self.builder.seal_block(header);

        self.builder.switch_to_block(exit);
        self.builder.seal_block(exit);
        Ok(())
    }

    /// Runs `body` when `condition` (an `i8`) is non-zero.
    pub fn if_then<E, F>(&mut self, condition: Value, body: F) -> Result<(), E>
    where
        F: FnOnce(&mut Self) -> Result<(), E>,
    {
        let then_block = self.builder.create_block();
        let merge = self.builder.create_block();
        self.builder.ins().brif(condition, then_block, &[], merge, &[]);

        self.builder.switch_to_block(then_block);
        self.builder.seal_block(then_block);
        body(self)?;
        self.builder.ins().jump(merge, &[]);

        self.builder.switch_to_block(merge);
        self.builder.seal_block(merge);
        Ok(())
    }

    pub fn select(&mut self, condition: Value, if_true: Value, if_false: Value) -> Value {
        self.builder.ins().select(condition, if_true, if_false)
    }

    pub fn add(&mut self, port_type: PortType, a: Value, b: Value) -> Value {
        if port_type.is_real() {
            self.builder.ins().fadd(a, b)
        } else {
            self.builder.ins().iadd(a, b)
        }
    }

    pub fn sub(&mut self, port_type: PortType, a: Value, b: Value) -> Value {
        if port_type.is_real() {
            self.builder.ins().fsub(a, b)
        } else {
            self.builder.ins().isub(a, b)
        }
    }

    pub fn mul(&mut self, port_type: PortType, a: Value, b: Value) -> Value {
        if port_type.is_real() {
            self.builder.ins().fmul(a, b)
        } else {
            self.builder.ins().imul(a, b)
        }
    }

    /// Division. Integer division by zero yields zero; `MIN / -1` wraps.
    pub fn div(&mut self, port_type: PortType, a: Value, b: Value) -> Value {
        if port_type.is_real() {
            return self.builder.ins().fdiv(a, b);
        }
        let ty = ir_type(port_type);
        let is_zero = self.builder.ins().icmp_imm(IntCC::Equal, b, 0);
        let is_minus_one = self.builder.ins().icmp_imm(IntCC::Equal, b, -1);
        let unsafe_divisor = self.builder.ins().bor(is_zero, is_minus_one);
        let one = self.int_const(ty, 1);
        let divisor = self.builder.ins().select(unsafe_divisor, one, b);
        let quotient = self.builder.ins().sdiv(a, divisor);
        let negated = self.builder.ins().ineg(a);
        let result = self.builder.ins().select(is_minus_one, negated, quotient);
        let zero = self.int_const(ty, 0);
        self.builder.ins().select(is_zero, zero, result)
    }

    pub fn neg(&mut self, port_type: PortType, a: Value) -> Value {
        if port_type.is_real() {
            self.builder.ins().fneg(a)
        } else {
            self.builder.ins().ineg(a)
        }
    }

    pub fn abs(&mut self, port_type: PortType, a: Value) -> Value {
        if port_type.is_real() {
            self.builder.ins().fabs(a)
        } else {
            self.builder.ins().iabs(a)
        }
    }

    pub fn sqrt(&mut self, a: Value) -> Value {
        self.builder.ins().sqrt(a)
    }

    /// Compares two values; the result is an `i8` holding 0 or 1.
    pub fn compare(&mut self, comparison: Comparison, port_type: PortType, a: Value, b: Value) -> Value {
        match port_type {
            PortType::SmallReal | PortType::Real => self.builder.ins().fcmp(comparison.float_cc(), a, b),
            PortType::Boolean => self.builder.ins().icmp(comparison.int_cc(false), a, b),
            PortType::Integer | PortType::BigInt => self.builder.ins().icmp(comparison.int_cc(true), a, b),
        }
    }

    /// Reference to a module function usable in this body.
    pub fn func_ref(&mut self, module: &ModuleEmitter, handle: FunctionHandle) -> FuncRef {
        if let Some(&existing) = self.func_refs.get(&handle) {
            return existing;
        }
        let signature = self.builder.import_signature(module.function_signature(handle).clone());
        let name = self
            .builder
            .func
            .declare_imported_user_function(function_external_name(handle));
        let func_ref = self.builder.import_function(ExtFuncData {
            name: ExternalName::user(name),
            signature,
            colocated: false,
        });
        self.func_refs.insert(handle, func_ref);
        func_ref
    }

    fn data_ref(&mut self, handle: DataHandle) -> GlobalValue {
        if let Some(&existing) = self.data_refs.get(&handle) {
            return existing;
        }
        let name = self
            .builder
            .func
            .declare_imported_user_function(data_external_name(handle));
        let global = self.builder.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::user(name),
            offset: Imm64::new(0),
            colocated: false,
            tls: false,
        });
        self.data_refs.insert(handle, global);
        global
    }

    /// Address of a module data object.
    pub fn data_address(&mut self, handle: DataHandle) -> Value {
        let global = self.data_ref(handle);
        self.builder.ins().symbol_value(self.pointer_type, global)
    }

    /// Calls a module function and returns its results.
    pub fn call(&mut self, module: &ModuleEmitter, handle: FunctionHandle, args: &[Value]) -> Vec<Value> {
        let func_ref = self.func_ref(module, handle);
        let call = self.builder.ins().call(func_ref, args);
        self.builder.inst_results(call).to_vec()
    }

    /// Calls a transcendental intrinsic on a real value.
    pub fn call_math(
        &mut self,
        module: &mut ModuleEmitter,
        function: MathFunction,
        port_type: PortType,
        value: Value,
    ) -> EmitterResult<Value> {
        let symbol = function.symbol(port_type).ok_or_else(|| {
            EmitterError::Codegen(format!("{:?} is only defined for real values", function))
        })?;
        let c_type = CType::from_port_type(port_type);
        let handle = module.declare_import(FunctionDecl::new(symbol, c_type.clone()).param("x", c_type))?;
        let results = self.call(module, handle, &[value]);
        results
            .first()
            .copied()
            .ok_or_else(|| EmitterError::Codegen(format!("{} returned nothing", symbol)))
    }

    /// Current time in milliseconds, from the runtime clock.
    pub fn now(&mut self, module: &mut ModuleEmitter) -> EmitterResult<Value> {
        let handle = module.declare_import(FunctionDecl::new(NOW_SYMBOL, CType::Double))?;
        let results = self.call(module, handle, &[]);
        results
            .first()
            .copied()
            .ok_or_else(|| EmitterError::Codegen("clock returned nothing".into()))
    }

    pub fn return_values(&mut self, values: &[Value]) {
        self.builder.ins().return_(values);
    }

    /// Seals remaining blocks and finishes the body.
    pub fn finish(mut self) {
        self.builder.seal_all_blocks();
        self.builder.finalize();
    }
}
