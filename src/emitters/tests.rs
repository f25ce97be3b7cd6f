use cranelift::prelude::FunctionBuilderContext;
use cranelift_jit::JITModule;
use cranelift_module::Linkage;

use super::runtime::intrinsic_symbols;
use super::*;
use crate::error::{EmitterError, EmitterResult};
use crate::model::{PortType, PortValues};

fn module() -> ModuleEmitter {
    ModuleEmitter::new("Test", "speed").unwrap()
}

fn define<F>(module: &mut ModuleEmitter, decl: FunctionDecl, emit: F) -> FunctionHandle
where
    F: FnOnce(&mut FunctionEmitter, &mut ModuleEmitter) -> EmitterResult<()>,
{
    let handle = module.declare_function(decl, Linkage::Export, true).unwrap();
    let mut body = module.new_function_body(handle);
    let mut context = FunctionBuilderContext::new();
    let mut function = FunctionEmitter::new(&mut body, &mut context, module.pointer_type());
    emit(&mut function, module).unwrap();
    function.finish();
    module.define_function(handle, body).unwrap();
    handle
}

/// JITs `module` and returns the address of `handle`. The returned module
/// must outlive every call through the address.
fn jit(module: &ModuleEmitter, handle: FunctionHandle) -> (JITModule, *const u8) {
    let symbols: Vec<(String, *const u8)> = intrinsic_symbols()
        .into_iter()
        .map(|(name, address)| (name.to_string(), address))
        .collect();
    let (jit, functions, _) = module.jit(&symbols).unwrap();
    let address = jit.get_finalized_function(functions[handle.0 as usize]);
    (jit, address)
}

#[test]
fn test_loop_accumulates_through_stack_slot() {
    let mut module = module();
    let decl = FunctionDecl::new("Test_Sum", CType::Double).param("values", CType::Double.const_ptr());
    let handle = define(&mut module, decl, |f, _| {
        let values = f.param(0)?;
        let slot = f.stack_buffer(8)?;
        let total = f.stack_address(slot, 0);
        let zero = f.zero(PortType::Real);
        f.store(zero, total, 0);
        f.for_range(5, |f, i| {
            let value = f.load_element(PortType::Real, values, i);
            let current = f.load(PortType::Real, total, 0);
            let sum = f.add(PortType::Real, current, value);
            f.store(sum, total, 0);
            Ok::<(), EmitterError>(())
        })?;
        let result = f.load(PortType::Real, total, 0);
        f.return_values(&[result]);
        Ok(())
    });

    let (_jit, address) = jit(&module, handle);
    let sum = unsafe { std::mem::transmute::<*const u8, extern "C" fn(*const f64) -> f64>(address) };
    let values = [1.0, 2.0, 3.0, 4.0, 5.5];
    assert_eq!(sum(values.as_ptr()), 15.5);
}

#[test]
fn test_integer_division_is_total() {
    let mut module = module();
    let decl = FunctionDecl::new("Test_Divide", CType::Int32)
        .param("a", CType::Int32)
        .param("b", CType::Int32);
    let handle = define(&mut module, decl, |f, _| {
        let (a, b) = (f.param(0)?, f.param(1)?);
        let quotient = f.div(PortType::Integer, a, b);
        f.return_values(&[quotient]);
        Ok(())
    });

    let (_jit, address) = jit(&module, handle);
    let divide = unsafe { std::mem::transmute::<*const u8, extern "C" fn(i32, i32) -> i32>(address) };
    assert_eq!(divide(7, 2), 3);
    assert_eq!(divide(-7, 2), -3);
    assert_eq!(divide(7, 0), 0);
    assert_eq!(divide(i32::MIN, -1), i32::MIN);
    assert_eq!(divide(9, -1), -9);
}

#[test]
fn test_compare_and_select() {
    let mut module = module();
    let decl = FunctionDecl::new("Test_Max", CType::Int64)
        .param("a", CType::Int64)
        .param("b", CType::Int64);
    let handle = define(&mut module, decl, |f, _| {
        let (a, b) = (f.param(0)?, f.param(1)?);
        let greater = f.compare(Comparison::Greater, PortType::BigInt, a, b);
        let max = f.select(greater, a, b);
        f.return_values(&[max]);
        Ok(())
    });

    let (_jit, address) = jit(&module, handle);
    let max = unsafe { std::mem::transmute::<*const u8, extern "C" fn(i64, i64) -> i64>(address) };
    assert_eq!(max(3, -4), 3);
    assert_eq!(max(-3, 4), 4);
    assert_eq!(max(i64::MIN, i64::MAX), i64::MAX);
}

#[test]
fn test_if_then_runs_only_when_set() {
    let mut module = module();
    let decl = FunctionDecl::new("Test_Flag", CType::Void)
        .param("flag", CType::Bool)
        .param("out", CType::Int32.ptr());
    let handle = define(&mut module, decl, |f, _| {
        let (flag, out) = (f.param(0)?, f.param(1)?);
        let zero = f.zero(PortType::Integer);
        f.store(zero, out, 0);
        f.if_then(flag, |f| {
            let seven = f.constant(PortType::Integer, 7.0);
            f.store(seven, out, 0);
            Ok::<(), EmitterError>(())
        })?;
        f.return_values(&[]);
        Ok(())
    });

    let (_jit, address) = jit(&module, handle);
    let run = unsafe { std::mem::transmute::<*const u8, extern "C" fn(u8, *mut i32)>(address) };
    let mut out = -1;
    run(1, &mut out);
    assert_eq!(out, 7);
    run(0, &mut out);
    assert_eq!(out, 0);
}

#[test]
fn test_math_intrinsics_are_linked() {
    let mut module = module();
    let decl = FunctionDecl::new("Test_Exp", CType::Double).param("x", CType::Double);
    let handle = define(&mut module, decl, |f, module| {
        let x = f.param(0)?;
        let y = f.call_math(module, MathFunction::Exp, PortType::Real, x)?;
        f.return_values(&[y]);
        Ok(())
    });

    let (_jit, address) = jit(&module, handle);
    let exp = unsafe { std::mem::transmute::<*const u8, extern "C" fn(f64) -> f64>(address) };
    approx::assert_relative_eq!(exp(1.0), std::f64::consts::E);
    approx::assert_relative_eq!(exp(0.0), 1.0);
}

#[test]
fn test_constant_table_copy() {
    let mut module = module();
    let table = PortValues::SmallReal(vec![1.5, 2.5, 3.5]);
    let data = module
        .add_data("Test_Table", false, DataDefinition::bytes(table.to_bytes(), 4))
        .unwrap();
    let decl = FunctionDecl::new("Test_Copy", CType::Void).param("out", CType::Float.ptr());
    let handle = define(&mut module, decl, |f, _| {
        let out = f.param(0)?;
        let source = f.data_address(data);
        f.copy_elements(PortType::SmallReal, out, source, 3)?;
        f.return_values(&[]);
        Ok(())
    });

    let (_jit, address) = jit(&module, handle);
    let copy = unsafe { std::mem::transmute::<*const u8, extern "C" fn(*mut f32)>(address) };
    let mut out = [0.0f32; 3];
    copy(out.as_mut_ptr());
    assert_eq!(out, [1.5, 2.5, 3.5]);
}

#[test]
fn test_symbol_rules() {
    let mut module = module();
    let decl = FunctionDecl::new("Test_F", CType::Void);
    let first = module.declare_function(decl.clone(), Linkage::Export, true).unwrap();
    let again = module.declare_function(decl, Linkage::Export, true).unwrap();
    assert_eq!(first, again);

    let clash = module.declare_function(FunctionDecl::new("Test_F", CType::Int32), Linkage::Export, true);
    assert!(matches!(clash, Err(EmitterError::DuplicateSymbol(_))));

    let import = module.declare_import(FunctionDecl::new("host_fn", CType::Void)).unwrap();
    let body = module.new_function_body(import);
    assert!(module.define_function(import, body).is_err());

    assert!(matches!(module.function("missing"), Err(EmitterError::UnknownSymbol(_))));
    module.add_data("Test_D", true, DataDefinition::zeroed(8, 8)).unwrap();
    assert!(module.add_data("Test_D", true, DataDefinition::zeroed(8, 8)).is_err());
}

#[test]
fn test_c_types_render() {
    assert_eq!(CType::Double.const_ptr().render(), "const double*");
    assert_eq!(CType::void_ptr().render(), "void*");
    assert_eq!(CType::from_port_type(PortType::BigInt), CType::Int64);
    let decl = FunctionDecl::new("ELL_GetInputSize", CType::Int32);
    assert_eq!(decl.c_prototype(), "int32_t ELL_GetInputSize(void)");
}

#[test]
fn test_writers() {
    let mut module = module();
    module
        .declare_callback(FunctionDecl::new("Test_Callback", CType::Void).param("context", CType::void_ptr()))
        .unwrap();
    let decl = FunctionDecl::new("Test_Answer", CType::Int32);
    define(&mut module, decl, |f, _| {
        let answer = f.constant(PortType::Integer, 42.0);
        f.return_values(&[answer]);
        Ok(())
    });

    let header = writers::c_header(&module);
    assert!(header.contains("#ifndef TEST_H"));
    assert!(header.contains("void Test_Callback(void* context);"));
    assert!(header.contains("int32_t Test_Answer(void);"));

    let swig = writers::swig_interface(&module);
    assert!(swig.contains("%module Test"));

    let ir = writers::ir_text(&module);
    assert!(ir.starts_with("; module Test"));
    assert!(ir.contains("; Test_Answer"));

    let mut object = Vec::new();
    writers::write_module(&module, ModuleOutputFormat::ObjectCode, &mut object).unwrap();
    assert!(!object.is_empty());
    assert_eq!(ModuleOutputFormat::CHeader.extension(), "h");
}

#[test]
fn test_region_names_are_unique() {
    let mut module = module();
    let mut profiler = Profiler::new(&mut module, "Test").unwrap();
    profiler.create_region(&mut module, "layer").unwrap();
    let again = profiler.create_region(&mut module, "layer");
    assert!(matches!(again, Err(EmitterError::DuplicateSymbol(_))));

    let node = profiler.create_node_region(&mut module, "layer", "ReLUNode");
    assert!(matches!(node, Err(EmitterError::DuplicateSymbol(_))));
    assert_eq!(profiler.region_count(), 1);
}

#[test]
fn test_accessors_survive_new_regions() {
    let mut module = module();
    let mut profiler = Profiler::new(&mut module, "Test").unwrap();
    let count_before = module.function("Test_GetNumProfileRegions").unwrap();
    let info_before = module.function("Test_GetRegionProfilingInfo").unwrap();
    let generation = profiler.generation();

    let first = profiler.create_region(&mut module, "first").unwrap();
    let second = profiler.create_node_region(&mut module, "second", "ConvolutionNode").unwrap();
    assert_eq!(profiler.region_name(first), Some("first"));
    assert_eq!(profiler.region_name(second), Some("second"));
    assert!(profiler.generation() > generation);

    let count_after = module.function("Test_GetNumProfileRegions").unwrap();
    let info_after = module.function("Test_GetRegionProfilingInfo").unwrap();
    assert_eq!(count_before, count_after);
    assert_eq!(info_before, info_after);

    let symbols: Vec<(String, *const u8)> = intrinsic_symbols()
        .into_iter()
        .map(|(name, address)| (name.to_string(), address))
        .collect();
    let (jit, functions, _) = module.jit(&symbols).unwrap();
    let count_address = jit.get_finalized_function(functions[count_after.0 as usize]);
    let info_address = jit.get_finalized_function(functions[info_after.0 as usize]);
    let num_regions = unsafe { std::mem::transmute::<*const u8, extern "C" fn() -> i32>(count_address) };
    let region_info =
        unsafe { std::mem::transmute::<*const u8, extern "C" fn(i32) -> *const ProfileRegionInfo>(info_address) };
    assert_eq!(num_regions(), 2);

    let record = region_info(1);
    assert!(!record.is_null());
    let name = unsafe { std::ffi::CStr::from_ptr((*record).name) };
    assert_eq!(name.to_str().unwrap(), "second");
    assert_eq!(unsafe { (*record).count }, 0);
    assert!(region_info(2).is_null());
    assert!(region_info(-1).is_null());
}
