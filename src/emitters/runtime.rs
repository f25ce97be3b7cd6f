/// Runtime support for compiled maps
///
/// Host functions the emitted code calls (clock and math intrinsics) and the
/// `repr(C)` mirrors of the structs the emitted code lays out in memory.
use std::ffi::{c_char, CStr};
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::model::PortType;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the first call into the runtime.
pub extern "C" fn ell_now() -> f64 {
    EPOCH.elapsed().as_secs_f64() * 1000.0
}

macro_rules! math_intrinsics {
    ($($name32:ident, $name64:ident => $method:ident;)*) => {
        $(
            pub extern "C" fn $name32(x: f32) -> f32 {
                x.$method()
            }

            pub extern "C" fn $name64(x: f64) -> f64 {
                x.$method()
            }
        )*
    };
}

math_intrinsics! {
    ell_exp_f32, ell_exp_f64 => exp;
    ell_log_f32, ell_log_f64 => ln;
    ell_tanh_f32, ell_tanh_f64 => tanh;
    ell_sin_f32, ell_sin_f64 => sin;
    ell_cos_f32, ell_cos_f64 => cos;
}

/// Transcendental functions compiled code reaches through host calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFunction {
    Exp,
    Log,
    Tanh,
    Sin,
    Cos,
}

impl MathFunction {
    /// Symbol of the intrinsic for a real element type.
    pub fn symbol(self, port_type: PortType) -> Option<&'static str> {
        let single = match port_type {
            PortType::SmallReal => true,
            PortType::Real => false,
            _ => return None,
        };
        Some(match (self, single) {
            (MathFunction::Exp, true) => "ell_exp_f32",
            (MathFunction::Exp, false) => "ell_exp_f64",
            (MathFunction::Log, true) => "ell_log_f32",
            (MathFunction::Log, false) => "ell_log_f64",
            (MathFunction::Tanh, true) => "ell_tanh_f32",
            (MathFunction::Tanh, false) => "ell_tanh_f64",
            (MathFunction::Sin, true) => "ell_sin_f32",
            (MathFunction::Sin, false) => "ell_sin_f64",
            (MathFunction::Cos, true) => "ell_cos_f32",
            (MathFunction::Cos, false) => "ell_cos_f64",
        })
    }
}

pub const NOW_SYMBOL: &str = "ell_now";

/// Every intrinsic symbol with the host address the JIT binds it to.
pub fn intrinsic_symbols() -> Vec<(&'static str, *const u8)> {
    vec![
        (NOW_SYMBOL, ell_now as *const u8),
        ("ell_exp_f32", ell_exp_f32 as *const u8),
        ("ell_exp_f64", ell_exp_f64 as *const u8),
        ("ell_log_f32", ell_log_f32 as *const u8),
        ("ell_log_f64", ell_log_f64 as *const u8),
        ("ell_tanh_f32", ell_tanh_f32 as *const u8),
        ("ell_tanh_f64", ell_tanh_f64 as *const u8),
        ("ell_sin_f32", ell_sin_f32 as *const u8),
        ("ell_sin_f64", ell_sin_f64 as *const u8),
        ("ell_cos_f32", ell_cos_f32 as *const u8),
        ("ell_cos_f64", ell_cos_f64 as *const u8),
    ]
}

/// Layout of one profiling region in emitted data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfileRegionInfo {
    pub count: i64,
    pub total_time: f64,
    pub name: *const c_char,
}

pub const PROFILE_REGION_STRIDE: usize = std::mem::size_of::<ProfileRegionInfo>();

/// Count and cumulative time, the prefix shared by every counter record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceCounters {
    pub count: i64,
    pub total_time: f64,
}

pub const COUNTERS_STRIDE: usize = std::mem::size_of::<PerformanceCounters>();

/// Name and type of a profiled node.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo {
    pub node_name: *const c_char,
    pub node_type: *const c_char,
}

pub const NODE_INFO_STRIDE: usize = std::mem::size_of::<NodeInfo>();

/// Shape record filled in by `{m}_GetInputShape` / `{m}_GetOutputShape`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CTensorShape {
    pub rows: i32,
    pub columns: i32,
    pub channels: i32,
}

/// Reads a NUL-terminated name written by emitted code.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives the call.
pub unsafe fn read_name(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
