//! Host callbacks reachable from compiled code.
//!
//! Compiled predict functions take an opaque context pointer and pass it to
//! the source and sink callbacks they call. The JIT binds those callback
//! symbols to the trampolines below, which recover the [`CallbackContext`]
//! and forward to the closures the host installed.

use std::ffi::c_void;

use crate::model::{Element, PortType};

pub type SourceFn<T> = Box<dyn FnMut(&mut [T]) -> bool + Send>;
pub type SinkFn<T> = Box<dyn FnMut(&[T]) + Send>;

/// A source closure of one of the supported element types.
pub enum SourceCallback {
    Float(SourceFn<f32>),
    Double(SourceFn<f64>),
}

/// A sink closure of one of the supported element types.
pub enum SinkCallback {
    Float(SinkFn<f32>),
    Double(SinkFn<f64>),
}

/// State handed to compiled code as its context pointer.
#[derive(Default)]
pub struct CallbackContext {
    source: Option<SourceCallback>,
    source_size: usize,
    sink: Option<SinkCallback>,
    sink_size: usize,
}

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackContext")
            .field("source", &self.source.is_some())
            .field("source_size", &self.source_size)
            .field("sink", &self.sink.is_some())
            .field("sink_size", &self.sink_size)
            .finish()
    }
}

impl CallbackContext {
    pub fn new(source_size: usize, sink_size: usize) -> Self {
        Self {
            source_size,
            sink_size,
            ..Self::default()
        }
    }

    pub fn set_source<T: CallbackElement>(&mut self, callback: SourceFn<T>) {
        self.source = Some(T::wrap_source(callback));
    }

    pub fn set_sink<T: CallbackElement>(&mut self, callback: SinkFn<T>) {
        self.sink = Some(T::wrap_sink(callback));
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn as_ptr(&mut self) -> *mut c_void {
        self as *mut Self as *mut c_void
    }
}

/// Element types compiled callbacks can carry.
pub trait CallbackElement: Element {
    fn wrap_source(callback: SourceFn<Self>) -> SourceCallback;
    fn wrap_sink(callback: SinkFn<Self>) -> SinkCallback;
}

impl CallbackElement for f32 {
    fn wrap_source(callback: SourceFn<Self>) -> SourceCallback {
        SourceCallback::Float(callback)
    }

    fn wrap_sink(callback: SinkFn<Self>) -> SinkCallback {
        SinkCallback::Float(callback)
    }
}

impl CallbackElement for f64 {
    fn wrap_source(callback: SourceFn<Self>) -> SourceCallback {
        SourceCallback::Double(callback)
    }

    fn wrap_sink(callback: SinkFn<Self>) -> SinkCallback {
        SinkCallback::Double(callback)
    }
}

/// Trampoline address for a source of `port_type`, if one exists.
pub fn source_trampoline(port_type: PortType) -> Option<*const u8> {
    match port_type {
        PortType::SmallReal => Some(source_callback_f32 as *const u8),
        PortType::Real => Some(source_callback_f64 as *const u8),
        _ => None,
    }
}

/// Trampoline address for a sink of `port_type`, if one exists.
pub fn sink_trampoline(port_type: PortType) -> Option<*const u8> {
    match port_type {
        PortType::SmallReal => Some(sink_callback_f32 as *const u8),
        PortType::Real => Some(sink_callback_f64 as *const u8),
        _ => None,
    }
}

/// # Safety
/// `context` must be null or point at a live `CallbackContext`.
unsafe fn context<'a>(context: *mut c_void) -> Option<&'a mut CallbackContext> {
    (context as *mut CallbackContext).as_mut()
}

extern "C" fn source_callback_f32(ctx: *mut c_void, buffer: *mut f32) -> bool {
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return false;
    };
    let size = ctx.source_size;
    match &mut ctx.source {
        Some(SourceCallback::Float(callback)) if !buffer.is_null() => {
            callback(unsafe { std::slice::from_raw_parts_mut(buffer, size) })
        }
        _ => false,
    }
}

extern "C" fn source_callback_f64(ctx: *mut c_void, buffer: *mut f64) -> bool {
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return false;
    };
    let size = ctx.source_size;
    match &mut ctx.source {
        Some(SourceCallback::Double(callback)) if !buffer.is_null() => {
            callback(unsafe { std::slice::from_raw_parts_mut(buffer, size) })
        }
        _ => false,
    }
}

extern "C" fn sink_callback_f32(ctx: *mut c_void, values: *const f32) {
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return;
    };
    let size = ctx.sink_size;
    if let Some(SinkCallback::Float(callback)) = &mut ctx.sink {
        if !values.is_null() {
            callback(unsafe { std::slice::from_raw_parts(values, size) });
        }
    }
}

extern "C" fn sink_callback_f64(ctx: *mut c_void, values: *const f64) {
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return;
    };
    let size = ctx.sink_size;
    if let Some(SinkCallback::Double(callback)) = &mut ctx.sink {
        if !values.is_null() {
            callback(unsafe { std::slice::from_raw_parts(values, size) });
        }
    }
}
