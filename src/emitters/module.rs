use std::collections::HashMap;

use cranelift::prelude::{settings, Configurable, Type};
use cranelift_codegen::ir::{self, Signature, UserExternalName, UserFuncName};
use cranelift_codegen::isa::{CallConv, OwnedTargetIsa};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};

use super::types::{FunctionDecl, StructDecl};
use crate::error::{EmitterError, EmitterResult};

/// Namespace of function references in `UserExternalName`s.
pub(crate) const FUNCTION_NAMESPACE: u32 = 0;
/// Namespace of data references in `UserExternalName`s.
pub(crate) const DATA_NAMESPACE: u32 = 1;

/// Handle of a function declared in a [`ModuleEmitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub(crate) u32);

/// Handle of a data object declared in a [`ModuleEmitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataHandle(pub(crate) u32);

/// Initial contents of a data object.
#[derive(Debug, Clone, PartialEq)]
pub enum DataContents {
    Zero(usize),
    Bytes(Vec<u8>),
}

impl DataContents {
    pub fn len(&self) -> usize {
        match self {
            DataContents::Zero(size) => *size,
            DataContents::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A data object: contents plus pointers patched in at link time.
#[derive(Debug, Clone)]
pub struct DataDefinition {
    pub contents: DataContents,
    pub align: u64,
    /// `(offset, target, addend)` pointers to other data objects.
    pub data_relocs: Vec<(u32, DataHandle, i64)>,
}

impl DataDefinition {
    pub fn zeroed(size: usize, align: u64) -> Self {
        Self {
            contents: DataContents::Zero(size),
            align,
            data_relocs: Vec::new(),
        }
    }

    pub fn bytes(bytes: Vec<u8>, align: u64) -> Self {
        Self {
            contents: DataContents::Bytes(bytes),
            align,
            data_relocs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct FunctionEntry {
    decl: FunctionDecl,
    linkage: Linkage,
    signature: Signature,
    /// Listed in generated headers.
    public: bool,
    body: Option<ir::Function>,
}

#[derive(Debug, Clone)]
struct DataEntry {
    name: String,
    linkage: Linkage,
    writable: bool,
    definition: Option<DataDefinition>,
}

/// A host callback the emitted code imports.
#[derive(Debug, Clone)]
pub struct CallbackDecl {
    pub decl: FunctionDecl,
    pub handle: FunctionHandle,
}

/// Backend-independent record of everything a compiled map consists of.
///
/// Functions and data are declared and defined here first and materialized
/// into a concrete Cranelift module (JIT or object) on demand. Keeping the
/// record lets the emitter be cloned, written out as text, and lets
/// definitions be replaced under the same handle before materialization.
#[derive(Clone)]
pub struct ModuleEmitter {
    name: String,
    isa: OwnedTargetIsa,
    functions: Vec<FunctionEntry>,
    function_names: HashMap<String, FunctionHandle>,
    data: Vec<DataEntry>,
    data_names: HashMap<String, DataHandle>,
    structs: Vec<StructDecl>,
    callbacks: Vec<CallbackDecl>,
    header_comments: Vec<String>,
}

impl std::fmt::Debug for ModuleEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEmitter")
            .field("name", &self.name)
            .field("functions", &self.functions.len())
            .field("data", &self.data.len())
            .finish()
    }
}

/// Builds the host ISA with the flags compiled maps use.
pub fn host_isa(opt_level: &str) -> EmitterResult<OwnedTargetIsa> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(|e| EmitterError::Codegen(format!("Failed to set flag: {}", e)))?;
    flag_builder
        .set("is_pic", "false")
        .map_err(|e| EmitterError::Codegen(format!("Failed to set flag: {}", e)))?;
    flag_builder
        .set("opt_level", opt_level)
        .map_err(|e| EmitterError::Codegen(format!("Failed to set opt_level '{}': {}", opt_level, e)))?;

    let isa_builder = cranelift_native::builder()
        .map_err(|e| EmitterError::Codegen(format!("Failed to create ISA builder: {}", e)))?;
    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| EmitterError::Codegen(format!("Failed to create ISA: {}", e)))
}

impl ModuleEmitter {
    pub fn new(name: impl Into<String>, opt_level: &str) -> EmitterResult<Self> {
        Ok(Self {
            name: name.into(),
            isa: host_isa(opt_level)?,
            functions: Vec::new(),
            function_names: HashMap::new(),
            data: Vec::new(),
            data_names: HashMap::new(),
            structs: Vec::new(),
            callbacks: Vec::new(),
            header_comments: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pointer_type(&self) -> Type {
        self.isa.pointer_type()
    }

    pub fn call_conv(&self) -> CallConv {
        self.isa.default_call_conv()
    }

    /// Declares a function, or returns the existing handle for `decl.name`.
    pub fn declare_function(
        &mut self,
        decl: FunctionDecl,
        linkage: Linkage,
        public: bool,
    ) -> EmitterResult<FunctionHandle> {
        if let Some(&handle) = self.function_names.get(&decl.name) {
            let existing = &self.functions[handle.0 as usize];
            if existing.decl != decl {
                return Err(EmitterError::DuplicateSymbol(decl.name));
            }
            return Ok(handle);
        }
        let handle = FunctionHandle(self.functions.len() as u32);
        let signature = decl.signature(self.pointer_type(), self.call_conv());
        self.function_names.insert(decl.name.clone(), handle);
        self.functions.push(FunctionEntry {
            decl,
            linkage,
            signature,
            public,
            body: None,
        });
        Ok(handle)
    }

    /// Declares an imported host function.
    pub fn declare_import(&mut self, decl: FunctionDecl) -> EmitterResult<FunctionHandle> {
        self.declare_function(decl, Linkage::Import, false)
    }

    /// Declares a host callback; it is listed in generated headers as a
    /// function the host must provide.
    pub fn declare_callback(&mut self, decl: FunctionDecl) -> EmitterResult<FunctionHandle> {
        let handle = self.declare_import(decl.clone())?;
        if !self.callbacks.iter().any(|c| c.handle == handle) {
            self.callbacks.push(CallbackDecl { decl, handle });
        }
        Ok(handle)
    }

    pub fn function(&self, name: &str) -> EmitterResult<FunctionHandle> {
        self.function_names
            .get(name)
            .copied()
            .ok_or_else(|| EmitterError::UnknownSymbol(name.to_string()))
    }

    pub fn function_decl(&self, handle: FunctionHandle) -> &FunctionDecl {
        &self.functions[handle.0 as usize].decl
    }

    pub fn function_signature(&self, handle: FunctionHandle) -> &Signature {
        &self.functions[handle.0 as usize].signature
    }

    /// An empty body with the declared signature, ready for a `FunctionEmitter`.
    pub fn new_function_body(&self, handle: FunctionHandle) -> ir::Function {
        ir::Function::with_name_signature(
            UserFuncName::user(FUNCTION_NAMESPACE, handle.0),
            self.function_signature(handle).clone(),
        )
    }

    /// Sets (or replaces) the body of a declared function.
    pub fn define_function(&mut self, handle: FunctionHandle, body: ir::Function) -> EmitterResult<()> {
        let entry = self
            .functions
            .get_mut(handle.0 as usize)
            .ok_or_else(|| EmitterError::UnknownSymbol(format!("function #{}", handle.0)))?;
        if entry.linkage == Linkage::Import {
            return Err(EmitterError::Codegen(format!(
                "cannot define imported function '{}'",
                entry.decl.name
            )));
        }
        entry.body = Some(body);
        Ok(())
    }

    /// Declares a data object, or returns the existing handle for `name`.
    pub fn declare_data(&mut self, name: &str, writable: bool) -> DataHandle {
        if let Some(&handle) = self.data_names.get(name) {
            return handle;
        }
        let handle = DataHandle(self.data.len() as u32);
        self.data_names.insert(name.to_string(), handle);
        self.data.push(DataEntry {
            name: name.to_string(),
            linkage: Linkage::Local,
            writable,
            definition: None,
        });
        handle
    }

    /// Sets (or replaces) the contents of a declared data object.
    pub fn define_data(&mut self, handle: DataHandle, definition: DataDefinition) -> EmitterResult<()> {
        let entry = self
            .data
            .get_mut(handle.0 as usize)
            .ok_or_else(|| EmitterError::UnknownSymbol(format!("data #{}", handle.0)))?;
        entry.definition = Some(definition);
        Ok(())
    }

    /// Declares and defines a data object in one step. The name must be new.
    pub fn add_data(&mut self, name: &str, writable: bool, definition: DataDefinition) -> EmitterResult<DataHandle> {
        if self.data_names.contains_key(name) {
            return Err(EmitterError::DuplicateSymbol(name.to_string()));
        }
        let handle = self.declare_data(name, writable);
        self.define_data(handle, definition)?;
        Ok(handle)
    }

    /// Read-only NUL-terminated string.
    pub fn add_string(&mut self, name: &str, text: &str) -> EmitterResult<DataHandle> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.add_data(name, false, DataDefinition::bytes(bytes, 1))
    }

    pub fn data(&self, name: &str) -> EmitterResult<DataHandle> {
        self.data_names
            .get(name)
            .copied()
            .ok_or_else(|| EmitterError::UnknownSymbol(name.to_string()))
    }

    pub fn data_definition(&self, handle: DataHandle) -> Option<&DataDefinition> {
        self.data.get(handle.0 as usize).and_then(|d| d.definition.as_ref())
    }

    pub fn add_struct(&mut self, decl: StructDecl) {
        if !self.structs.iter().any(|s| s.name == decl.name) {
            self.structs.push(decl);
        }
    }

    pub fn structs(&self) -> &[StructDecl] {
        &self.structs
    }

    pub fn callbacks(&self) -> &[CallbackDecl] {
        &self.callbacks
    }

    pub fn add_header_comment(&mut self, comment: impl Into<String>) {
        self.header_comments.push(comment.into());
    }

    pub fn header_comments(&self) -> &[String] {
        &self.header_comments
    }

    /// Public functions in declaration order, the ones headers describe.
    pub fn public_functions(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.functions.iter().filter(|f| f.public).map(|f| &f.decl)
    }

    /// Every defined function with its body, in declaration order.
    pub fn function_bodies(&self) -> impl Iterator<Item = (&FunctionDecl, &ir::Function)> {
        self.functions
            .iter()
            .filter_map(|f| f.body.as_ref().map(|b| (&f.decl, b)))
    }

    /// Every data object with its name, writability and definition.
    pub fn data_objects(&self) -> impl Iterator<Item = (&str, bool, Option<&DataDefinition>)> {
        self.data
            .iter()
            .map(|d| (d.name.as_str(), d.writable, d.definition.as_ref()))
    }

    pub fn data_name(&self, handle: DataHandle) -> &str {
        &self.data[handle.0 as usize].name
    }

    /// Replays every declaration and definition into `module`. Handles map
    /// one-to-one onto the module's ids, which the bodies' external names
    /// rely on.
    pub fn materialize<M: Module>(&self, module: &mut M) -> EmitterResult<(Vec<FuncId>, Vec<DataId>)> {
        let mut func_ids = Vec::with_capacity(self.functions.len());
        for (index, entry) in self.functions.iter().enumerate() {
            let id = module.declare_function(&entry.decl.name, entry.linkage, &entry.signature)?;
            if id.as_u32() as usize != index {
                return Err(EmitterError::Codegen(format!(
                    "function '{}' declared out of order",
                    entry.decl.name
                )));
            }
            func_ids.push(id);
        }

        let mut data_ids = Vec::with_capacity(self.data.len());
        for (index, entry) in self.data.iter().enumerate() {
            let id = module.declare_data(&entry.name, entry.linkage, entry.writable, false)?;
            if id.as_u32() as usize != index {
                return Err(EmitterError::Codegen(format!(
                    "data '{}' declared out of order",
                    entry.name
                )));
            }
            data_ids.push(id);
        }

        for (entry, &id) in self.data.iter().zip(&data_ids) {
            let definition = entry
                .definition
                .as_ref()
                .ok_or_else(|| EmitterError::UnknownSymbol(format!("data '{}' has no definition", entry.name)))?;
            let mut description = DataDescription::new();
            match &definition.contents {
                // Zero-sized objects would alias their neighbours.
                DataContents::Zero(size) => description.define_zeroinit((*size).max(8)),
                DataContents::Bytes(bytes) => description.define(bytes.clone().into_boxed_slice()),
            }
            description.set_align(definition.align);
            for &(offset, target, addend) in &definition.data_relocs {
                let gv = module.declare_data_in_data(data_ids[target.0 as usize], &mut description);
                description.write_data_addr(offset, gv, addend);
            }
            module.define_data(id, &description)?;
        }

        let mut ctx = module.make_context();
        for (entry, &id) in self.functions.iter().zip(&func_ids) {
            if entry.linkage == Linkage::Import {
                continue;
            }
            let body = entry
                .body
                .as_ref()
                .ok_or_else(|| EmitterError::UnknownSymbol(format!("function '{}' has no body", entry.decl.name)))?;
            ctx.func = body.clone();
            module
                .define_function(id, &mut ctx)
                .map_err(|e| EmitterError::Codegen(format!("Failed to define '{}': {:?}", entry.decl.name, e)))?;
            module.clear_context(&mut ctx);
        }

        Ok((func_ids, data_ids))
    }

    /// Builds a JIT module with `symbols` resolvable by name.
    pub fn jit(&self, symbols: &[(String, *const u8)]) -> EmitterResult<(JITModule, Vec<FuncId>, Vec<DataId>)> {
        let mut builder = JITBuilder::with_isa(self.isa.clone(), cranelift_module::default_libcall_names());
        for (name, address) in symbols {
            builder.symbol(name.clone(), *address);
        }
        let mut module = JITModule::new(builder);
        let (func_ids, data_ids) = self.materialize(&mut module)?;
        module
            .finalize_definitions()
            .map_err(|e| EmitterError::Codegen(format!("Failed to finalize: {}", e)))?;
        Ok((module, func_ids, data_ids))
    }

    /// Relocatable object code for the host target.
    pub fn object_code(&self) -> EmitterResult<Vec<u8>> {
        let builder = ObjectBuilder::new(
            self.isa.clone(),
            self.name.as_bytes().to_vec(),
            cranelift_module::default_libcall_names(),
        )?;
        let mut module = ObjectModule::new(builder);
        self.materialize(&mut module)?;
        module
            .finish()
            .emit()
            .map_err(|e| EmitterError::Object(e.to_string()))
    }
}

/// External name a function body uses to reference `handle`.
pub(crate) fn function_external_name(handle: FunctionHandle) -> UserExternalName {
    UserExternalName::new(FUNCTION_NAMESPACE, handle.0)
}

/// External name a function body uses to reference `handle`.
pub(crate) fn data_external_name(handle: DataHandle) -> UserExternalName {
    UserExternalName::new(DATA_NAMESPACE, handle.0)
}
