use cranelift::prelude::{types, AbiParam, Signature, Type};
use cranelift_codegen::isa::CallConv;

use crate::model::PortType;

/// Cranelift type holding one element of `port_type`. Booleans are bytes.
pub fn ir_type(port_type: PortType) -> Type {
    match port_type {
        PortType::Boolean => types::I8,
        PortType::Integer => types::I32,
        PortType::BigInt => types::I64,
        PortType::SmallReal => types::F32,
        PortType::Real => types::F64,
    }
}

/// C-level type of a function parameter, return value or struct field.
/// Used both to build Cranelift signatures and to write headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CType {
    Void,
    Bool,
    Int32,
    Int64,
    Float,
    Double,
    Char,
    Pointer(Box<CType>),
    ConstPointer(Box<CType>),
    Named(String),
}

impl CType {
    pub fn from_port_type(port_type: PortType) -> Self {
        match port_type {
            PortType::Boolean => CType::Bool,
            PortType::Integer => CType::Int32,
            PortType::BigInt => CType::Int64,
            PortType::SmallReal => CType::Float,
            PortType::Real => CType::Double,
        }
    }

    pub fn void_ptr() -> Self {
        CType::Pointer(Box::new(CType::Void))
    }

    pub fn ptr(self) -> Self {
        CType::Pointer(Box::new(self))
    }

    pub fn const_ptr(self) -> Self {
        CType::ConstPointer(Box::new(self))
    }

    /// Register type used to pass a value of this type; `None` for `void`
    /// and for structs, which only travel behind pointers.
    pub fn ir_type(&self, pointer_type: Type) -> Option<Type> {
        match self {
            CType::Void | CType::Named(_) => None,
            CType::Bool | CType::Char => Some(types::I8),
            CType::Int32 => Some(types::I32),
            CType::Int64 => Some(types::I64),
            CType::Float => Some(types::F32),
            CType::Double => Some(types::F64),
            CType::Pointer(_) | CType::ConstPointer(_) => Some(pointer_type),
        }
    }

    pub fn render(&self) -> String {
        match self {
            CType::Void => "void".to_string(),
            CType::Bool => "bool".to_string(),
            CType::Int32 => "int32_t".to_string(),
            CType::Int64 => "int64_t".to_string(),
            CType::Float => "float".to_string(),
            CType::Double => "double".to_string(),
            CType::Char => "char".to_string(),
            CType::Pointer(inner) => format!("{}*", inner.render()),
            CType::ConstPointer(inner) => format!("const {}*", inner.render()),
            CType::Named(name) => name.clone(),
        }
    }
}

/// A function's C-level declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub returns: CType,
    pub params: Vec<(String, CType)>,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>, returns: CType) -> Self {
        Self {
            name: name.into(),
            returns,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, ty: CType) -> Self {
        self.params.push((name.into(), ty));
        self
    }

    pub fn signature(&self, pointer_type: Type, call_conv: CallConv) -> Signature {
        let mut signature = Signature::new(call_conv);
        for (_, ty) in &self.params {
            if let Some(ir) = ty.ir_type(pointer_type) {
                signature.params.push(AbiParam::new(ir));
            }
        }
        if let Some(ir) = self.returns.ir_type(pointer_type) {
            signature.returns.push(AbiParam::new(ir));
        }
        signature
    }

    /// `double* ELL_Foo(int32_t index)`
    pub fn c_prototype(&self) -> String {
        let params = if self.params.is_empty() {
            "void".to_string()
        } else {
            self.params
                .iter()
                .map(|(name, ty)| format!("{} {}", ty.render(), name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!("{} {}({})", self.returns.render(), self.name, params)
    }
}

/// A C struct emitted into headers.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<(String, CType)>,
}

impl StructDecl {
    pub fn new(name: impl Into<String>, fields: Vec<(&str, CType)>) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(|(n, t)| (n.to_string(), t)).collect(),
        }
    }

    pub fn c_definition(&self) -> String {
        let mut out = format!("typedef struct {}\n{{\n", self.name);
        for (name, ty) in &self.fields {
            out.push_str(&format!("    {} {};\n", ty.render(), name));
        }
        out.push_str(&format!("}} {};\n", self.name));
        out
    }
}
