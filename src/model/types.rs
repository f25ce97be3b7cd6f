use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! { pub struct NodeKey; }

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1000);

/// Process-unique node identity. Keys are local to one model; ids survive copies
/// only through the archive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Element type tag carried by every port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortType {
    Boolean,
    Integer,
    BigInt,
    SmallReal,
    Real,
}

impl PortType {
    /// Size in bytes of one element in compiled code.
    pub fn byte_size(self) -> usize {
        match self {
            PortType::Boolean => 1,
            PortType::Integer | PortType::SmallReal => 4,
            PortType::BigInt | PortType::Real => 8,
        }
    }

    /// Name used in composite node type names, e.g. `UnaryOperationNode<double>`.
    pub fn type_name(self) -> &'static str {
        match self {
            PortType::Boolean => "bool",
            PortType::Integer => "int",
            PortType::BigInt => "int64",
            PortType::SmallReal => "float",
            PortType::Real => "double",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(PortType::Boolean),
            "int" => Some(PortType::Integer),
            "int64" => Some(PortType::BigInt),
            "float" => Some(PortType::SmallReal),
            "double" => Some(PortType::Real),
            _ => None,
        }
    }

    pub fn is_real(self) -> bool {
        matches!(self, PortType::SmallReal | PortType::Real)
    }

    pub fn is_integral(self) -> bool {
        matches!(self, PortType::Integer | PortType::BigInt)
    }

    /// Composite type name for a node kind over this element type.
    pub fn composite_name(self, kind: &str) -> String {
        format!("{}<{}>", kind, self.type_name())
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Plain element types that can flow through ports.
pub trait Element:
    Copy + Default + PartialEq + fmt::Debug + Send + Sync + Serialize + 'static
{
    const PORT_TYPE: PortType;

    fn wrap(values: Vec<Self>) -> PortValues;
    fn view(values: &PortValues) -> Option<&[Self]>;
    fn view_mut(values: &mut PortValues) -> Option<&mut [Self]>;
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
    fn write_bytes(self, out: &mut Vec<u8>);
}

/// Element types with arithmetic.
pub trait Numeric: Element + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> {
    fn zero() -> Self;
    fn one() -> Self;
    fn negate(self) -> Self;
    fn abs_value(self) -> Self;
    /// Arithmetic matching compiled code: integers wrap on overflow.
    fn plus(self, rhs: Self) -> Self;
    fn minus(self, rhs: Self) -> Self;
    fn times(self, rhs: Self) -> Self;
    /// Division; integer division by zero yields zero and overflow wraps.
    fn divide(self, rhs: Self) -> Self;
}

/// Floating-point element types.
pub trait Real: Numeric {
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn tanh(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const PORT_TYPE: PortType = PortType::$variant;

            fn wrap(values: Vec<Self>) -> PortValues {
                PortValues::$variant(values)
            }

            fn view(values: &PortValues) -> Option<&[Self]> {
                match values {
                    PortValues::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn view_mut(values: &mut PortValues) -> Option<&mut [Self]> {
                match values {
                    PortValues::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value as $t
            }

            fn write_bytes(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }
        }
    };
}

impl_element!(i32, Integer);
impl_element!(i64, BigInt);
impl_element!(f32, SmallReal);
impl_element!(f64, Real);

impl Element for bool {
    const PORT_TYPE: PortType = PortType::Boolean;

    fn wrap(values: Vec<Self>) -> PortValues {
        PortValues::Boolean(values)
    }

    fn view(values: &PortValues) -> Option<&[Self]> {
        match values {
            PortValues::Boolean(v) => Some(v),
            _ => None,
        }
    }

    fn view_mut(values: &mut PortValues) -> Option<&mut [Self]> {
        match values {
            PortValues::Boolean(v) => Some(v),
            _ => None,
        }
    }

    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }

    fn from_f64(value: f64) -> Self {
        value != 0.0
    }

    fn write_bytes(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
}

macro_rules! impl_integral {
    ($t:ty) => {
        impl Numeric for $t {
            fn zero() -> Self {
                0
            }
            fn one() -> Self {
                1
            }
            fn negate(self) -> Self {
                self.wrapping_neg()
            }
            fn abs_value(self) -> Self {
                self.wrapping_abs()
            }
            fn plus(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn minus(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn times(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn divide(self, rhs: Self) -> Self {
                if rhs == 0 {
                    0
                } else {
                    self.wrapping_div(rhs)
                }
            }
        }
    };
}

impl_integral!(i32);
impl_integral!(i64);

macro_rules! impl_real {
    ($t:ty) => {
        impl Numeric for $t {
            fn zero() -> Self {
                0.0
            }
            fn one() -> Self {
                1.0
            }
            fn negate(self) -> Self {
                -self
            }
            fn abs_value(self) -> Self {
                self.abs()
            }
            fn plus(self, rhs: Self) -> Self {
                self + rhs
            }
            fn minus(self, rhs: Self) -> Self {
                self - rhs
            }
            fn times(self, rhs: Self) -> Self {
                self * rhs
            }
            fn divide(self, rhs: Self) -> Self {
                self / rhs
            }
        }

        impl Real for $t {
            fn exp(self) -> Self {
                <$t>::exp(self)
            }
            fn ln(self) -> Self {
                <$t>::ln(self)
            }
            fn sqrt(self) -> Self {
                <$t>::sqrt(self)
            }
            fn tanh(self) -> Self {
                <$t>::tanh(self)
            }
            fn sin(self) -> Self {
                <$t>::sin(self)
            }
            fn cos(self) -> Self {
                <$t>::cos(self)
            }
        }
    };
}

impl_real!(f32);
impl_real!(f64);

/// Runs `$body` with `$T` bound to the Rust element type of `$port_type`.
#[macro_export]
macro_rules! with_element_type {
    ($port_type:expr, $T:ident => $body:expr) => {
        match $port_type {
            $crate::model::PortType::Boolean => {
                type $T = bool;
                $body
            }
            $crate::model::PortType::Integer => {
                type $T = i32;
                $body
            }
            $crate::model::PortType::BigInt => {
                type $T = i64;
                $body
            }
            $crate::model::PortType::SmallReal => {
                type $T = f32;
                $body
            }
            $crate::model::PortType::Real => {
                type $T = f64;
                $body
            }
        }
    };
}

/// A typed vector of port values, the unit the interpreter passes between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PortValues {
    Boolean(Vec<bool>),
    Integer(Vec<i32>),
    BigInt(Vec<i64>),
    SmallReal(Vec<f32>),
    Real(Vec<f64>),
}

impl PortValues {
    pub fn zeros(port_type: PortType, size: usize) -> Self {
        with_element_type!(port_type, T => T::wrap(vec![T::default(); size]))
    }

    /// Converts from doubles, truncating or rounding the way `as` casts do.
    pub fn from_f64(port_type: PortType, values: &[f64]) -> Self {
        with_element_type!(port_type, T => T::wrap(values.iter().map(|&v| T::from_f64(v)).collect()))
    }

    pub fn port_type(&self) -> PortType {
        match self {
            PortValues::Boolean(_) => PortType::Boolean,
            PortValues::Integer(_) => PortType::Integer,
            PortValues::BigInt(_) => PortType::BigInt,
            PortValues::SmallReal(_) => PortType::SmallReal,
            PortValues::Real(_) => PortType::Real,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PortValues::Boolean(v) => v.len(),
            PortValues::Integer(v) => v.len(),
            PortValues::BigInt(v) => v.len(),
            PortValues::SmallReal(v) => v.len(),
            PortValues::Real(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(self)
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        T::view_mut(self)
    }

    /// Converts to another element type through `f64`.
    pub fn convert(&self, port_type: PortType) -> PortValues {
        if self.port_type() == port_type {
            return self.clone();
        }
        PortValues::from_f64(port_type, &self.to_f64_vec())
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            PortValues::Boolean(v) => v.iter().map(|&x| x.to_f64()).collect(),
            PortValues::Integer(v) => v.iter().map(|&x| x as f64).collect(),
            PortValues::BigInt(v) => v.iter().map(|&x| x as f64).collect(),
            PortValues::SmallReal(v) => v.iter().map(|&x| x as f64).collect(),
            PortValues::Real(v) => v.clone(),
        }
    }

    /// Copies `count` elements starting at `start`.
    pub fn slice(&self, start: usize, count: usize) -> PortValues {
        match self {
            PortValues::Boolean(v) => PortValues::Boolean(v[start..start + count].to_vec()),
            PortValues::Integer(v) => PortValues::Integer(v[start..start + count].to_vec()),
            PortValues::BigInt(v) => PortValues::BigInt(v[start..start + count].to_vec()),
            PortValues::SmallReal(v) => PortValues::SmallReal(v[start..start + count].to_vec()),
            PortValues::Real(v) => PortValues::Real(v[start..start + count].to_vec()),
        }
    }

    /// Appends `other`; both sides must carry the same element type.
    pub fn extend_from(&mut self, other: &PortValues) -> bool {
        match (self, other) {
            (PortValues::Boolean(a), PortValues::Boolean(b)) => a.extend_from_slice(b),
            (PortValues::Integer(a), PortValues::Integer(b)) => a.extend_from_slice(b),
            (PortValues::BigInt(a), PortValues::BigInt(b)) => a.extend_from_slice(b),
            (PortValues::SmallReal(a), PortValues::SmallReal(b)) => a.extend_from_slice(b),
            (PortValues::Real(a), PortValues::Real(b)) => a.extend_from_slice(b),
            _ => return false,
        }
        true
    }

    /// Native-endian byte image, the layout compiled code uses for globals.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.port_type().byte_size());
        match self {
            PortValues::Boolean(v) => v.iter().for_each(|x| x.write_bytes(&mut out)),
            PortValues::Integer(v) => v.iter().for_each(|x| x.write_bytes(&mut out)),
            PortValues::BigInt(v) => v.iter().for_each(|x| x.write_bytes(&mut out)),
            PortValues::SmallReal(v) => v.iter().for_each(|x| x.write_bytes(&mut out)),
            PortValues::Real(v) => v.iter().for_each(|x| x.write_bytes(&mut out)),
        }
        out
    }
}

impl<T: Element> From<Vec<T>> for PortValues {
    fn from(values: Vec<T>) -> Self {
        T::wrap(values)
    }
}

/// Logical 3-D layout of a port: rows × columns × channels, channels fastest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    pub rows: usize,
    pub columns: usize,
    pub channels: usize,
}

impl TensorShape {
    pub fn new(rows: usize, columns: usize, channels: usize) -> Self {
        Self {
            rows,
            columns,
            channels,
        }
    }

    /// A flat vector of `size` elements.
    pub fn vector(size: usize) -> Self {
        Self::new(size, 1, 1)
    }

    pub fn size(&self) -> usize {
        self.rows * self.columns * self.channels
    }
}

/// String-keyed metadata carried by nodes and maps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBag(BTreeMap<String, serde_json::Value>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}
