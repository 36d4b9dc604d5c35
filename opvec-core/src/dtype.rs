use std::fmt::{self, Debug, Display};

use crate::storage::Storage;

/// Element type of an expression or tensor.
///
/// `Bool` only exists inside expression graphs: it is the result type of comparisons and logic
/// and cannot be the element type of an input or output buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl ScalarType {
    /// Every type that can back a tensor.
    pub const NUMERIC: [ScalarType; 10] = [
        ScalarType::I8,
        ScalarType::I16,
        ScalarType::I32,
        ScalarType::I64,
        ScalarType::U8,
        ScalarType::U16,
        ScalarType::U32,
        ScalarType::U64,
        ScalarType::F32,
        ScalarType::F64,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// The C/C++ spelling used by the generated sources.
    pub fn c_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "int8_t",
            Self::I16 => "int16_t",
            Self::I32 => "int32_t",
            Self::I64 => "int64_t",
            Self::U8 => "uint8_t",
            Self::U16 => "uint16_t",
            Self::U32 => "uint32_t",
            Self::U64 => "uint64_t",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 8,
            Self::I16 | Self::U16 => 16,
            Self::I32 | Self::U32 | Self::F32 => 32,
            Self::I64 | Self::U64 | Self::F64 => 64,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.bits() as usize / 8
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn is_integral(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    /// Result type of combining two operands.
    ///
    /// - `Bool` is below every other type.
    /// - Floats beat integers and the wider float wins.
    /// - Among integers the wider one wins, keeping its signedness. At equal width the
    ///   unsigned type wins, as in C.
    pub fn promote(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        if self.is_bool() {
            return other;
        }
        if other.is_bool() {
            return self;
        }
        match (self.is_float(), other.is_float()) {
            (true, true) => {
                if self.bits() >= other.bits() {
                    self
                } else {
                    other
                }
            }
            (true, false) => self,
            (false, true) => other,
            (false, false) => {
                if self.bits() != other.bits() {
                    if self.bits() > other.bits() {
                        self
                    } else {
                        other
                    }
                } else if self.is_unsigned() {
                    self
                } else {
                    other
                }
            }
        }
    }

    /// Type in which float-only functions (`exp`, `power`, ...) are evaluated.
    pub fn float_of(self) -> Self {
        match self {
            Self::F32 => Self::F32,
            _ => Self::F64,
        }
    }

    /// Unsigned type used to carry out wrapping integer arithmetic.
    pub(crate) fn wrapping_carrier(self) -> Self {
        match self.bits() {
            64 => Self::U64,
            _ => Self::U32,
        }
    }
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A literal value embedded in an expression graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Scalar {
    /// The type a literal has when nothing else constrains it.
    pub fn natural_type(&self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::Int(_) => ScalarType::I64,
            Self::UInt(_) => ScalarType::U64,
            Self::Float(_) => ScalarType::F64,
        }
    }

    /// The type a literal takes when combined with an expression of type `other`.
    ///
    /// Integer literals adopt the expression's type. Float literals adopt it only when it is a
    /// float, otherwise they stay `F64`.
    pub fn weak_type(&self, other: ScalarType) -> ScalarType {
        match self {
            Self::Float(_) if !other.is_float() => ScalarType::F64,
            Self::Bool(_) => other,
            _ if other.is_bool() => self.natural_type(),
            _ => other,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(v) => v as u8 as f64,
            Self::Int(v) => v as f64,
            Self::UInt(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    fn as_i64(&self) -> i64 {
        match *self {
            Self::Bool(v) => v as i64,
            Self::Int(v) => v,
            Self::UInt(v) => v as i64,
            Self::Float(v) => v as i64,
        }
    }

    fn as_u64(&self) -> u64 {
        match *self {
            Self::Bool(v) => v as u64,
            Self::Int(v) => v as u64,
            Self::UInt(v) => v,
            Self::Float(v) => v as u64,
        }
    }

    /// Convert the literal into a value representable by `dtype`, the way a C cast would.
    pub fn cast(&self, dtype: ScalarType) -> Scalar {
        match dtype {
            ScalarType::Bool => Scalar::Bool(self.as_f64() != 0.0),
            ScalarType::I8 => Scalar::Int(self.as_i64() as i8 as i64),
            ScalarType::I16 => Scalar::Int(self.as_i64() as i16 as i64),
            ScalarType::I32 => Scalar::Int(self.as_i64() as i32 as i64),
            ScalarType::I64 => Scalar::Int(self.as_i64()),
            ScalarType::U8 => Scalar::UInt(self.as_u64() as u8 as u64),
            ScalarType::U16 => Scalar::UInt(self.as_u64() as u16 as u64),
            ScalarType::U32 => Scalar::UInt(self.as_u64() as u32 as u64),
            ScalarType::U64 => Scalar::UInt(self.as_u64()),
            ScalarType::F32 => Scalar::Float(self.as_f64() as f32 as f64),
            ScalarType::F64 => Scalar::Float(self.as_f64()),
        }
    }

    /// C++ source spelling of this literal as a value of `dtype`.
    pub fn c_literal(&self, dtype: ScalarType) -> String {
        match self.cast(dtype) {
            Scalar::Bool(v) => v.to_string(),
            Scalar::Int(v) => {
                let lit = if v == i64::MIN {
                    "(-9223372036854775807LL - 1)".to_string()
                } else {
                    format!("{v}LL")
                };
                format!("static_cast<{}>({lit})", dtype.c_name())
            }
            Scalar::UInt(v) => format!("static_cast<{}>({v}ULL)", dtype.c_name()),
            Scalar::Float(v) => {
                let suffix = if dtype == ScalarType::F32 { "f" } else { "" };
                if v.is_nan() {
                    format!("static_cast<{}>(NAN)", dtype.c_name())
                } else if v.is_infinite() {
                    let sign = if v < 0.0 { "-" } else { "" };
                    format!("{sign}static_cast<{}>(INFINITY)", dtype.c_name())
                } else if dtype == ScalarType::F32 {
                    format!("{:?}{suffix}", v as f32)
                } else {
                    format!("{v:?}")
                }
            }
        }
    }
}

macro_rules! scalar_from {
    ($variant:ident, $via:ty, $($t:ty),+) => {
        $(
            impl From<$t> for Scalar {
                fn from(value: $t) -> Self {
                    Scalar::$variant(value as $via)
                }
            }
        )+
    };
}

scalar_from!(Int, i64, i8, i16, i32, i64, isize);
scalar_from!(UInt, u64, u8, u16, u32, u64, usize);
scalar_from!(Float, f64, f32, f64);

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Marker trait for Rust element types that can back a [`crate::Tensor`].
pub trait DType: Debug + Copy + Default + PartialEq + Send + Sync + 'static {
    const SCALAR: ScalarType;

    fn to_f64(&self) -> f64;
    fn from_f64(x: f64) -> Self;

    fn into_storage(data: Vec<Self>) -> Storage;
    fn slice(storage: &Storage) -> Option<&[Self]>;
}

macro_rules! dtype {
    ($rt:ident, $variant:ident) => {
        impl DType for $rt {
            const SCALAR: ScalarType = ScalarType::$variant;

            fn to_f64(&self) -> f64 {
                *self as f64
            }
            fn from_f64(x: f64) -> Self {
                x as $rt
            }

            fn into_storage(data: Vec<Self>) -> Storage {
                Storage::$variant(data)
            }
            fn slice(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(data) => Some(data),
                    _ => None,
                }
            }
        }
    };
}

dtype!(i8, I8);
dtype!(i16, I16);
dtype!(i32, I32);
dtype!(i64, I64);
dtype!(u8, U8);
dtype!(u16, U16);
dtype!(u32, U32);
dtype!(u64, U64);
dtype!(f32, F32);
dtype!(f64, F64);
