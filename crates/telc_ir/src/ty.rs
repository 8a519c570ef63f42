use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl DType {
    pub fn bits(self) -> u32 {
        match self {
            DType::Bool => 1,
            DType::Int8 | DType::UInt8 => 8,
            DType::Int16 | DType::UInt16 | DType::Float16 | DType::BFloat16 => 16,
            DType::Int32 | DType::UInt32 | DType::Float32 => 32,
            DType::Int64 | DType::Float64 => 64,
        }
    }

    /// Storage width in bytes; sub-byte types still occupy a full byte.
    pub fn bytes(self) -> u64 {
        u64::from(self.bits().div_ceil(8))
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single tensor extent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Dim {
    Fixed(u64),
    /// Unknown until run time.
    Any,
    /// Bound to a symbolic size variable.
    Var(String),
}

impl Dim {
    pub fn as_fixed(&self) -> Option<u64> {
        match self {
            Dim::Fixed(extent) => Some(*extent),
            Dim::Any | Dim::Var(_) => None,
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Dim::Fixed(_))
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(extent) => write!(f, "{extent}"),
            Dim::Any => f.write_str("?"),
            Dim::Var(name) => f.write_str(name),
        }
    }
}

/// Product of the extents, or `None` when any extent is not statically known
/// or the product does not fit in a `u64`.
pub fn static_element_count(shape: &[Dim]) -> Option<u64> {
    shape
        .iter()
        .try_fold(1u64, |acc, dim| acc.checked_mul(dim.as_fixed()?))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub shape: Vec<Dim>,
    pub dtype: DType,
}

impl TensorType {
    pub fn new(shape: Vec<Dim>, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    pub fn fixed(shape: &[u64], dtype: DType) -> Self {
        Self::new(shape.iter().copied().map(Dim::Fixed).collect(), dtype)
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(Vec::new(), dtype)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(|dim| !dim.is_static())
    }

    pub fn size_bytes(&self) -> Option<u64> {
        static_element_count(&self.shape)?.checked_mul(self.dtype.bytes())
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tensor[(")?;
        for (idx, dim) in self.shape.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "), {}]", self.dtype)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Type {
    Tensor(TensorType),
    Tuple(Vec<Type>),
    Func {
        params: Vec<Type>,
        ret: Box<Type>,
    },
    #[default]
    Unknown,
}

impl Type {
    /// True when any tensor reachable from this type has a non-static extent.
    pub fn is_dynamic(&self) -> bool {
        match self {
            Type::Tensor(tensor) => tensor.is_dynamic(),
            Type::Tuple(fields) => fields.iter().any(Type::is_dynamic),
            Type::Func { .. } | Type::Unknown => false,
        }
    }

    /// Tensor leaves in left-to-right order.
    pub fn flatten(&self) -> Vec<&TensorType> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }

    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a TensorType>) {
        match self {
            Type::Tensor(tensor) => out.push(tensor),
            Type::Tuple(fields) => fields.iter().for_each(|field| field.collect_tensors(out)),
            Type::Func { .. } | Type::Unknown => {}
        }
    }
}

impl From<TensorType> for Type {
    fn from(value: TensorType) -> Self {
        Type::Tensor(value)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Tensor(tensor) => write!(f, "{tensor}"),
            Type::Tuple(fields) => {
                f.write_str("(")?;
                for (idx, field) in fields.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}")?;
                }
                f.write_str(")")
            }
            Type::Func { params, ret } => {
                f.write_str("fn (")?;
                for (idx, param) in params.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ") -> {ret}")
            }
            Type::Unknown => f.write_str("?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_need_static_extents() {
        let fixed = TensorType::fixed(&[2, 3], DType::Float32);
        assert_eq!(fixed.size_bytes(), Some(24));
        let dynamic = TensorType::new(vec![Dim::Fixed(2), Dim::Any], DType::Float32);
        assert_eq!(dynamic.size_bytes(), None);
    }

    #[test]
    fn oversized_tensors_have_no_size() {
        let huge = TensorType::fixed(&[1 << 40, 1 << 40], DType::Float32);
        assert_eq!(static_element_count(&huge.shape), None);
        assert_eq!(huge.size_bytes(), None);

        // The element count fits, the byte count does not.
        let wide = TensorType::fixed(&[1 << 62], DType::Float32);
        assert_eq!(static_element_count(&wide.shape), Some(1 << 62));
        assert_eq!(wide.size_bytes(), None);
    }
}
