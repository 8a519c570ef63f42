use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::target::Target;
use crate::ty::{DType, Dim, TensorType, static_element_count};

/// A formal parameter of a low-level function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimParam {
    pub name: String,
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Buffer {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<Dim>,
}

impl Buffer {
    pub fn new(name: impl Into<String>, tensor: &TensorType) -> Self {
        Self {
            name: name.into(),
            dtype: tensor.dtype,
            shape: tensor.shape.clone(),
        }
    }

    /// Bytes of the buffer: zero when any extent is symbolic, `None` when the
    /// size overflows.
    pub fn size_bytes_or_zero(&self) -> Option<u64> {
        if self.shape.iter().any(|dim| !dim.is_static()) {
            return Some(0);
        }
        static_element_count(&self.shape)?.checked_mul(self.dtype.bytes())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageScope {
    #[default]
    Global,
    Shared,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Allocate {
    pub buffer: String,
    pub dtype: DType,
    pub extents: Vec<Dim>,
    #[serde(default)]
    pub scope: StorageScope,
    pub body: Box<Stmt>,
}

/// Low-level statements. Only the structure the lowering stage and the
/// memory accounting need is modelled.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stmt {
    Allocate(Allocate),
    Seq(Vec<Stmt>),
    For {
        var: String,
        extent: Dim,
        body: Box<Stmt>,
    },
    /// `output[...] = op(inputs[...])`
    Compute {
        output: String,
        op: String,
        inputs: Vec<String>,
    },
    /// Call into another low-level function.
    CallExtern { callee: String, args: Vec<String> },
    NoOp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimFuncAttrs {
    pub global_symbol: Option<String>,
    pub target: Option<Target>,
    pub extra: BTreeMap<String, String>,
}

/// A finished low-level function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimFunc {
    pub params: Vec<PrimParam>,
    /// Parameter name to the buffer it points at.
    #[serde(default)]
    pub buffer_map: BTreeMap<String, Buffer>,
    pub body: Stmt,
    #[serde(default)]
    pub attrs: PrimFuncAttrs,
}

impl PrimFunc {
    pub fn new(params: Vec<PrimParam>, buffer_map: BTreeMap<String, Buffer>, body: Stmt) -> Self {
        Self {
            params,
            buffer_map,
            body,
            attrs: PrimFuncAttrs::default(),
        }
    }

    /// Builds a function whose parameters are exactly the given buffers, one
    /// handle per buffer.
    pub fn from_buffers(buffers: Vec<Buffer>, body: Stmt) -> Self {
        let mut params = Vec::with_capacity(buffers.len());
        let mut buffer_map = BTreeMap::new();
        for buffer in buffers {
            let handle = format!("{}_handle", buffer.name);
            params.push(PrimParam {
                name: handle.clone(),
                dtype: buffer.dtype,
            });
            buffer_map.insert(handle, buffer);
        }
        Self::new(params, buffer_map, body)
    }

    pub fn target(&self) -> Option<&Target> {
        self.attrs.target.as_ref()
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.attrs.target = Some(target);
        self
    }

    pub fn buffer_for(&self, param: &PrimParam) -> Option<&Buffer> {
        self.buffer_map.get(&param.name)
    }
}
