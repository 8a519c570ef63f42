use telc_ir::{GlobalVar, IrModule, PrimFunc, ShapeParamState, Target};

use crate::scheduler::TensorDecl;

/// The lowered form of one compilation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFunc {
    pub target: Target,
    /// Entry global callers are rewritten to.
    pub prim_fn_var: GlobalVar,
    pub inputs: Vec<TensorDecl>,
    pub outputs: Vec<TensorDecl>,
    /// The finished entry when the scheduler produced it directly.
    pub prim_func: Option<PrimFunc>,
    /// Every definition belonging to the entry, the entry included. For an
    /// external function this is the original high-level function alone.
    pub funcs: IrModule,
    pub shape_func_param_states: Vec<ShapeParamState>,
}

impl CachedFunc {
    pub fn is_external(&self) -> bool {
        self.target.is_ext_dev()
    }
}

/// Cache slot for one key: the lowering result once it exists, and how many
/// times the key has been looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedArtifact {
    pub cached_func: Option<CachedFunc>,
    pub use_count: u64,
}

impl CachedArtifact {
    pub fn with_use_count(use_count: u64) -> Self {
        Self {
            cached_func: None,
            use_count,
        }
    }
}
