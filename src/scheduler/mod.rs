//! Interface to the machinery that turns a primitive function into
//! low-level definitions. The lowering stage only orchestrates; how a
//! schedule is built is the scheduler's business.

mod reference;

pub use reference::ReferenceScheduler;

use telc_ir::{Function, GlobalVar, IrModule, PrimFunc, ShapeParamState, Target, TensorType};

use crate::error::Result;

/// A formal tensor of a scheduled function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDecl {
    pub name: String,
    pub ty: TensorType,
}

impl TensorDecl {
    pub fn new(name: impl Into<String>, ty: TensorType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// One compute stage of a schedule: `output = op(inputs...)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stage {
    pub op: String,
    pub output: TensorDecl,
    pub inputs: Vec<String>,
}

/// What the scheduler hands back for one `(function, target)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledFunc {
    /// Entry global, named through the resolver the cache supplied.
    pub prim_fn_var: GlobalVar,
    pub inputs: Vec<TensorDecl>,
    pub outputs: Vec<TensorDecl>,
    pub stages: Vec<Stage>,
    /// Set when the scheduler already produced the finished function and no
    /// schedule lowering is needed.
    pub prim_func: Option<PrimFunc>,
    pub shape_func_param_states: Vec<ShapeParamState>,
}

impl ScheduledFunc {
    /// Inputs followed by outputs, the argument order of the lowered entry.
    pub fn all_args(&self) -> impl Iterator<Item = &TensorDecl> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

/// Definitions produced by lowering a schedule. Schedulers mint their own
/// globals; `entry` names the one implementing the scheduled function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweredSchedule {
    pub entry: GlobalVar,
    pub funcs: IrModule,
}

/// Turns names a scheduler wants into names unique in the module being
/// lowered.
pub type NameResolver<'a> = dyn FnMut(&str) -> String + 'a;

/// Collaborator producing low-level definitions. Must be deterministic: the
/// same function and target always yield the same result.
pub trait Scheduler: Send + Sync {
    fn schedule(
        &self,
        source: &Function,
        target: &Target,
        names: &mut NameResolver<'_>,
    ) -> Result<ScheduledFunc>;

    /// Schedules the function computing the output shapes of `source` from
    /// its input shapes and, where needed, input data.
    fn schedule_shape_func(
        &self,
        source: &Function,
        target: &Target,
        names: &mut NameResolver<'_>,
    ) -> Result<ScheduledFunc>;

    fn lower_schedule(&self, scheduled: &ScheduledFunc, func_name: &str)
    -> Result<LoweredSchedule>;
}
