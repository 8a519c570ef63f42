//! Rewrites calls to primitive and external functions into lowered calls.

mod classify;
mod rewriter;
mod scope;

pub use classify::{CallTarget, classify, resolve};
pub use rewriter::{AnnotatedFunction, LoweringAnnotation, LoweringRewriter};
pub use scope::LetScope;

use telc_ir::{BaseFunc, Function, IrModule, Target};
use tracing::debug;

use crate::compiler::CompilationCache;
use crate::error::Result;

/// Whether a top-level function is left to other stages: primitives are
/// lowered where they are called, and external functions and their stubs
/// belong to the dispatcher.
pub fn is_skipped(function: &Function) -> bool {
    function.is_primitive() || function.is_external() || function.is_external_stub()
}

/// Rewrites the body of every top-level high-level function of `module`,
/// lowering what they call through `cache`. Prim funcs and skipped
/// functions are copied unchanged.
pub fn lower_tensor_exprs<F>(
    module: &IrModule,
    cache: &CompilationCache,
    module_name: &str,
    host_target: &Target,
    process_fn: F,
) -> Result<IrModule>
where
    F: FnMut(AnnotatedFunction) -> Result<()>,
{
    let mut rewriter = LoweringRewriter::new(module, cache, module_name, host_target, process_fn);
    let mut lowered = IrModule::with_attrs(module.attrs.clone());
    for (var, func) in module.iter() {
        let func = match func {
            BaseFunc::Function(function) if !is_skipped(function) => {
                debug!(global = %var, "rewriting function");
                BaseFunc::from(rewriter.rewrite_function(function)?)
            }
            other => other.clone(),
        };
        lowered.update(var.clone(), func);
    }
    Ok(lowered)
}
